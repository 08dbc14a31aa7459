//! Session state-machine scenarios against the scripted engine.

use std::sync::Arc;

use masm_dap::debugger::{DebugSession, Phase};
use masm_dap::engine::DebugEngine;

use crate::common::{self, MockEngine, Op, TestEvent};

fn launch(engine: &Arc<MockEngine>) -> (DebugSession, std::sync::mpsc::Receiver<TestEvent>) {
    let (hook, rx) = common::test_hook();
    let session = DebugSession::launch(
        engine.clone() as Arc<dyn DebugEngine>,
        common::SOURCE,
        vec![],
        hook,
    );
    session
        .wait_for_initialization()
        .expect("session initializes");
    (session, rx)
}

#[test]
fn test_launch_run_hit_breakpoint() {
    let engine = MockEngine::sample();
    let (session, rx) = launch(&engine);

    assert!(engine.created());
    assert_eq!(session.phase(), Phase::AwaitingConfigDone);

    let views = session.set_breakpoints(common::SOURCE, vec![2]);
    assert_eq!(views.len(), 1);
    assert!(views[0].verified);

    session.run();

    // the initial break and the WOW64 loader break stay invisible: the
    // first surfaced event is the user breakpoint
    common::expect_event(&rx, TestEvent::Breakpoint);
    assert_eq!(session.phase(), Phase::Stopped);

    session.run();
    common::expect_event(&rx, TestEvent::Exit);
    assert_eq!(session.phase(), Phase::Exited);
}

#[test]
fn test_breakpoints_replace_per_source() {
    let engine = MockEngine::sample();
    let (session, _rx) = launch(&engine);

    let views = session.set_breakpoints(common::SOURCE, vec![2, 4]);
    assert_eq!(views.iter().filter(|view| view.verified).count(), 2);
    assert_eq!(engine.enabled_breakpoints(), 2);

    // a second request for the same source replaces the previous set
    let views = session.set_breakpoints(common::SOURCE, vec![6]);
    assert_eq!(views.len(), 1);
    assert_eq!(engine.enabled_breakpoints(), 1);
    assert_eq!(session.breakpoints().len(), 1);

    // an empty lines list clears the source
    let views = session.set_breakpoints(common::SOURCE, vec![]);
    assert!(views.is_empty());
    assert_eq!(engine.enabled_breakpoints(), 0);
}

#[test]
fn test_unresolved_line_is_unverified() {
    let engine = MockEngine::sample();
    let (session, _rx) = launch(&engine);

    let views = session.set_breakpoints(common::SOURCE, vec![2, 1000]);
    assert!(views[0].verified);
    assert!(!views[1].verified);
    assert_eq!(views[1].id, None);
    assert_eq!(engine.enabled_breakpoints(), 1);
}

#[test]
fn test_pause_then_continue() {
    let engine = MockEngine::with_line5(Op::Spin);
    let (session, rx) = launch(&engine);

    session.run();
    common::expect_no_event(&rx);

    session.pause();
    common::expect_event(&rx, TestEvent::Pause);
    assert_eq!(session.phase(), Phase::Stopped);

    // continuing produces no event until the next break
    session.run();
    common::expect_no_event(&rx);
    assert_eq!(session.phase(), Phase::Running);
}

#[test]
fn test_step_coalesces_same_line_instructions() {
    let engine = MockEngine::sample();
    let (session, rx) = launch(&engine);

    session.set_breakpoints(common::SOURCE, vec![2]);
    session.run();
    common::expect_event(&rx, TestEvent::Breakpoint);

    // line 2 -> line 3: a single instruction
    session.step_over();
    common::expect_event(&rx, TestEvent::Step);

    // line 3 spans three instructions; one `next` crosses all of them and
    // reports exactly one stop
    session.step_over();
    common::expect_event(&rx, TestEvent::Step);
    common::expect_no_event(&rx);

    session.step_over();
    common::expect_event(&rx, TestEvent::Step);
}

#[test]
fn test_step_out_runs_to_return_address() {
    let engine = MockEngine::sample();
    let (session, rx) = launch(&engine);

    session.set_breakpoints(common::SOURCE, vec![2]);
    session.run();
    common::expect_event(&rx, TestEvent::Breakpoint);

    session.step_out();
    common::expect_event(&rx, TestEvent::Breakpoint);
    assert_eq!(session.phase(), Phase::Stopped);

    // the synthesized one-shot is gone; the user breakpoint survives
    assert_eq!(session.breakpoints().len(), 1);
    assert_eq!(engine.enabled_breakpoints(), 1);

    let frames = session.call_stack();
    assert_eq!(frames[0].id, common::RETURN_OFFSET);
}

#[test]
fn test_exception_is_surfaced_with_description() {
    let engine = MockEngine::with_line5(Op::DivZero);
    let (session, rx) = launch(&engine);

    session.run();
    common::expect_event(
        &rx,
        TestEvent::Exception("Integer division by zero".to_string()),
    );
    assert_eq!(session.phase(), Phase::Stopped);

    let info = session.exception_info().expect("exception recorded");
    assert_eq!(info.exception_id, "0xC0000094");
    assert_eq!(info.description, "Integer division by zero");
    assert_eq!(info.type_name, "Exception");
}

#[test]
fn test_no_exception_info_without_exception() {
    let engine = MockEngine::sample();
    let (session, _rx) = launch(&engine);

    assert_eq!(session.exception_info(), None);
}

#[test]
fn test_registers_are_curated_and_formatted() {
    let engine = MockEngine::sample();
    let (session, rx) = launch(&engine);

    session.set_breakpoints(common::SOURCE, vec![2]);
    session.run();
    common::expect_event(&rx, TestEvent::Breakpoint);

    let registers = session.registers();
    let names: Vec<&str> = registers.iter().map(|reg| reg.name.as_str()).collect();
    assert_eq!(
        names,
        ["eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp", "cs", "ds", "ss"]
    );

    let eax = &registers[0];
    assert_eq!(eax.value, "0x2a");
}

#[test]
fn test_eflags_bits_decoded() {
    let engine = MockEngine::sample();
    let (session, rx) = launch(&engine);

    session.set_breakpoints(common::SOURCE, vec![2]);
    session.run();
    common::expect_event(&rx, TestEvent::Breakpoint);

    let flags = session.eflags();
    let rendered: Vec<(&str, &str)> = flags.iter().map(|f| (f.name, f.value)).collect();
    assert_eq!(
        rendered,
        [
            ("CF", "0"),
            ("ZF", "1"),
            ("SF", "0"),
            ("IF", "1"),
            ("DF", "0"),
            ("OF", "0"),
        ]
    );
}

#[test]
fn test_teardown_releases_engine() {
    let engine = MockEngine::sample();
    let (session, rx) = launch(&engine);

    session.set_breakpoints(common::SOURCE, vec![2, 4]);
    assert_eq!(engine.enabled_breakpoints(), 2);

    drop(session);

    // a client-initiated shutdown still reports the session end
    common::expect_event(&rx, TestEvent::Exit);
    common::expect_no_event(&rx);
    assert!(engine.ended());
    assert_eq!(engine.enabled_breakpoints(), 0);
}

#[test]
fn test_exit_is_reported_once_when_target_already_exited() {
    let engine = MockEngine::sample();
    let (session, rx) = launch(&engine);

    session.run();
    common::expect_event(&rx, TestEvent::Exit);

    drop(session);
    common::expect_no_event(&rx);
}

#[test]
fn test_data_requests_after_exit_observe_defaults() {
    let engine = MockEngine::sample();
    let (session, rx) = launch(&engine);

    session.run();
    common::expect_event(&rx, TestEvent::Exit);

    assert!(session.registers().is_empty());
    assert!(session.call_stack().is_empty());
    assert_eq!(session.evaluate("eax"), "");
}
