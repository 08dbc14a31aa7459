//! Stack inspection against the scripted engine's two-frame stack.

use masm_dap::debugger::stack::{call_stack, stack_contents};

use crate::common::{self, MockEngine};

#[test]
fn test_call_stack_resolves_names_and_lines() {
    let engine = MockEngine::sample();

    let frames = call_stack(&*engine).unwrap();
    assert_eq!(frames.len(), 2);

    // innermost frame: the current instruction in compute
    assert_eq!(frames[0].name, "sample!compute");
    assert_eq!(frames[0].id, common::CODE_BASE);
    assert_eq!(frames[0].line, Some(1));
    assert_eq!(
        frames[0].source.as_deref(),
        Some(std::path::Path::new(common::SOURCE))
    );

    // caller frame at the return address inside start
    assert_eq!(frames[1].name, "sample!start");
    assert_eq!(frames[1].id, common::RETURN_OFFSET);
    assert_eq!(frames[1].line, Some(4));
}

#[test]
fn test_call_stack_selects_application_thread() {
    let engine = MockEngine::sample();
    assert_ne!(engine.current_thread(), 4);

    call_stack(&*engine).unwrap();

    // the break-in thread refuses focus; probing lands on the app thread
    assert_eq!(engine.current_thread(), 4);
}

#[test]
fn test_stack_contents_annotations() {
    let engine = MockEngine::sample();

    let entries = stack_contents(&*engine).unwrap();

    // from esp up to the entry routine's frame, plus two words
    assert_eq!(entries.len(), 8);

    assert_eq!(entries[0].address, "Argument/Local Var → 0x0019ff20");
    assert_eq!(entries[0].value, "0x00000005");
    assert_eq!(entries[1].address, "Argument/Local Var → 0x0019ff24");
    assert_eq!(entries[1].value, "0x00000007");

    assert_eq!(entries[2].address, "Saved EBP → 0x0019ff28");
    assert_eq!(entries[2].value, "0x0019ff38");

    assert_eq!(entries[3].address, "Return Address (EIP) → 0x0019ff2c");
    assert_eq!(entries[3].value, "0x0040100f | sample!start+0x3");

    assert_eq!(entries[4].address, "Argument/Local Var → 0x0019ff30");
    assert_eq!(entries[5].address, "Argument/Local Var → 0x0019ff34");

    assert_eq!(entries[6].address, "Saved EBP → 0x0019ff38");
    assert_eq!(entries[6].value, "0x00000000");

    assert_eq!(entries[7].address, "Argument/Local Var → 0x0019ff3c");
    assert_eq!(entries[7].value, "0xdeadbeef");
}
