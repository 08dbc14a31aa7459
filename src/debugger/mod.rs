//! The debug session engine.
//!
//! A single worker thread owns every engine call except `interrupt`. Protocol
//! handlers enqueue [`Command`]s; data commands block their caller on a
//! single-shot reply the worker fulfils. The worker alternates between two
//! suspension points: the wake [`Signal`] (armed by any command that resumes
//! the target) and the engine's blocking `wait_for_event`. Events the engine
//! reports are classified here (the initial process break and the first
//! OS-injected break-in are swallowed, intra-line steps are coalesced) and
//! surfaced to the frontend through an [`EventHook`].

pub mod breakpoint;
pub mod command;
mod error;
pub mod eval;
pub mod register;
pub mod stack;

pub use breakpoint::BreakpointView;
pub use error::Error;
pub use register::{FlagValue, RegisterValue};
pub use stack::{FrameSnapshot, StackEntry};

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::engine::{
    BreakpointKind, CreateFlags, DebugEngine, EventType, ExceptionRecord, ExecutionStatus,
    FilterAction, LastEvent, Processor, WaitOutcome, codes,
};
use crate::sync::Signal;
use crate::weak_error;
use breakpoint::{BreakpointRecord, BreakpointTable};
use command::Command;

/// Observer of session events, driven from the engine worker thread.
pub trait EventHook: Send + 'static {
    fn on_breakpoint(&self) -> anyhow::Result<()>;
    fn on_step(&self) -> anyhow::Result<()>;
    fn on_pause(&self) -> anyhow::Result<()>;
    fn on_exception(&self, description: &str) -> anyhow::Result<()>;
    fn on_exit(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Launching,
    AwaitingConfigDone,
    Running,
    Stopped,
    Exited,
}

impl Phase {
    fn is_broken(self) -> bool {
        matches!(self, Phase::AwaitingConfigDone | Phase::Stopped)
    }
}

/// The last surfaced exception, materialized for `exceptionInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionSnapshot {
    pub exception_id: String,
    pub description: String,
    pub type_name: String,
}

struct State {
    phase: Phase,
    event_count: u64,
    last_line_break: Option<u32>,
    last_exception: Option<ExceptionSnapshot>,
    pause_requested: bool,
    should_exit: bool,
    launch_error: Option<String>,
    breakpoints: BreakpointTable,
}

struct Shared {
    state: Mutex<State>,
    commands: Mutex<VecDeque<Command>>,
    commands_ready: Condvar,
    /// Arms the worker's next `wait_for_event`.
    wake: Signal,
    /// Fired on the first engine event; gates the launch reply.
    initialized: Signal,
}

/// A live debug session over one spawned target.
pub struct DebugSession {
    engine: Arc<dyn DebugEngine>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DebugSession {
    /// Spawn the target and the engine worker. The session is not usable by
    /// the protocol until [`DebugSession::wait_for_initialization`] returns.
    pub fn launch(
        engine: Arc<dyn DebugEngine>,
        program: impl Into<String>,
        args: Vec<String>,
        hook: impl EventHook,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                phase: Phase::Uninitialized,
                event_count: 0,
                last_line_break: None,
                last_exception: None,
                pause_requested: false,
                should_exit: false,
                launch_error: None,
                breakpoints: BreakpointTable::default(),
            }),
            commands: Mutex::new(VecDeque::new()),
            commands_ready: Condvar::new(),
            wake: Signal::new(),
            initialized: Signal::new(),
        });

        let worker = thread::Builder::new()
            .name("engine-worker".to_string())
            .spawn({
                let mut worker = Worker {
                    engine: engine.clone(),
                    shared: shared.clone(),
                    hook,
                    program: program.into(),
                    args,
                    wx86_seen: false,
                    break_injection_seen: false,
                    exit_reported: false,
                };
                move || worker.run()
            })
            .expect("spawn engine worker");

        DebugSession {
            engine,
            shared,
            worker: Some(worker),
        }
    }

    /// Block until the worker has consumed the initial process break (or
    /// failed to launch the target).
    pub fn wait_for_initialization(&self) -> Result<(), Error> {
        self.shared.initialized.wait();
        let state = self.shared.state.lock().unwrap();
        match &state.launch_error {
            Some(err) => Err(Error::Launch(err.clone())),
            None => Ok(()),
        }
    }

    /// Resume the target (`continue` and `configurationDone`).
    pub fn run(&self) {
        self.enqueue(Command::Run);
    }

    /// Interrupt the target. The phase changes only once the resulting break
    /// event arrives and classification reports it.
    pub fn pause(&self) {
        self.shared.state.lock().unwrap().pause_requested = true;
        self.enqueue(Command::Pause);
        weak_error!(self.engine.interrupt());
    }

    pub fn step_over(&self) {
        self.enqueue(Command::StepOver);
    }

    pub fn step_into(&self) {
        self.enqueue(Command::StepInto);
    }

    pub fn step_out(&self) {
        self.enqueue(Command::StepOut);
    }

    /// Replace this source's breakpoints with the given lines.
    pub fn set_breakpoints(&self, source: impl Into<PathBuf>, lines: Vec<u32>) -> Vec<BreakpointView> {
        let source = source.into();
        self.request(|reply| Command::SetBreakpoints {
            source,
            lines,
            reply,
        })
        .unwrap_or_default()
    }

    /// Current breakpoint table, as known to the session.
    pub fn breakpoints(&self) -> Vec<BreakpointView> {
        self.shared.state.lock().unwrap().breakpoints.views()
    }

    pub fn registers(&self) -> Vec<RegisterValue> {
        self.request(|reply| Command::GetRegisters { reply })
            .unwrap_or_default()
    }

    pub fn eflags(&self) -> Vec<FlagValue> {
        self.request(|reply| Command::GetEflags { reply })
            .unwrap_or_default()
    }

    pub fn call_stack(&self) -> Vec<FrameSnapshot> {
        self.request(|reply| Command::GetCallStack { reply })
            .unwrap_or_default()
    }

    pub fn stack_contents(&self) -> Vec<StackEntry> {
        self.request(|reply| Command::GetStackContents { reply })
            .unwrap_or_default()
    }

    pub fn evaluate(&self, expression: impl Into<String>) -> String {
        let expression = expression.into();
        self.request(|reply| Command::Evaluate { expression, reply })
            .unwrap_or_default()
    }

    pub fn evaluate_variable(&self, name: impl Into<String>) -> String {
        let name = name.into();
        self.request(|reply| Command::EvaluateVariable { name, reply })
            .unwrap_or_default()
    }

    pub fn exception_info(&self) -> Option<ExceptionSnapshot> {
        self.request(|reply| Command::GetExceptionInfo { reply })
            .flatten()
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().unwrap().phase
    }

    /// Begin teardown: stop the worker, release breakpoints, terminate the
    /// target. Pending data commands observe default results. Dropping the
    /// session joins the worker, so teardown (including the exit
    /// notification) has completed by the time drop returns.
    pub fn exit(&self) {
        self.shared.state.lock().unwrap().should_exit = true;
        self.enqueue(Command::Exit);
        self.shared.wake.fire();
        weak_error!(self.engine.interrupt());
    }

    fn enqueue(&self, command: Command) {
        {
            let state = self.shared.state.lock().unwrap();
            if state.should_exit && !matches!(command, Command::Exit) {
                // worker is quitting; drop the command so reply slots unblock
                return;
            }
        }
        self.shared.commands.lock().unwrap().push_back(command);
        self.shared.commands_ready.notify_all();
    }

    fn request<T>(&self, build: impl FnOnce(command::Reply<T>) -> Command) -> Option<T> {
        let (reply, result) = sync_channel(1);
        self.enqueue(build(reply));
        result.recv().ok()
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.exit();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Worker<H: EventHook> {
    engine: Arc<dyn DebugEngine>,
    shared: Arc<Shared>,
    hook: H,
    program: String,
    args: Vec<String>,
    /// One-shot suppression of the WOW64 loader breakpoint.
    wx86_seen: bool,
    /// One-shot suppression of the OS break-in injection.
    break_injection_seen: bool,
    /// The exit notification goes out exactly once, whether the target died
    /// or the client disconnected.
    exit_reported: bool,
}

impl<H: EventHook> Worker<H> {
    fn run(&mut self) {
        if let Err(err) = self.launch_target() {
            log::error!(target: "debugger", "launch: {err:#}");
            {
                let mut state = self.shared.state.lock().unwrap();
                state.launch_error = Some(err.to_string());
                state.phase = Phase::Exited;
                state.should_exit = true;
            }
            self.shared.initialized.fire();
            return;
        }

        self.event_loop();
        self.teardown();
    }

    fn launch_target(&self) -> Result<(), Error> {
        let mut command_line = format!("\"{}\"", self.program);
        for arg in &self.args {
            command_line.push(' ');
            command_line.push_str(arg);
        }

        self.shared.state.lock().unwrap().phase = Phase::Launching;
        self.engine
            .create_process(&command_line, CreateFlags::DebugProcessTree)?;
        self.engine.set_effective_processor(Processor::X86)?;
        if let Some(dir) = Path::new(&self.program).parent().filter(|p| !p.as_os_str().is_empty()) {
            self.engine.set_symbol_path(dir)?;
        }
        self.engine.reload_symbols("/f")?;
        self.engine
            .set_exception_filter(codes::STATUS_SINGLE_STEP, FilterAction::GoNotHandled)?;

        // arm the first wait; the loop consumes the initial break
        self.shared.wake.fire();
        Ok(())
    }

    fn event_loop(&mut self) {
        loop {
            self.shared.wake.wait();
            self.shared.wake.reset();
            if self.should_exit() {
                break;
            }

            let outcome = match self.engine.wait_for_event(None) {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::error!(target: "debugger", "wait_for_event: {err:#}");
                    self.finish_exited();
                    break;
                }
            };
            if self.should_exit() {
                break;
            }

            match outcome {
                WaitOutcome::Break => {
                    let event = weak_error!(self.engine.get_last_event()).unwrap_or_default();

                    let first = {
                        let mut state = self.shared.state.lock().unwrap();
                        state.event_count += 1;
                        state.event_count == 1
                    };
                    if first {
                        self.classify_initial_break(&event);
                        self.shared.initialized.fire();
                    } else {
                        self.classify(event);
                    }
                }
                WaitOutcome::NoDebuggee => {
                    self.finish_exited();
                    break;
                }
                WaitOutcome::Timeout => continue,
            }

            if self.should_exit() {
                break;
            }
            self.drain_commands();
            if self.should_exit() {
                break;
            }
        }
    }

    /// The first event is the initial process break: it is never surfaced,
    /// and the session stays broken awaiting breakpoint configuration. The
    /// one-shot flag for its exception code is consumed here.
    fn classify_initial_break(&mut self, event: &LastEvent) {
        if event.event_type == EventType::ExitProcess {
            self.finish_exited();
            return;
        }
        if let Some(record) = event.exception {
            match record.code {
                codes::WX86_BREAKPOINT => self.wx86_seen = true,
                codes::DBG_CONTROL_C | codes::STATUS_BREAKPOINT => {
                    self.break_injection_seen = true
                }
                _ => {}
            }
        }
        self.shared.state.lock().unwrap().phase = Phase::AwaitingConfigDone;
    }

    fn classify(&mut self, event: LastEvent) {
        match event.event_type {
            EventType::Breakpoint => {
                let line = self.current_line();
                {
                    let mut state = self.shared.state.lock().unwrap();
                    state.phase = Phase::Stopped;
                    state.last_line_break = line;
                    state.pause_requested = false;
                    if let Some(offset) = weak_error!(self.engine.instruction_offset()) {
                        state.breakpoints.take_one_shot(offset);
                    }
                }
                weak_error!(self.hook.on_breakpoint());
            }
            EventType::ExitProcess => self.finish_exited(),
            EventType::Exception => {
                let record = event.exception.unwrap_or_default();
                match record.code {
                    codes::WX86_BREAKPOINT if !self.wx86_seen => {
                        // 32-bit loader break raised once after startup
                        self.wx86_seen = true;
                        self.resume(ExecutionStatus::Go);
                    }
                    codes::DBG_CONTROL_C | codes::STATUS_BREAKPOINT => {
                        let requested =
                            self.shared.state.lock().unwrap().pause_requested;
                        if requested || self.break_injection_seen {
                            self.break_injection_seen = true;
                            {
                                let mut state = self.shared.state.lock().unwrap();
                                state.phase = Phase::Stopped;
                                state.pause_requested = false;
                            }
                            weak_error!(self.hook.on_pause());
                        } else {
                            // system break-in injection, not user-initiated
                            self.break_injection_seen = true;
                            self.resume(ExecutionStatus::Go);
                        }
                    }
                    _ => self.surface_exception(&event, record),
                }
            }
            EventType::None | EventType::Other(_) => self.classify_step(),
        }
    }

    /// Step completion. Instruction stepping may land several times on the
    /// same source line; re-issue the step until the line changes so the IDE
    /// sees exactly one stop per source-line transition.
    fn classify_step(&mut self) {
        let line = self.current_line();
        let last = self.shared.state.lock().unwrap().last_line_break;

        if line == last {
            self.resume(ExecutionStatus::StepOver);
        } else {
            {
                let mut state = self.shared.state.lock().unwrap();
                state.phase = Phase::Stopped;
                state.last_line_break = line;
                state.pause_requested = false;
            }
            weak_error!(self.hook.on_step());
        }
    }

    fn surface_exception(&mut self, event: &LastEvent, record: ExceptionRecord) {
        let description = if event.description.is_empty() {
            format!("Exception 0x{:08X}", record.code)
        } else {
            event.description.clone()
        };
        let snapshot = ExceptionSnapshot {
            exception_id: format!("0x{:08X}", record.code),
            description: description.clone(),
            type_name: "Exception".to_string(),
        };

        {
            let mut state = self.shared.state.lock().unwrap();
            state.phase = Phase::Stopped;
            state.pause_requested = false;
            state.last_exception = Some(snapshot);
        }
        weak_error!(self.hook.on_exception(&description));
    }

    fn current_line(&self) -> Option<u32> {
        let offset = weak_error!(self.engine.instruction_offset())?;
        self.engine
            .symbol_line_by_offset(offset)
            .ok()
            .map(|(line, _)| line)
    }

    /// Pop commands one by one. Blocks while the target is broken and the
    /// queue is empty; returns as soon as the session is running again (a
    /// resume command arms the wake signal) or shutting down.
    fn drain_commands(&mut self) {
        loop {
            let command = {
                let mut queue = self.shared.commands.lock().unwrap();
                loop {
                    if let Some(command) = queue.pop_front() {
                        break Some(command);
                    }
                    let (broken, exiting) = {
                        let state = self.shared.state.lock().unwrap();
                        (state.phase.is_broken(), state.should_exit)
                    };
                    if exiting || !broken {
                        break None;
                    }
                    queue = self.shared.commands_ready.wait(queue).unwrap();
                }
            };

            let Some(command) = command else {
                return;
            };
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Run => self.resume(ExecutionStatus::Go),
            Command::StepOver => self.resume(ExecutionStatus::StepOver),
            Command::StepInto => self.resume(ExecutionStatus::StepInto),
            Command::StepOut => self.step_out(),
            // the caller already interrupted the engine; classification
            // reports the stop when the break event arrives
            Command::Pause => {}
            Command::SetBreakpoints {
                source,
                lines,
                reply,
            } => {
                let views = self.set_breakpoints(&source, &lines);
                let _ = reply.send(views);
            }
            Command::GetRegisters { reply } => {
                let registers =
                    weak_error!(register::read_registers(&*self.engine)).unwrap_or_default();
                let _ = reply.send(registers);
            }
            Command::GetCallStack { reply } => {
                let frames = weak_error!(stack::call_stack(&*self.engine)).unwrap_or_default();
                let _ = reply.send(frames);
            }
            Command::GetStackContents { reply } => {
                let entries =
                    weak_error!(stack::stack_contents(&*self.engine)).unwrap_or_default();
                let _ = reply.send(entries);
            }
            Command::GetEflags { reply } => {
                let flags = weak_error!(register::read_eflags(&*self.engine)).unwrap_or_default();
                let _ = reply.send(flags);
            }
            Command::Evaluate { expression, reply } => {
                let _ = reply.send(eval::evaluate_expression(&*self.engine, &expression));
            }
            Command::EvaluateVariable { name, reply } => {
                let _ = reply.send(eval::evaluate_variable(&*self.engine, &name));
            }
            Command::GetExceptionInfo { reply } => {
                let snapshot = self.shared.state.lock().unwrap().last_exception.clone();
                let _ = reply.send(snapshot);
            }
            Command::Exit => {}
        }
    }

    fn resume(&mut self, status: ExecutionStatus) {
        if weak_error!(self.engine.set_execution_status(status)).is_some() {
            self.shared.state.lock().unwrap().phase = Phase::Running;
            self.shared.wake.fire();
        }
    }

    /// Plant a one-shot breakpoint at the topmost frame's return address and
    /// let the target run to it.
    fn step_out(&mut self) {
        let Some(frames) = weak_error!(self.engine.stack_trace(1)) else {
            return;
        };
        let Some(top) = frames.first().filter(|frame| frame.return_offset != 0) else {
            log::warn!(target: "debugger", "step out: no return address");
            return;
        };

        let Some(handle) = weak_error!(self.engine.add_breakpoint(BreakpointKind::Code, true))
        else {
            return;
        };
        if weak_error!(self.engine.breakpoint_set_offset(handle, top.return_offset)).is_none()
            || weak_error!(self.engine.breakpoint_enable(handle)).is_none()
        {
            weak_error!(self.engine.remove_breakpoint(handle));
            return;
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            let id = state.breakpoints.next_id();
            if let Some(old) = state.breakpoints.insert(
                top.return_offset,
                BreakpointRecord {
                    id,
                    handle,
                    source: None,
                    line: None,
                    one_shot: true,
                    enabled: true,
                },
            ) {
                weak_error!(self.engine.remove_breakpoint(old.handle));
            }
        }

        self.resume(ExecutionStatus::Go);
    }

    /// Replace this source's breakpoints: release the previous engine handles
    /// first, then insert the new set. Lines without line information are
    /// reported unverified and silently not set.
    fn set_breakpoints(&mut self, source: &Path, lines: &[u32]) -> Vec<BreakpointView> {
        let stale = {
            let mut state = self.shared.state.lock().unwrap();
            state.breakpoints.remove_for_source(source)
        };
        for handle in stale {
            weak_error!(self.engine.remove_breakpoint(handle));
        }

        let mut views = Vec::with_capacity(lines.len());
        for &line in lines {
            views.push(self.plant_breakpoint(source, line));
        }
        views
    }

    fn plant_breakpoint(&mut self, source: &Path, line: u32) -> BreakpointView {
        let unverified = BreakpointView {
            id: None,
            line,
            verified: false,
        };

        let offset = match self.engine.symbol_offset_by_line(source, line) {
            Ok(offset) => offset,
            Err(err) => {
                log::debug!(target: "debugger", "breakpoint at {}:{line}: {err:#}", source.display());
                return unverified;
            }
        };

        let Some(handle) = weak_error!(self.engine.add_breakpoint(BreakpointKind::Code, false))
        else {
            return unverified;
        };
        if weak_error!(self.engine.breakpoint_set_offset(handle, offset)).is_none()
            || weak_error!(self.engine.breakpoint_enable(handle)).is_none()
        {
            weak_error!(self.engine.remove_breakpoint(handle));
            return unverified;
        }

        let mut state = self.shared.state.lock().unwrap();
        let id = state.breakpoints.next_id();
        if let Some(old) = state.breakpoints.insert(
            offset,
            BreakpointRecord {
                id,
                handle,
                source: Some(source.to_path_buf()),
                line: Some(line),
                one_shot: false,
                enabled: true,
            },
        ) {
            weak_error!(self.engine.remove_breakpoint(old.handle));
        }

        BreakpointView {
            id: Some(id),
            line,
            verified: true,
        }
    }

    fn finish_exited(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.phase = Phase::Exited;
            state.should_exit = true;
        }
        // a launch reply may still be gated on the first event
        self.shared.initialized.fire();
        self.report_exit();
    }

    fn report_exit(&mut self) {
        if !self.exit_reported {
            self.exit_reported = true;
            self.hook.on_exit();
        }
    }

    fn should_exit(&self) -> bool {
        self.shared.state.lock().unwrap().should_exit
    }

    /// Release engine resources in reverse acquisition order: breakpoint
    /// handles first, then the session itself (actively terminating the
    /// target). Remaining queued commands are dropped, which unblocks any
    /// pending data callers. A shutdown the client initiated still reports
    /// the session end, so `terminated`/`exited` reach the IDE before the
    /// disconnect reply.
    fn teardown(&mut self) {
        let handles = {
            let mut state = self.shared.state.lock().unwrap();
            state.breakpoints.drain()
        };
        for handle in handles {
            weak_error!(self.engine.remove_breakpoint(handle));
        }
        weak_error!(self.engine.end_session());

        self.shared.commands.lock().unwrap().clear();
        self.shared.state.lock().unwrap().phase = Phase::Exited;
        self.report_exit();

        log::debug!(target: "debugger", "engine worker exiting");
    }
}
