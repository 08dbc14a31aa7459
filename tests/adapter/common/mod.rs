//! Scripted engine over a simulated 32-bit MASM program.
//!
//! The mock models the engine surface the session depends on: a linear
//! instruction list with source lines, a sparse memory image, code
//! breakpoints, and the event queue `wait_for_event` drains. Execution
//! control computes the next stop synchronously and parks when the
//! simulated target "runs" (the `Spin` instruction), so `interrupt` behaves
//! like the real engine's break-in.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use masm_dap::debugger::EventHook;
use masm_dap::engine::{
    BreakpointHandle, BreakpointKind, CreateFlags, DebugEngine, EngineError, EngineResult,
    EventType, ExceptionRecord, ExecutionStatus, FilterAction, Frame, LastEvent, Processor,
    Scalar, ScalarKind, TypeInfo, WaitOutcome, codes,
};

pub const SOURCE: &str = "sample.asm";
pub const CODE_BASE: u64 = 0x0040_1000;
pub const START_BASE: u64 = CODE_BASE + 0xC;
pub const DATA_BASE: u64 = 0x0040_3000;
pub const STACK_POINTER: u64 = 0x0019_ff20;

const APP_THREAD: u32 = 4;
const BREAKIN_THREAD: u32 = 8;

/// Return address stored in the walked stack: `sample!start+0x3`.
pub const RETURN_OFFSET: u64 = START_BASE + 0x3;
const SAVED_EBP_0: u64 = 0x0019_ff28;
const SAVED_EBP_1: u64 = 0x0019_ff38;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Normal,
    /// Raises an integer divide-by-zero exception.
    DivZero,
    /// Runs forever; only an interrupt stops it.
    Spin,
    /// Ends the target process.
    Exit,
}

#[derive(Debug, Clone, Copy)]
struct Instr {
    offset: u64,
    line: u32,
    op: Op,
}

struct MockBp {
    offset: u64,
    enabled: bool,
    one_shot: bool,
}

struct MockState {
    instrs: Vec<Instr>,
    pc: usize,
    breakpoints: HashMap<u32, MockBp>,
    next_bp: u32,
    memory: BTreeMap<u64, u8>,
    registers: Vec<(&'static str, u32)>,
    pending: VecDeque<LastEvent>,
    last_event: LastEvent,
    /// The WOW64 loader break delivered on the first resume.
    wx86_pending: bool,
    current_thread: u32,
    created: bool,
    ended: bool,
}

pub struct MockEngine {
    state: Mutex<MockState>,
    events_ready: Condvar,
}

impl MockEngine {
    /// The default fixture:
    ///
    /// ```text
    /// line 1  compute:                     0x401000
    /// line 2    mov  eax, 1                0x401003
    /// line 3    add  eax, ebx  (3 instrs)  0x401006 0x401009 0x40100c*
    /// line 4    ret                        0x40100f   * start begins at 0x40100c
    /// line 5    <op>                       0x401012
    /// line 6    nop                        0x401015
    /// line 7    invoke ExitProcess, 0      0x401018
    /// ```
    ///
    /// `line5` customizes the interesting instruction.
    pub fn with_line5(op: Op) -> Arc<MockEngine> {
        let lines = [
            (1, Op::Normal),
            (2, Op::Normal),
            (3, Op::Normal),
            (3, Op::Normal),
            (3, Op::Normal),
            (4, Op::Normal),
            (5, op),
            (6, Op::Normal),
            (7, Op::Exit),
        ];
        let instrs = lines
            .iter()
            .enumerate()
            .map(|(i, &(line, op))| Instr {
                offset: CODE_BASE + i as u64 * 3,
                line,
                op,
            })
            .collect();

        let mut memory = BTreeMap::new();
        // data segment
        seed(&mut memory, DATA_BASE, &[0x01, 0x02, 0x03, 0x04, 0x05]); // buf db 01,02,03,04,05
        seed(&mut memory, DATA_BASE + 0x5, &[0x00, 0x00, 0x00]); // alignment padding
        seed(&mut memory, DATA_BASE + 0x10, b"Hi!\0"); // msg db "Hi!",0
        seed(&mut memory, DATA_BASE + 0x20, &[0x2a, 0x00, 0x00, 0x00]); // counter dd 42
        // stack: two frames of compute <- start
        seed_dword(&mut memory, STACK_POINTER, 0x0000_0005);
        seed_dword(&mut memory, STACK_POINTER + 0x4, 0x0000_0007);
        seed_dword(&mut memory, SAVED_EBP_0, SAVED_EBP_1 as u32);
        seed_dword(&mut memory, SAVED_EBP_0 + 0x4, RETURN_OFFSET as u32);
        seed_dword(&mut memory, SAVED_EBP_0 + 0x8, 0x0000_0001);
        seed_dword(&mut memory, SAVED_EBP_0 + 0xC, 0x0000_0002);
        seed_dword(&mut memory, SAVED_EBP_1, 0x0000_0000);
        seed_dword(&mut memory, SAVED_EBP_1 + 0x4, 0xdead_beef);

        let registers = vec![
            ("eip", CODE_BASE as u32),
            ("eax", 0x2a),
            ("ebx", 0x0),
            ("ecx", 0x0040_1000),
            ("edx", 0x0),
            ("esi", 0x0),
            ("edi", 0x0),
            ("ebp", SAVED_EBP_0 as u32),
            ("esp", STACK_POINTER as u32),
            ("efl", 0x246),
            ("cs", 0x23),
            ("ds", 0x2b),
            ("ss", 0x2b),
            ("fpcw", 0x27f),
        ];

        Arc::new(MockEngine {
            state: Mutex::new(MockState {
                instrs,
                pc: 0,
                breakpoints: HashMap::new(),
                next_bp: 0,
                memory,
                registers,
                pending: VecDeque::new(),
                last_event: LastEvent::default(),
                wx86_pending: true,
                current_thread: BREAKIN_THREAD,
                created: false,
                ended: false,
            }),
            events_ready: Condvar::new(),
        })
    }

    pub fn sample() -> Arc<MockEngine> {
        Self::with_line5(Op::Normal)
    }

    pub fn ended(&self) -> bool {
        self.state.lock().unwrap().ended
    }

    pub fn created(&self) -> bool {
        self.state.lock().unwrap().created
    }

    pub fn current_thread(&self) -> u32 {
        self.state.lock().unwrap().current_thread
    }

    pub fn enabled_breakpoints(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .count()
    }

    fn queue(&self, state: &mut MockState, event: LastEvent) {
        state.pending.push_back(event);
        self.events_ready.notify_all();
    }

    /// Advance until a breakpoint, a faulting instruction, process exit, or
    /// the spin loop. Stepping over an armed breakpoint first, the way a
    /// real engine resumes from a break.
    fn run_until_stop(&self, state: &mut MockState) {
        if state.instrs[state.pc].op == Op::Spin {
            return;
        }
        loop {
            if state.pc + 1 >= state.instrs.len() {
                self.queue_exit(state);
                return;
            }
            state.pc += 1;
            let instr = state.instrs[state.pc];

            if let Some(id) = breakpoint_at(state, instr.offset) {
                if state.breakpoints[&id].one_shot {
                    state.breakpoints.remove(&id);
                }
                self.queue(
                    state,
                    LastEvent {
                        event_type: EventType::Breakpoint,
                        process_id: 0x1234,
                        thread_id: APP_THREAD,
                        description: "Breakpoint hit".to_string(),
                        exception: None,
                    },
                );
                return;
            }

            match instr.op {
                Op::Exit => {
                    self.queue_exit(state);
                    return;
                }
                Op::DivZero => {
                    self.queue_div_zero(state);
                    return;
                }
                Op::Spin => return,
                Op::Normal => {}
            }
        }
    }

    fn step_once(&self, state: &mut MockState) {
        if state.pc + 1 >= state.instrs.len() {
            self.queue_exit(state);
            return;
        }
        state.pc += 1;
        match state.instrs[state.pc].op {
            Op::Exit => self.queue_exit(state),
            Op::DivZero => self.queue_div_zero(state),
            _ => self.queue(
                state,
                LastEvent {
                    event_type: EventType::None,
                    process_id: 0x1234,
                    thread_id: APP_THREAD,
                    description: String::new(),
                    exception: None,
                },
            ),
        }
    }

    fn queue_exit(&self, state: &mut MockState) {
        self.queue(
            state,
            LastEvent {
                event_type: EventType::ExitProcess,
                process_id: 0x1234,
                thread_id: APP_THREAD,
                description: "Process exited".to_string(),
                exception: None,
            },
        );
    }

    fn queue_div_zero(&self, state: &mut MockState) {
        let address = state.instrs[state.pc].offset;
        self.queue(
            state,
            LastEvent {
                event_type: EventType::Exception,
                process_id: 0x1234,
                thread_id: APP_THREAD,
                description: "Integer division by zero".to_string(),
                exception: Some(ExceptionRecord {
                    code: 0xC000_0094,
                    address,
                    first_chance: true,
                }),
            },
        );
    }

    fn eval_token(&self, state: &MockState, token: &str) -> EngineResult<Scalar> {
        if let Some(&(_, value)) = state
            .registers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
        {
            return Ok(Scalar::U32(value));
        }
        if let Some(offset) = symbol_offset(token) {
            return Ok(Scalar::U32(offset as u32));
        }
        if let Some(hex) = token.strip_prefix("0x") {
            if let Ok(value) = u32::from_str_radix(hex, 16) {
                return Ok(Scalar::U32(value));
            }
        }
        if let Ok(value) = token.parse::<u32>() {
            return Ok(Scalar::U32(value));
        }
        Err(EngineError::Evaluation(token.to_string()))
    }
}

fn seed(memory: &mut BTreeMap<u64, u8>, base: u64, bytes: &[u8]) {
    for (i, &byte) in bytes.iter().enumerate() {
        memory.insert(base + i as u64, byte);
    }
}

fn seed_dword(memory: &mut BTreeMap<u64, u8>, base: u64, value: u32) {
    seed(memory, base, &value.to_le_bytes());
}

fn breakpoint_at(state: &MockState, offset: u64) -> Option<u32> {
    state
        .breakpoints
        .iter()
        .find(|(_, bp)| bp.enabled && bp.offset == offset)
        .map(|(&id, _)| id)
}

/// Data symbols of the simulated program.
fn symbol_offset(name: &str) -> Option<u64> {
    match name {
        "buf" => Some(DATA_BASE),
        "msg" => Some(DATA_BASE + 0x10),
        "counter" => Some(DATA_BASE + 0x20),
        _ => None,
    }
}

fn symbol_size(name: &str) -> Option<u32> {
    match name {
        "buf" => Some(1),
        "msg" => Some(1),
        "counter" => Some(4),
        _ => None,
    }
}

impl DebugEngine for MockEngine {
    fn create_process(&self, command_line: &str, _flags: CreateFlags) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        assert!(!state.created, "one target per engine");
        assert!(command_line.starts_with('"'), "program path is quoted");
        state.created = true;
        self.queue(
            &mut state,
            LastEvent {
                event_type: EventType::Exception,
                process_id: 0x1234,
                thread_id: BREAKIN_THREAD,
                description: "Initial process break".to_string(),
                exception: Some(ExceptionRecord {
                    code: codes::STATUS_BREAKPOINT,
                    address: 0x7700_0000,
                    first_chance: true,
                }),
            },
        );
        Ok(())
    }

    fn wait_for_event(&self, timeout: Option<Duration>) -> EngineResult<WaitOutcome> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(event) = state.pending.pop_front() {
                state.last_event = event;
                return Ok(WaitOutcome::Break);
            }
            match timeout {
                None => state = self.events_ready.wait(state).unwrap(),
                Some(timeout) => {
                    let (guard, result) = self.events_ready.wait_timeout(state, timeout).unwrap();
                    state = guard;
                    if result.timed_out() && state.pending.is_empty() {
                        return Ok(WaitOutcome::Timeout);
                    }
                }
            }
        }
    }

    fn get_last_event(&self) -> EngineResult<LastEvent> {
        Ok(self.state.lock().unwrap().last_event.clone())
    }

    fn set_execution_status(&self, status: ExecutionStatus) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        match status {
            ExecutionStatus::Go => {
                if state.wx86_pending {
                    state.wx86_pending = false;
                    self.queue(
                        &mut state,
                        LastEvent {
                            event_type: EventType::Exception,
                            process_id: 0x1234,
                            thread_id: BREAKIN_THREAD,
                            description: "WOW64 loader break".to_string(),
                            exception: Some(ExceptionRecord {
                                code: codes::WX86_BREAKPOINT,
                                address: 0x7700_1000,
                                first_chance: true,
                            }),
                        },
                    );
                } else {
                    self.run_until_stop(&mut state);
                }
            }
            ExecutionStatus::StepOver | ExecutionStatus::StepInto => self.step_once(&mut state),
            ExecutionStatus::Goto(offset) => {
                if let Some(index) = state.instrs.iter().position(|i| i.offset == offset) {
                    state.pc = index;
                }
            }
        }
        Ok(())
    }

    fn interrupt(&self) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.current_thread = BREAKIN_THREAD;
        self.queue(
            &mut state,
            LastEvent {
                event_type: EventType::Exception,
                process_id: 0x1234,
                thread_id: BREAKIN_THREAD,
                description: "User interrupt".to_string(),
                exception: Some(ExceptionRecord {
                    code: codes::DBG_CONTROL_C,
                    address: 0x7700_2000,
                    first_chance: true,
                }),
            },
        );
        Ok(())
    }

    fn end_session(&self) -> EngineResult<()> {
        self.state.lock().unwrap().ended = true;
        Ok(())
    }

    fn add_breakpoint(&self, _kind: BreakpointKind, one_shot: bool) -> EngineResult<BreakpointHandle> {
        let mut state = self.state.lock().unwrap();
        state.next_bp += 1;
        let id = state.next_bp;
        state.breakpoints.insert(
            id,
            MockBp {
                offset: 0,
                enabled: false,
                one_shot,
            },
        );
        Ok(BreakpointHandle(id))
    }

    fn breakpoint_set_offset(&self, handle: BreakpointHandle, offset: u64) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .breakpoints
            .get_mut(&handle.0)
            .ok_or(EngineError::UnknownBreakpoint)?
            .offset = offset;
        Ok(())
    }

    fn breakpoint_enable(&self, handle: BreakpointHandle) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .breakpoints
            .get_mut(&handle.0)
            .ok_or(EngineError::UnknownBreakpoint)?
            .enabled = true;
        Ok(())
    }

    fn remove_breakpoint(&self, handle: BreakpointHandle) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .breakpoints
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(EngineError::UnknownBreakpoint)
    }

    fn symbol_offset_by_line(&self, source: &Path, line: u32) -> EngineResult<u64> {
        if source.file_name().map(|name| name.to_string_lossy().into_owned())
            != Some(SOURCE.to_string())
        {
            return Err(EngineError::LineNotMapped {
                file: source.to_path_buf(),
                line,
            });
        }
        let state = self.state.lock().unwrap();
        state
            .instrs
            .iter()
            .find(|instr| instr.line == line)
            .map(|instr| instr.offset)
            .ok_or(EngineError::LineNotMapped {
                file: source.to_path_buf(),
                line,
            })
    }

    fn symbol_name_by_offset(&self, offset: u64) -> EngineResult<(String, u64)> {
        let state = self.state.lock().unwrap();
        let code_end = state
            .instrs
            .last()
            .map(|instr| instr.offset + 3)
            .unwrap_or(CODE_BASE);
        drop(state);

        if (START_BASE..code_end).contains(&offset) {
            Ok(("sample!start".to_string(), offset - START_BASE))
        } else if (CODE_BASE..START_BASE).contains(&offset) {
            Ok(("sample!compute".to_string(), offset - CODE_BASE))
        } else {
            Err(EngineError::OffsetNotMapped(offset))
        }
    }

    fn symbol_line_by_offset(&self, offset: u64) -> EngineResult<(u32, PathBuf)> {
        let state = self.state.lock().unwrap();
        state
            .instrs
            .iter()
            .find(|instr| instr.offset == offset)
            .map(|instr| (instr.line, PathBuf::from(SOURCE)))
            .ok_or(EngineError::OffsetNotMapped(offset))
    }

    fn symbol_type(&self, name: &str) -> EngineResult<TypeInfo> {
        let size = symbol_size(name).ok_or_else(|| EngineError::SymbolNotFound(name.to_string()))?;
        Ok(TypeInfo {
            module_base: 0x0040_0000,
            type_id: 1,
            size,
        })
    }

    fn set_symbol_path(&self, _dir: &Path) -> EngineResult<()> {
        Ok(())
    }

    fn reload_symbols(&self, _flags: &str) -> EngineResult<()> {
        Ok(())
    }

    fn registers_count(&self) -> EngineResult<u32> {
        Ok(self.state.lock().unwrap().registers.len() as u32)
    }

    fn register_description(&self, index: u32) -> EngineResult<String> {
        let state = self.state.lock().unwrap();
        state
            .registers
            .get(index as usize)
            .map(|(name, _)| name.to_string())
            .ok_or(EngineError::RegisterNotFound(index))
    }

    fn register_value(&self, index: u32) -> EngineResult<Scalar> {
        let state = self.state.lock().unwrap();
        state
            .registers
            .get(index as usize)
            .map(|&(_, value)| Scalar::U32(value))
            .ok_or(EngineError::RegisterNotFound(index))
    }

    fn instruction_offset(&self) -> EngineResult<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.instrs[state.pc].offset)
    }

    fn stack_offset(&self) -> EngineResult<u64> {
        Ok(STACK_POINTER)
    }

    fn thread_ids(&self) -> EngineResult<Vec<u32>> {
        Ok(vec![BREAKIN_THREAD, APP_THREAD])
    }

    fn set_current_thread(&self, id: u32) -> EngineResult<()> {
        // the injected break-in thread refuses focus, the way the probing
        // heuristic expects
        if id != APP_THREAD {
            return Err(EngineError::ThreadNotFound(id));
        }
        self.state.lock().unwrap().current_thread = id;
        Ok(())
    }

    fn stack_trace(&self, max_frames: usize) -> EngineResult<Vec<Frame>> {
        let state = self.state.lock().unwrap();
        let frames = vec![
            Frame {
                instruction_offset: state.instrs[state.pc].offset,
                frame_offset: SAVED_EBP_0,
                return_offset: RETURN_OFFSET,
            },
            Frame {
                instruction_offset: RETURN_OFFSET,
                frame_offset: SAVED_EBP_1,
                return_offset: 0,
            },
        ];
        Ok(frames.into_iter().take(max_frames).collect())
    }

    fn read_virtual(&self, address: u64, len: usize) -> EngineResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        (0..len as u64)
            .map(|i| state.memory.get(&(address + i)).copied())
            .collect::<Option<Vec<u8>>>()
            .ok_or(EngineError::MemoryRead { address, len })
    }

    fn evaluate(&self, expression: &str, _desired: Option<ScalarKind>) -> EngineResult<Scalar> {
        let state = self.state.lock().unwrap();
        self.eval_token(&state, expression.trim())
    }

    fn set_effective_processor(&self, _processor: Processor) -> EngineResult<()> {
        Ok(())
    }

    fn set_exception_filter(&self, _code: u32, _action: FilterAction) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestEvent {
    Breakpoint,
    Step,
    Pause,
    Exception(String),
    Exit,
}

/// Hook recording session events for assertions.
pub struct TestHook {
    tx: Sender<TestEvent>,
}

pub fn test_hook() -> (TestHook, Receiver<TestEvent>) {
    let (tx, rx) = channel();
    (TestHook { tx }, rx)
}

impl EventHook for TestHook {
    fn on_breakpoint(&self) -> anyhow::Result<()> {
        self.tx.send(TestEvent::Breakpoint)?;
        Ok(())
    }

    fn on_step(&self) -> anyhow::Result<()> {
        self.tx.send(TestEvent::Step)?;
        Ok(())
    }

    fn on_pause(&self) -> anyhow::Result<()> {
        self.tx.send(TestEvent::Pause)?;
        Ok(())
    }

    fn on_exception(&self, description: &str) -> anyhow::Result<()> {
        self.tx.send(TestEvent::Exception(description.to_string()))?;
        Ok(())
    }

    fn on_exit(&self) {
        _ = self.tx.send(TestEvent::Exit);
    }
}

pub fn expect_event(rx: &Receiver<TestEvent>, expected: TestEvent) {
    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(event) => assert_eq!(event, expected),
        Err(_) => panic!("no `{expected:?}` event within the timeout"),
    }
}

pub fn expect_no_event(rx: &Receiver<TestEvent>) {
    if let Ok(event) = rx.recv_timeout(Duration::from_millis(300)) {
        panic!("unexpected event {event:?}");
    }
}
