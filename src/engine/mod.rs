//! Abstract capability surface over the native debugging engine.
//!
//! The debug session drives the target exclusively through [`DebugEngine`].
//! Exactly one worker thread may call into the engine; the single documented
//! exception is [`DebugEngine::interrupt`], which is safe from any thread and
//! causes an in-flight [`DebugEngine::wait_for_event`] to return promptly.
//!
//! The concrete backend on Windows is DbgEng (see [`dbgeng`]); tests substitute
//! a scripted engine over a simulated target.

#[cfg(windows)]
pub mod dbgeng;

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exception codes the session classifier distinguishes.
pub mod codes {
    /// Loader breakpoint of the 32-bit (WOW64) subsystem.
    pub const WX86_BREAKPOINT: u32 = 0x4000_001F;
    /// Hardcoded breakpoint, also raised by the loader and break-in injection.
    pub const STATUS_BREAKPOINT: u32 = 0x8000_0003;
    /// Break-in raised for a user interrupt.
    pub const DBG_CONTROL_C: u32 = 0x4001_0005;
    /// Trap raised around instruction stepping.
    pub const STATUS_SINGLE_STEP: u32 = 0x8000_0004;
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{call} failed: {code:#010x}")]
    Api { call: &'static str, code: i32 },
    #[error("no debuggee")]
    NoDebuggee,
    #[error("symbol `{0}` not resolved")]
    SymbolNotFound(String),
    #[error("no code at {file}:{line}")]
    LineNotMapped { file: PathBuf, line: u32 },
    #[error("no line information for offset {0:#x}")]
    OffsetNotMapped(u64),
    #[error("read of {len} bytes at {address:#x} failed")]
    MemoryRead { address: u64, len: usize },
    #[error("expression rejected by the engine: {0}")]
    Evaluation(String),
    #[error("unknown breakpoint handle")]
    UnknownBreakpoint,
    #[error("thread {0} not found")]
    ThreadNotFound(u32),
    #[error("register index {0} out of range")]
    RegisterNotFound(u32),
    #[error("engine session is terminated")]
    Terminated,
}

/// Outcome of a successful `wait_for_event`. Fatal engine failures are
/// reported as `Err(EngineError)` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The engine is broken in; `get_last_event` describes why.
    Break,
    /// The target is gone.
    NoDebuggee,
    /// The wait timed out with no event.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Go,
    StepOver,
    StepInto,
    /// Resume at an explicit code offset.
    Goto(u64),
}

/// Process creation mode. `DebugProcessTree` attaches to children spawned by
/// the target as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CreateFlags {
    #[default]
    DebugProcessTree,
    DebugOnlyThisProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    X86,
}

/// Disposition applied to an exception code before it reaches classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Break in and report the event.
    Break,
    /// Continue without marking the exception handled.
    GoNotHandled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Code,
}

/// Opaque engine breakpoint identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BreakpointHandle(pub u32);

/// Kind of event the engine last broke on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventType {
    /// The break was not caused by a reportable event (step completion).
    #[default]
    None,
    Breakpoint,
    Exception,
    ExitProcess,
    Other(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub code: u32,
    pub address: u64,
    pub first_chance: bool,
}

/// Description of the engine's last event, as reported while broken in.
#[derive(Debug, Clone, Default)]
pub struct LastEvent {
    pub event_type: EventType,
    pub process_id: u32,
    pub thread_id: u32,
    pub description: String,
    pub exception: Option<ExceptionRecord>,
}

/// A raw stack frame as walked by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    pub instruction_offset: u64,
    pub frame_offset: u64,
    pub return_offset: u64,
}

/// Scalar width hint for engine-side expression evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    U32,
    U64,
}

/// Engine-typed scalar value (registers, expression results).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    U32(u32),
    U64(u64),
}

impl Scalar {
    pub fn as_u64(self) -> u64 {
        match self {
            Scalar::U32(v) => v as u64,
            Scalar::U64(v) => v,
        }
    }

    /// Hex rendering with the `0x` prefix and no padding, the way register
    /// values are presented.
    pub fn format_hex(self) -> String {
        match self {
            Scalar::U32(v) => format!("0x{v:x}"),
            Scalar::U64(v) => format!("0x{v:x}"),
        }
    }
}

/// Symbol type identity as resolved by the engine symbol tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeInfo {
    pub module_base: u64,
    pub type_id: u32,
    pub size: u32,
}

/// The full set of native-engine operations the adapter depends on.
///
/// Synchronous; every operation may fail with an [`EngineError`]. Apart from
/// `interrupt`, calls must stay on the engine worker thread.
pub trait DebugEngine: Send + Sync {
    /// Spawn the target under debug, suspended at the initial break.
    fn create_process(&self, command_line: &str, flags: CreateFlags) -> EngineResult<()>;

    /// Block until the engine breaks in, the target disappears, or `timeout`
    /// elapses. `None` waits indefinitely.
    fn wait_for_event(&self, timeout: Option<Duration>) -> EngineResult<WaitOutcome>;

    fn get_last_event(&self) -> EngineResult<LastEvent>;

    fn set_execution_status(&self, status: ExecutionStatus) -> EngineResult<()>;

    /// Force an in-flight `wait_for_event` to return promptly with a break-in.
    /// The only operation callable from outside the worker thread.
    fn interrupt(&self) -> EngineResult<()>;

    /// End the session, actively terminating the target.
    fn end_session(&self) -> EngineResult<()>;

    fn add_breakpoint(&self, kind: BreakpointKind, one_shot: bool) -> EngineResult<BreakpointHandle>;
    fn breakpoint_set_offset(&self, handle: BreakpointHandle, offset: u64) -> EngineResult<()>;
    fn breakpoint_enable(&self, handle: BreakpointHandle) -> EngineResult<()>;
    fn remove_breakpoint(&self, handle: BreakpointHandle) -> EngineResult<()>;

    fn symbol_offset_by_line(&self, source: &Path, line: u32) -> EngineResult<u64>;
    /// Resolve the closest symbol at `offset`; returns the name and the
    /// displacement from the symbol start.
    fn symbol_name_by_offset(&self, offset: u64) -> EngineResult<(String, u64)>;
    fn symbol_line_by_offset(&self, offset: u64) -> EngineResult<(u32, PathBuf)>;
    fn symbol_type(&self, name: &str) -> EngineResult<TypeInfo>;
    fn set_symbol_path(&self, dir: &Path) -> EngineResult<()>;
    fn reload_symbols(&self, flags: &str) -> EngineResult<()>;

    fn registers_count(&self) -> EngineResult<u32>;
    fn register_description(&self, index: u32) -> EngineResult<String>;
    fn register_value(&self, index: u32) -> EngineResult<Scalar>;
    /// Current instruction pointer of the current thread.
    fn instruction_offset(&self) -> EngineResult<u64>;
    /// Current stack pointer of the current thread.
    fn stack_offset(&self) -> EngineResult<u64>;

    fn thread_ids(&self) -> EngineResult<Vec<u32>>;
    fn set_current_thread(&self, id: u32) -> EngineResult<()>;

    fn stack_trace(&self, max_frames: usize) -> EngineResult<Vec<Frame>>;
    fn read_virtual(&self, address: u64, len: usize) -> EngineResult<Vec<u8>>;

    /// Evaluate an engine-native (MASM) expression. `desired` constrains the
    /// result width; `None` lets the engine pick.
    fn evaluate(&self, expression: &str, desired: Option<ScalarKind>) -> EngineResult<Scalar>;

    fn set_effective_processor(&self, processor: Processor) -> EngineResult<()>;
    fn set_exception_filter(&self, code: u32, action: FilterAction) -> EngineResult<()>;
}
