use std::path::PathBuf;
use std::sync::mpsc::SyncSender;

use super::breakpoint::BreakpointView;
use super::register::{FlagValue, RegisterValue};
use super::stack::{FrameSnapshot, StackEntry};
use super::ExceptionSnapshot;

/// Single-shot reply slot of a data command. Dropping the slot unblocks the
/// caller with a default result, so pending requests never hang across
/// session teardown.
pub type Reply<T> = SyncSender<T>;

/// A queued session operation, executed on the engine worker.
pub enum Command {
    Run,
    Pause,
    StepOver,
    StepInto,
    StepOut,
    SetBreakpoints {
        source: PathBuf,
        lines: Vec<u32>,
        reply: Reply<Vec<BreakpointView>>,
    },
    GetRegisters {
        reply: Reply<Vec<RegisterValue>>,
    },
    GetCallStack {
        reply: Reply<Vec<FrameSnapshot>>,
    },
    GetStackContents {
        reply: Reply<Vec<StackEntry>>,
    },
    GetEflags {
        reply: Reply<Vec<FlagValue>>,
    },
    Evaluate {
        expression: String,
        reply: Reply<String>,
    },
    EvaluateVariable {
        name: String,
        reply: Reply<String>,
    },
    GetExceptionInfo {
        reply: Reply<Option<ExceptionSnapshot>>,
    },
    Exit,
}
