pub mod dap;
pub mod supervisor;

use std::sync::Arc;

use crate::engine::DebugEngine;

/// Produces the engine backing a debug session. One engine per session; the
/// engine is created on `launch` and never reused across sessions.
pub type EngineFactory = Arc<dyn Fn() -> anyhow::Result<Arc<dyn DebugEngine>> + Send + Sync>;
