//! Debug Adapter Protocol server for 32-bit MASM assembly programs.
//!
//! The adapter sits between an IDE speaking DAP (over stdio or a TCP socket)
//! and a native, engine-level debugging API controlling a spawned target
//! process. IDE requests become engine operations on a dedicated worker
//! thread; engine events come back as DAP notifications.

pub mod debugger;
pub mod engine;
pub mod log;
pub mod sync;
pub mod ui;
