//! Call-frame lists and annotated raw stack contents.
//!
//! The raw stack view walks the current stack word by word and labels each
//! slot using two heuristics from the 32-bit frame layout: frame offsets of
//! walked frames are saved EBPs, and values matching a walked return offset
//! are return addresses. Everything else reads as an argument or local.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::engine::{DebugEngine, EngineResult};
use crate::muted_error;

const MAX_FRAMES: usize = 100;

/// A resolved call-stack frame, identified by its instruction offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub id: u64,
    pub name: String,
    pub source: Option<PathBuf>,
    pub line: Option<u32>,
}

/// One annotated word of the raw stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub address: String,
    pub value: String,
}

/// Make the first responsive thread current.
///
/// After a user-initiated pause the engine reports the injected break-in
/// thread, whose stack is entirely in OS modules; probing thread ids in order
/// lands back on the application thread.
pub fn select_application_thread(engine: &dyn DebugEngine) -> EngineResult<()> {
    for id in engine.thread_ids()? {
        if engine.set_current_thread(id).is_ok() {
            break;
        }
    }
    Ok(())
}

pub fn call_stack(engine: &dyn DebugEngine) -> EngineResult<Vec<FrameSnapshot>> {
    select_application_thread(engine)?;

    let frames = engine.stack_trace(MAX_FRAMES)?;
    let snapshots = frames
        .iter()
        .map(|frame| {
            let name = engine
                .symbol_name_by_offset(frame.instruction_offset)
                .map(|(name, _)| name)
                .unwrap_or_else(|_| "<unknown>".to_string());
            let place = muted_error!(engine.symbol_line_by_offset(frame.instruction_offset));
            FrameSnapshot {
                id: frame.instruction_offset,
                name,
                line: place.as_ref().map(|(line, _)| *line),
                source: place.map(|(_, file)| file),
            }
        })
        .collect();

    Ok(snapshots)
}

pub fn stack_contents(engine: &dyn DebugEngine) -> EngineResult<Vec<StackEntry>> {
    select_application_thread(engine)?;

    let sp = engine.stack_offset()?;
    let frames = engine.stack_trace(MAX_FRAMES)?;

    let frame_offsets: HashSet<u64> = frames.iter().map(|frame| frame.frame_offset).collect();
    let return_offsets: HashSet<u64> = frames
        .iter()
        .map(|frame| frame.return_offset)
        .filter(|&offset| offset != 0)
        .collect();

    // Read up to the frame of the entry routine; past it there is only the
    // OS startup stub.
    let top_frame_address = frames
        .iter()
        .find(|frame| {
            engine
                .symbol_name_by_offset(frame.instruction_offset)
                .map(|(name, _)| name.contains("start"))
                .unwrap_or(false)
        })
        .or(frames.last())
        .map(|frame| frame.frame_offset)
        .unwrap_or(sp);

    let n_entries = (top_frame_address.saturating_sub(sp) / 4 + 2).max(1) as usize;
    let bytes = engine.read_virtual(sp, n_entries * 4)?;

    let entries = bytes
        .chunks_exact(4)
        .enumerate()
        .map(|(i, chunk)| {
            let address = sp + i as u64 * 4;
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64;

            if frame_offsets.contains(&address) {
                StackEntry {
                    address: format!("Saved EBP → 0x{address:08x}"),
                    value: format!("0x{value:08x}"),
                }
            } else if return_offsets.contains(&value) {
                let mut rendered = format!("0x{value:08x}");
                if let Ok((name, displacement)) = engine.symbol_name_by_offset(value) {
                    rendered.push_str(&format!(" | {name}+0x{displacement:x}"));
                }
                StackEntry {
                    address: format!("Return Address (EIP) → 0x{address:08x}"),
                    value: rendered,
                }
            } else {
                StackEntry {
                    address: format!("Argument/Local Var → 0x{address:08x}"),
                    value: format!("0x{value:08x}"),
                }
            }
        })
        .collect();

    Ok(entries)
}
