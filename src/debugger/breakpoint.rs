use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::engine::BreakpointHandle;

/// Result of one `setBreakpoints` line, reported back to the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointView {
    pub id: Option<u32>,
    pub line: u32,
    pub verified: bool,
}

#[derive(Debug, Clone)]
pub(super) struct BreakpointRecord {
    pub id: u32,
    pub handle: BreakpointHandle,
    pub source: Option<PathBuf>,
    pub line: Option<u32>,
    pub one_shot: bool,
    pub enabled: bool,
}

/// Session breakpoints keyed by code offset. Offsets are unique per session:
/// inserting at an occupied offset surrenders the previous record so its
/// engine handle can be released.
#[derive(Debug, Default)]
pub(super) struct BreakpointTable {
    by_offset: BTreeMap<u64, BreakpointRecord>,
    next_id: u32,
}

impl BreakpointTable {
    pub fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert(&mut self, offset: u64, record: BreakpointRecord) -> Option<BreakpointRecord> {
        self.by_offset.insert(offset, record)
    }

    /// Detach every record belonging to `source`, returning the engine handles
    /// to release. One-shot records have no source and are never touched.
    pub fn remove_for_source(&mut self, source: &Path) -> Vec<BreakpointHandle> {
        let stale: Vec<u64> = self
            .by_offset
            .iter()
            .filter(|(_, rec)| rec.source.as_deref() == Some(source))
            .map(|(offset, _)| *offset)
            .collect();

        stale
            .into_iter()
            .filter_map(|offset| self.by_offset.remove(&offset))
            .map(|rec| rec.handle)
            .collect()
    }

    /// Drop the one-shot record at `offset`, if any. The engine releases
    /// one-shot handles itself when they are hit.
    pub fn take_one_shot(&mut self, offset: u64) -> Option<BreakpointRecord> {
        if self.by_offset.get(&offset)?.one_shot {
            self.by_offset.remove(&offset)
        } else {
            None
        }
    }

    /// Detach every record for session teardown.
    pub fn drain(&mut self) -> Vec<BreakpointHandle> {
        let handles = self.by_offset.values().map(|rec| rec.handle).collect();
        self.by_offset.clear();
        handles
    }

    pub fn views(&self) -> Vec<BreakpointView> {
        self.by_offset
            .values()
            .map(|rec| BreakpointView {
                id: Some(rec.id),
                line: rec.line.unwrap_or(0),
                verified: rec.enabled,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_offset.len()
    }
}
