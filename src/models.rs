use std::fmt;
use std::time::SystemTime;

use crate::arena::CodeBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiteId(pub usize);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Facts recorded by the fault handler when it repoints a call site.
#[derive(Debug, Clone, Copy)]
pub struct PatchRecord {
    pub site: SiteId,
    pub call_site: u64,
    pub operand_address: u64,
    pub previous_operand: u64,
    pub target: CodeBuffer,
    pub return_address: u64,
    pub stack_pointer: u64,
    pub frame_pointer: u64,
    pub patched_at: SystemTime,
}

#[derive(Debug, Clone, Copy)]
pub struct SiteReport {
    pub id: SiteId,
    pub fault_count: u32,
    pub patch: Option<PatchRecord>,
}

impl SiteReport {
    pub fn is_patched(&self) -> bool {
        self.patch.is_some()
    }
}
