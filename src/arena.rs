//! Page-sized executable code buffers.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous};
use nix::unistd::{SysconfVar, sysconf};

use crate::error::{LinkError, Result};

/// Software breakpoint (`int3`) written ahead of code in diagnostic mode.
pub const TRAP_MARKER: u8 = 0xCC;

/// Signature every generated function is invoked with.
pub type GeneratedFn = extern "C" fn() -> i32;

/// Queries the platform page size.
pub fn page_size() -> Result<usize> {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => Ok(size as usize),
        Ok(_) => Err(LinkError::PageSize),
        Err(errno) => Err(LinkError::PageSizeQuery(errno)),
    }
}

/// Handle to one page of read/write/execute memory.
///
/// The mapping is never released. Apart from [`CodeBuffer::write_u64`] the
/// contents are fixed once [`ExecutableArena::allocate`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBuffer {
    base: usize,
    len: usize,
    page_len: usize,
    code_offset: usize,
}

impl CodeBuffer {
    /// First byte of the region; this is also the entry point, so a trap
    /// marker executes before the code behind it.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of bytes written at creation, trap marker included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn page_len(&self) -> usize {
        self.page_len
    }

    /// Offset at which the caller-supplied code starts (1 behind a trap marker).
    pub fn code_offset(&self) -> usize {
        self.code_offset
    }

    pub fn has_trap_marker(&self) -> bool {
        self.code_offset == 1
    }

    pub fn end_addr(&self) -> usize {
        self.base.saturating_add(self.len)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end_addr()
    }

    /// Address of `offset` counted from the start of the caller-supplied code.
    pub fn code_addr(&self, offset: usize) -> usize {
        self.base + self.code_offset + offset
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the page is mapped readable for the rest of the process
        // lifetime and `len` bytes were initialized at creation.
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.len) }
    }

    /// Reads the 8-byte little-endian word at `offset` into the code, or
    /// `None` if the word is not fully inside the written bytes.
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let end = self.code_offset.checked_add(offset)?.checked_add(8)?;
        if end > self.len {
            return None;
        }
        // SAFETY: bounds checked above; operands are not aligned.
        Some(unsafe { ptr::read_unaligned(self.code_addr(offset) as *const u64) })
    }

    /// Overwrites the 8-byte word at `offset` into the code.
    ///
    /// # Safety
    ///
    /// The word must lie inside the written bytes (as checked by
    /// [`CodeBuffer::read_u64`]) and no thread may be executing it.
    pub unsafe fn write_u64(&self, offset: usize, value: u64) {
        unsafe { ptr::write_unaligned(self.code_addr(offset) as *mut u64, value) }
    }

    /// Returns the buffer as a callable function.
    ///
    /// # Safety
    ///
    /// The buffer must hold a complete function following the C calling
    /// convention that returns an `i32` in `eax`.
    pub unsafe fn as_fn(&self) -> GeneratedFn {
        unsafe { std::mem::transmute::<*const c_void, GeneratedFn>(self.base as *const c_void) }
    }
}

/// Allocator for executable pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutableArena {
    page_size: usize,
    diagnostics: bool,
}

impl ExecutableArena {
    pub fn new(diagnostics: bool) -> Result<Self> {
        Ok(Self {
            page_size: page_size()?,
            diagnostics,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn diagnostics(&self) -> bool {
        self.diagnostics
    }

    /// Maps a fresh RWX page and copies `code` into it.
    ///
    /// A trap marker is only written when the arena runs in diagnostic mode
    /// *and* the caller asks for one. This function is called from the fault
    /// handler and must stay free of logging and heap allocation.
    pub fn allocate(&self, code: &[u8], insert_trap_marker: bool) -> Result<CodeBuffer> {
        let code_offset = usize::from(self.diagnostics && insert_trap_marker);
        let len = code_offset + code.len();
        if len > self.page_size {
            return Err(LinkError::CodeTooLarge {
                len,
                capacity: self.page_size,
            });
        }

        let length = NonZeroUsize::new(self.page_size).ok_or(LinkError::PageSize)?;
        // SAFETY: anonymous private mapping at a kernel-chosen address.
        let mem = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(LinkError::Allocation)?;

        let base = mem.as_ptr() as *mut u8;
        // SAFETY: the page is freshly mapped, writable and at least `len` bytes.
        unsafe {
            if code_offset == 1 {
                *base = TRAP_MARKER;
            }
            ptr::copy_nonoverlapping(code.as_ptr(), base.add(code_offset), code.len());
        }

        Ok(CodeBuffer {
            base: base as usize,
            len,
            page_len: self.page_size,
            code_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETURN_42: [u8; 6] = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size().unwrap();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_allocate_copies_code_at_offset_zero() {
        let arena = ExecutableArena::new(false).unwrap();
        let buffer = arena.allocate(&RETURN_42, false).unwrap();

        assert_eq!(buffer.bytes(), &RETURN_42);
        assert_eq!(buffer.code_offset(), 0);
        assert_eq!(buffer.page_len(), arena.page_size());
        assert_eq!(buffer.base() % arena.page_size(), 0);
        assert!(!buffer.has_trap_marker());
    }

    #[test]
    fn test_allocate_executes() {
        let arena = ExecutableArena::new(false).unwrap();
        let buffer = arena.allocate(&RETURN_42, false).unwrap();

        let func = unsafe { buffer.as_fn() };
        assert_eq!(func(), 42);
    }

    #[test]
    fn test_trap_marker_requires_diagnostics() {
        let quiet = ExecutableArena::new(false).unwrap();
        let buffer = quiet.allocate(&RETURN_42, true).unwrap();
        assert_eq!(buffer.bytes()[0], 0xb8);

        let loud = ExecutableArena::new(true).unwrap();
        let buffer = loud.allocate(&RETURN_42, true).unwrap();
        assert_eq!(buffer.bytes()[0], TRAP_MARKER);
        assert_eq!(&buffer.bytes()[1..], &RETURN_42);
        assert_eq!(buffer.len(), RETURN_42.len() + 1);

        let unmarked = loud.allocate(&RETURN_42, false).unwrap();
        assert_eq!(unmarked.bytes(), &RETURN_42);
    }

    #[test]
    fn test_allocate_rejects_oversized_code() {
        let arena = ExecutableArena::new(false).unwrap();
        let code = vec![0x90; arena.page_size() + 1];

        match arena.allocate(&code, false) {
            Err(LinkError::CodeTooLarge { len, capacity }) => {
                assert_eq!(len, arena.page_size() + 1);
                assert_eq!(capacity, arena.page_size());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_full_page_with_marker_overflows() {
        let arena = ExecutableArena::new(true).unwrap();
        let code = vec![0x90; arena.page_size()];

        assert!(arena.allocate(&code, false).is_ok());
        assert!(matches!(
            arena.allocate(&code, true),
            Err(LinkError::CodeTooLarge { .. })
        ));
    }

    #[test]
    fn test_contains() {
        let arena = ExecutableArena::new(false).unwrap();
        let buffer = arena.allocate(&RETURN_42, false).unwrap();

        assert!(buffer.contains(buffer.base()));
        assert!(buffer.contains(buffer.base() + RETURN_42.len() - 1));
        assert!(!buffer.contains(buffer.base() + RETURN_42.len()));
        assert!(!buffer.contains(buffer.base() - 1));
    }

    #[test]
    fn test_read_write_u64() {
        let arena = ExecutableArena::new(true).unwrap();
        let buffer = arena.allocate(&[0u8; 16], true).unwrap();

        unsafe { buffer.write_u64(3, 0x1122_3344_5566_7788) };

        assert_eq!(buffer.read_u64(3), Some(0x1122_3344_5566_7788));
        assert_eq!(buffer.bytes()[0], TRAP_MARKER);
        assert_eq!(buffer.bytes()[4], 0x88);
        assert_eq!(buffer.bytes()[11], 0x11);
    }

    #[test]
    fn test_read_u64_out_of_bounds() {
        let arena = ExecutableArena::new(true).unwrap();
        let buffer = arena.allocate(&[0u8; 16], true).unwrap();

        assert!(buffer.read_u64(8).is_some());
        assert_eq!(buffer.read_u64(9), None);
        assert_eq!(buffer.read_u64(usize::MAX), None);
    }
}
