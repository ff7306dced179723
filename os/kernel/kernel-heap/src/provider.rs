//! # Page Providers
//!
//! An arena only reserves an address range. Pages inside the range become
//! usable when a [`PageProvider`] commits them, and are handed back through
//! [`PageProvider::decommit`] when the arena shrinks. In the kernel the
//! provider backs pages with physical frames and maps them with
//! [`ArenaFlags`]; [`ReservedRegion`] serves memory that is permanently
//! backed, such as a `.bss` array.

use bitfield_struct::bitfield;
use core::ops::Range;

/// Mapping attributes requested for committed arena pages.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ArenaFlags {
    /// Bit 0: pages are only accessible in supervisor mode.
    pub privileged: bool,

    /// Bit 1: pages are mapped writable.
    pub writable: bool,

    /// Bits 2-7: reserved.
    #[bits(6, default = 0)]
    _reserved_2_7: u8,
}

impl ArenaFlags {
    /// Supervisor-only, writable: the usual kernel heap.
    #[must_use]
    pub const fn kernel() -> Self {
        Self::new().with_privileged(true).with_writable(true)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CommitError {
    #[error("no backing frames left")]
    Exhausted,
    #[error("range {start:#x}..{end:#x} lies outside the reservation")]
    OutOfRange { start: usize, end: usize },
}

/// Backs arena pages on demand.
///
/// Ranges passed in are always page aligned, non-empty and inside the
/// arena's reservation. Decommitted ranges are never touched again until a
/// later commit.
pub trait PageProvider {
    /// Commit granularity in bytes. Must be a power of two.
    const PAGE_SIZE: usize = 4096;

    /// Makes `range` readable and writable.
    ///
    /// # Errors
    /// [`CommitError`] if the range cannot be backed. The arena treats any
    /// error as out of memory and stays unchanged.
    fn commit(&mut self, range: Range<usize>, flags: ArenaFlags) -> Result<(), CommitError>;

    /// Releases the backing of `range`.
    fn decommit(&mut self, range: Range<usize>, flags: ArenaFlags);
}

/// Storage for a statically reserved heap.
///
/// ```ignore
/// #[unsafe(link_section = ".bss.heap")]
/// static mut HEAP: HeapMem<{ 64 * 1024 * 1024 }> = HeapMem::new();
/// ```
#[repr(C, align(4096))]
pub struct HeapMem<const N: usize>([u8; N]);

impl<const N: usize> HeapMem<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> Default for HeapMem<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider over memory that is always backed.
///
/// Commits only check that the range lies inside the region; decommits are
/// no-ops.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReservedRegion {
    base: usize,
    len: usize,
}

impl ReservedRegion {
    /// # Safety
    /// `[base, base + len)` must be valid, writable memory owned by the
    /// arena this provider is handed to.
    #[must_use]
    pub const unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Region covering a static [`HeapMem`].
    ///
    /// # Safety
    /// Nothing else may access `*mem` once the region is in use.
    #[must_use]
    pub unsafe fn from_static<const N: usize>(mem: *mut HeapMem<N>) -> Self {
        Self {
            base: mem.cast::<u8>() as usize,
            len: N,
        }
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte of the region.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.len
    }
}

impl PageProvider for ReservedRegion {
    fn commit(&mut self, range: Range<usize>, _flags: ArenaFlags) -> Result<(), CommitError> {
        if range.start < self.base || range.end > self.end() {
            return Err(CommitError::OutOfRange {
                start: range.start,
                end: range.end,
            });
        }
        Ok(())
    }

    fn decommit(&mut self, _range: Range<usize>, _flags: ArenaFlags) {}
}
