//! # Kernel Heap
//!
//! A general-purpose kernel heap built from *arenas*: contiguous virtual
//! address ranges that grow and shrink page by page through a
//! [`PageProvider`].
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            KernelHeap (kmalloc / kfree)             │
//! │    • Placement bump allocation before init          │
//! │    • Physical address reporting                     │
//! │    • GlobalAlloc                                    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 LockedArena                         │
//! │    • TATAS spinlock, optional IRQ masking           │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                    Arena                            │
//! │    • Boundary-tagged blocks                         │
//! │    • Best-fit search in a red-black tree            │
//! │    • Immediate coalescing, growth and shrinking     │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 PageProvider                        │
//! │    • Commits and decommits pages at the arena end   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Blocks
//!
//! Every block carries a 16-byte header (magic, size and free bit) and a
//! 16-byte footer (magic, pointer back to the header). The footer lets a
//! freed block find its left neighbor in constant time; the header size
//! finds the right one. Free blocks embed a
//! [`kernel_rbtree::RbNode`] right after their header and are indexed by
//! size, so an allocation is a single `O(log n)` best-fit removal.
//!
//! Aligned requests skip a prefix of the chosen block. That prefix is at
//! least [`MIN_BLOCK_SIZE`] bytes long and goes back to the tree as a free
//! block of its own.
//!
//! ## Errors
//!
//! Ordinary failures (out of memory, bad alignment, double free) are
//! reported as [`HeapError`]. Damaged metadata is not recoverable: it is
//! logged and the kernel panics.
//!
//! ## Example
//!
//! ```rust
//! use kernel_heap::{Arena, ArenaFlags, HeapMem, ReservedRegion};
//!
//! let mut mem = Box::new(HeapMem::<{ 64 * 1024 }>::new());
//! let region = unsafe { ReservedRegion::from_static(&raw mut *mem) };
//! let start = region.base();
//! let mut arena = unsafe {
//!     Arena::create(start, start + 16 * 1024, 16 * 1024, region.len(), ArenaFlags::kernel(), region)
//! }?;
//!
//! let p = arena.allocate(100, 64)?;
//! assert_eq!(p.as_ptr() as usize % 64, 0);
//! arena.free(p.as_ptr())?;
//! assert_eq!(arena.bytes_in_use(), 0);
//! # Ok::<(), kernel_heap::HeapError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod arena;
mod block;
mod error;
mod kmalloc;
mod locked;
mod order;
mod provider;

pub use arena::{Arena, BlockInfo, Blocks};
pub use block::{
    BLOCK_MAGIC, FOOTER_SIZE, GRANULE, HEADER_SIZE, MIN_BLOCK_SIZE, USER_OFFSET, align_padding,
    block_size_for,
};
pub use error::{ArenaViolation, HeapError};
pub use kmalloc::{KernelHeap, Placement, Translate};
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use locked::X86Irq;
pub use locked::{ArenaGuard, IrqControl, LockedArena, NoIrq};
pub use provider::{ArenaFlags, CommitError, HeapMem, PageProvider, ReservedRegion};
