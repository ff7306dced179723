//! # Arena
//!
//! A contiguous, growable address range carved into boundary-tagged blocks.
//!
//! ```text
//!  start                                                     end      start + max_size
//!  │                                                          │               │
//!  ▼                                                          ▼               ▼
//!  ┌────────┬──────────────┬────┬────────────────────┬────────┬ ─ ─ ─ ─ ─ ─ ─ ┐
//!  │ used   │ free         │used│ used               │ free   │  uncommitted
//!  └────────┴──────────────┴────┴────────────────────┴────────┴ ─ ─ ─ ─ ─ ─ ─ ┘
//!            ▲                                         ▲
//!            └───────────── free-block tree ───────────┘
//! ```
//!
//! Blocks tile `[start, end)` exactly. Free blocks are indexed by size and
//! never touch another free block: every free merges with its free
//! neighbors right away. Running out of room commits more pages at `end`;
//! a free block reaching `end` gives whole pages back as long as the arena
//! stays above its floor.

use crate::block::{
    Block, GRANULE, MIN_BLOCK_SIZE, USER_OFFSET, align_padding, block_size_for, header_before,
    worst_case_padding,
};
use crate::error::{ArenaViolation, HeapError, heap_corruption};
use crate::order::{BlockOrder, Lookup};
use crate::provider::{ArenaFlags, PageProvider};
use core::ops::ControlFlow;
use core::ptr::NonNull;
use kernel_rbtree::RbTree;
use log::{debug, trace, warn};

pub struct Arena<P: PageProvider> {
    free: RbTree<BlockOrder>,
    start: usize,
    end: usize,
    min_size: usize,
    max_size: usize,
    flags: ArenaFlags,
    in_use: usize,
    provider: P,
}

/// A block as seen by [`Arena::blocks`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub address: usize,
    /// Size including both tags.
    pub size: usize,
    pub free: bool,
}

impl<P: PageProvider> Arena<P> {
    /// Sets up an arena over `[start, end)`, committing that range and
    /// covering it with a single free block.
    ///
    /// `min_size` is rounded up to a whole page; the arena never shrinks
    /// below it. It never grows beyond `max_size` bytes.
    ///
    /// # Errors
    /// - [`HeapError::Misaligned`] if `start` or `end` is not page aligned.
    /// - [`HeapError::InvalidGeometry`] if the range is too small for a
    ///   block or the sizes contradict each other.
    /// - [`HeapError::OutOfMemory`] if the provider refuses the initial range.
    ///
    /// # Safety
    /// `[start, start + max_size)` must be reserved for this arena alone and
    /// `provider` must make committed ranges of it readable and writable.
    pub unsafe fn create(
        start: usize,
        end: usize,
        min_size: usize,
        max_size: usize,
        flags: ArenaFlags,
        mut provider: P,
    ) -> Result<Self, HeapError> {
        if start % P::PAGE_SIZE != 0 || end % P::PAGE_SIZE != 0 {
            return Err(HeapError::Misaligned { start, end });
        }
        if start == 0 {
            return Err(HeapError::InvalidGeometry("arena starts at null"));
        }
        if end <= start || end - start < MIN_BLOCK_SIZE {
            return Err(HeapError::InvalidGeometry("arena cannot hold a single block"));
        }
        let Some(min_size) = min_size.checked_next_multiple_of(P::PAGE_SIZE) else {
            return Err(HeapError::InvalidGeometry("minimum size overflows"));
        };
        if min_size > max_size {
            return Err(HeapError::InvalidGeometry("minimum size exceeds maximum size"));
        }
        if end - start > max_size {
            return Err(HeapError::InvalidGeometry("initial size exceeds maximum size"));
        }
        if start.checked_add(max_size).is_none() {
            return Err(HeapError::InvalidGeometry("arena wraps the address space"));
        }

        if let Err(e) = provider.commit(start..end, flags) {
            warn!("Page provider refused initial arena {start:#x}..{end:#x}: {e}");
            return Err(HeapError::OutOfMemory {
                requested: end - start,
            });
        }

        let mut arena = Self {
            free: RbTree::new(BlockOrder),
            start,
            end,
            min_size,
            max_size,
            flags,
            in_use: 0,
            provider,
        };
        unsafe {
            let block = Block::at(start);
            block.write_tags(end - start, true);
            arena.free.insert(block.node());
        }

        debug!(
            "Arena created at {start:#x}..{end:#x} (floor {min_size:#x}, ceiling {max_size:#x}, {flags:?})"
        );
        Ok(arena)
    }

    /// Allocates `size` bytes whose address is a multiple of `alignment`.
    ///
    /// An `alignment` of `0` means no constraint. The arena grows when no
    /// free block fits.
    ///
    /// # Errors
    /// - [`HeapError::InvalidAlignment`] if `alignment` is neither `0` nor a power of two.
    /// - [`HeapError::OutOfMemory`] if the request cannot be served even after growing.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            warn!("Rejecting allocation of {size} bytes with alignment {alignment}");
            return Err(HeapError::InvalidAlignment(alignment));
        }
        let oom = HeapError::OutOfMemory { requested: size };
        let required = block_size_for(size).ok_or(oom)?;
        let mut block = loop {
            if let Some(block) = self.take_best_fit(required, alignment) {
                break block;
            }
            let needed = required
                .checked_add(worst_case_padding(alignment))
                .ok_or(oom)?;
            if self.grow(needed).is_err() {
                warn!(
                    "Out of memory: {size} bytes aligned to {alignment} ({} in use, {} free)",
                    self.in_use,
                    self.bytes_free()
                );
                return Err(oom);
            }
        };

        unsafe {
            let padding = align_padding(block.user_addr(), alignment);
            if padding != 0 {
                let total = block.size();
                let aligned = Block::at(block.addr() + padding);
                aligned.write_tags(total - padding, false);
                block.write_tags(padding, true);
                self.free.insert(block.node());
                block = aligned;
            }

            let available = block.size();
            if available - required >= MIN_BLOCK_SIZE {
                block.write_tags(required, false);
                let rest = Block::at(block.end());
                rest.write_tags(available - required, true);
                self.free.insert(rest.node());
            } else {
                block.write_tags(available, false);
            }

            self.in_use += block.size();
            trace!(
                "Allocated {size} bytes at {:#x} (block {:#x}+{:#x})",
                block.user_addr(),
                block.addr(),
                block.size()
            );
            Ok(block.user_ptr())
        }
    }

    /// Returns the block behind `ptr` to the arena.
    ///
    /// A null pointer is ignored.
    ///
    /// # Errors
    /// [`HeapError::DoubleFree`] if the block is already free. The arena is
    /// left untouched in that case.
    ///
    /// # Panics
    /// If `ptr` does not point at the payload of an intact block of this
    /// arena. That can only happen after the heap metadata got overwritten.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        let user = ptr as usize;
        let addr = user.wrapping_sub(USER_OFFSET);
        if addr < self.start || addr > self.end - MIN_BLOCK_SIZE || addr % GRANULE != 0 {
            heap_corruption(format_args!(
                "{user:#x} is not a block of arena {:#x}..{:#x}",
                self.start, self.end
            ));
        }

        unsafe {
            let mut block = Block::at(addr);
            if !block.header_ok() {
                heap_corruption(format_args!("bad header magic behind {user:#x}"));
            }
            if block.is_free() {
                warn!("Double free of {user:#x}");
                return Err(HeapError::DoubleFree(user));
            }
            let size = block.size();
            if size < MIN_BLOCK_SIZE || size > self.end - addr || !block.footer_ok() {
                heap_corruption(format_args!("bad footer behind {user:#x} (size {size:#x})"));
            }

            self.in_use -= size;
            block.write_tags(size, true);
            trace!("Freed {user:#x} (block {addr:#x}+{size:#x})");

            if let Some(right) = self.right_free_neighbor(block) {
                self.detach(right);
                block.write_tags(size + right.size(), true);
            }
            if let Some(left) = self.left_free_neighbor(block) {
                self.detach(left);
                left.write_tags(left.size() + block.size(), true);
                block = left;
            }

            if block.end() == self.end && self.size() > self.min_size {
                match self.shrink(block) {
                    Some(rest) => block = rest,
                    None => return Ok(()),
                }
            }
            self.free.insert(block.node());
        }
        Ok(())
    }

    /// Bytes held by used blocks, tags included.
    #[must_use]
    pub const fn bytes_in_use(&self) -> usize {
        self.in_use
    }

    /// Bytes held by free blocks, tags included.
    #[must_use]
    pub const fn bytes_free(&self) -> usize {
        self.size() - self.in_use
    }

    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// One past the last committed byte.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Committed size.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn min_size(&self) -> usize {
        self.min_size
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub const fn flags(&self) -> ArenaFlags {
        self.flags
    }

    /// Number of free blocks.
    #[must_use]
    pub const fn free_blocks(&self) -> usize {
        self.free.total()
    }

    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Walks all blocks from `start` to `end`.
    ///
    /// The walk stops early at a block whose tags are damaged; use
    /// [`check`](Self::check) to find out why.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_, P> {
        Blocks {
            arena: self,
            cursor: self.start,
        }
    }

    /// Verifies every block, the tree and the usage counter.
    ///
    /// # Errors
    /// The first [`ArenaViolation`] found.
    pub fn check(&self) -> Result<(), ArenaViolation> {
        let mut cursor = self.start;
        let mut previous_free = false;
        let mut free = 0;
        let mut used_bytes = 0;

        while cursor < self.end {
            let block = unsafe { Block::at(cursor) };
            if !unsafe { block.header_ok() } {
                return Err(ArenaViolation::BadHeader(cursor));
            }
            let size = unsafe { block.size() };
            if size < MIN_BLOCK_SIZE || size > self.end - cursor {
                return Err(ArenaViolation::BadSize {
                    address: cursor,
                    size,
                });
            }
            if !unsafe { block.footer_ok() } {
                return Err(ArenaViolation::BadFooter(cursor));
            }

            let is_free = unsafe { block.is_free() };
            if is_free {
                if previous_free {
                    return Err(ArenaViolation::AdjacentFree(cursor));
                }
                free += 1;
            } else {
                used_bytes += size;
            }
            previous_free = is_free;
            cursor += size;
        }

        let mut indexed_used = None;
        self.free.for_each(|node| {
            let block = Block::from_node(node);
            if indexed_used.is_none() && !unsafe { block.is_free() } {
                indexed_used = Some(block.addr());
            }
        });
        if let Some(address) = indexed_used {
            return Err(ArenaViolation::IndexedUsed(address));
        }
        if free != self.free.total() {
            return Err(ArenaViolation::Unindexed {
                free,
                indexed: self.free.total(),
            });
        }
        if used_bytes != self.in_use {
            return Err(ArenaViolation::Accounting {
                counted: used_bytes,
                recorded: self.in_use,
            });
        }
        self.free.validate()?;
        Ok(())
    }

    /// Extends the arena so that its last block is free and at least
    /// `bytes` long, then hands that block to the tree.
    ///
    /// A free block already ending at `end` counts towards `bytes`.
    fn grow(&mut self, bytes: usize) -> Result<(), HeapError> {
        let oom = HeapError::OutOfMemory { requested: bytes };
        let old_end = self.end;
        let tail = unsafe { self.left_free_neighbor(Block::at(old_end)) }
            .map_or(0, |block| unsafe { block.size() });
        let bytes = bytes.saturating_sub(tail).max(MIN_BLOCK_SIZE);
        let new_end = old_end
            .checked_add(bytes)
            .and_then(|end| end.checked_next_multiple_of(P::PAGE_SIZE))
            .ok_or(oom)?;
        if new_end - self.start > self.max_size {
            debug!(
                "Arena {:#x} cannot grow to {new_end:#x}: ceiling is {:#x}",
                self.start,
                self.start + self.max_size
            );
            return Err(oom);
        }
        if let Err(e) = self.provider.commit(old_end..new_end, self.flags) {
            warn!("Page provider refused {old_end:#x}..{new_end:#x}: {e}");
            return Err(oom);
        }
        self.end = new_end;
        debug!("Arena {:#x} grew to {new_end:#x}", self.start);

        unsafe {
            let added = Block::at(old_end);
            added.write_tags(new_end - old_end, true);
            if let Some(left) = self.left_free_neighbor(added) {
                self.detach(left);
                left.write_tags(left.size() + added.size(), true);
                self.free.insert(left.node());
            } else {
                self.free.insert(added.node());
            }
        }
        Ok(())
    }

    /// Gives whole pages behind `block`, the last block of the arena, back
    /// to the provider. The block is not linked into the tree.
    ///
    /// Returns what is left of the block, or `None` if it was released
    /// entirely.
    unsafe fn shrink(&mut self, block: Block) -> Option<Block> {
        let addr = block.addr();
        let floor = self.start + self.min_size;
        let mut new_end = addr.next_multiple_of(P::PAGE_SIZE).max(floor);
        if new_end != addr && new_end - addr < MIN_BLOCK_SIZE {
            new_end += P::PAGE_SIZE;
        }
        if new_end >= self.end {
            return Some(block);
        }

        self.provider.decommit(new_end..self.end, self.flags);
        debug!("Arena {:#x} shrank from {:#x} to {new_end:#x}", self.start, self.end);
        self.end = new_end;

        if new_end == addr {
            return None;
        }
        unsafe { block.write_tags(new_end - addr, true) };
        Some(block)
    }

    /// Unlinks the smallest free block that holds `required` bytes at `alignment`.
    fn take_best_fit(&mut self, required: usize, alignment: usize) -> Option<Block> {
        if alignment <= GRANULE {
            let lookup = Lookup::BestFit {
                required,
                alignment,
            };
            return unsafe { self.free.remove(required, &lookup) }.map(Block::from_node);
        }

        // Padding depends on each block's address, so fitting is not
        // monotone in size: walk the sizes upwards from `required`.
        let block = self.free.scan_from(required, |node| {
            let block = Block::from_node(node);
            if BlockOrder::fits(block, required, alignment) {
                ControlFlow::Break(block)
            } else {
                ControlFlow::Continue(())
            }
        })?;
        unsafe { self.detach(block) };
        Some(block)
    }

    /// Free block ending right where `block` begins.
    unsafe fn left_free_neighbor(&self, block: Block) -> Option<Block> {
        let addr = block.addr();
        if addr - self.start < MIN_BLOCK_SIZE {
            return None;
        }
        let left = unsafe { header_before(addr) }?;
        if left < self.start || left > addr - MIN_BLOCK_SIZE || left % GRANULE != 0 {
            return None;
        }
        let left = unsafe { Block::at(left) };
        unsafe { (left.header_ok() && left.is_free() && left.end() == addr).then_some(left) }
    }

    /// Free block starting right where `block` ends.
    unsafe fn right_free_neighbor(&self, block: Block) -> Option<Block> {
        let next = unsafe { block.end() };
        if self.end - next < MIN_BLOCK_SIZE {
            return None;
        }
        let right = unsafe { Block::at(next) };
        unsafe {
            if !right.header_ok() || !right.is_free() {
                return None;
            }
            let size = right.size();
            (size >= MIN_BLOCK_SIZE && size <= self.end - next && right.footer_ok()).then_some(right)
        }
    }

    /// Unlinks exactly `block` from the tree.
    unsafe fn detach(&mut self, block: Block) {
        let lookup = Lookup::Exact {
            address: block.addr(),
        };
        let size = unsafe { block.size() };
        match unsafe { self.free.remove(size, &lookup) } {
            Some(node) if Block::from_node(node) == block => {}
            _ => heap_corruption(format_args!(
                "free block {:#x}+{size:#x} is missing from the tree",
                block.addr()
            )),
        }
    }
}

/// Iterator returned by [`Arena::blocks`].
pub struct Blocks<'a, P: PageProvider> {
    arena: &'a Arena<P>,
    cursor: usize,
}

impl<P: PageProvider> Iterator for Blocks<'_, P> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let remaining = self.arena.end - self.cursor;
        if remaining < MIN_BLOCK_SIZE {
            return None;
        }
        let block = unsafe { Block::at(self.cursor) };
        if !unsafe { block.header_ok() } {
            return None;
        }
        let size = unsafe { block.size() };
        if size < MIN_BLOCK_SIZE || size > remaining {
            return None;
        }
        let info = BlockInfo {
            address: self.cursor,
            size,
            free: unsafe { block.is_free() },
        };
        self.cursor += size;
        Some(info)
    }
}
