#![allow(dead_code)]

use kernel_heap::{Arena, ArenaFlags, CommitError, PageProvider};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ops::Range;

pub const PAGE: usize = 4096;

/// Page provider over a host allocation standing in for a reserved range.
///
/// Records every commit and decommit, can refuse commits beyond a byte
/// budget and poisons decommitted pages.
pub struct HostPages {
    base: usize,
    layout: Layout,
    committed: Range<usize>,
    budget: Option<usize>,
    pub commits: Vec<Range<usize>>,
    pub decommits: Vec<Range<usize>>,
}

// Safety: the reservation is owned exclusively by this provider.
unsafe impl Send for HostPages {}

impl HostPages {
    pub fn new(reserve: usize) -> Self {
        let layout = Layout::from_size_align(reserve, PAGE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let base = ptr as usize;
        Self {
            base,
            layout,
            committed: base..base,
            budget: None,
            commits: Vec::new(),
            decommits: Vec::new(),
        }
    }

    /// Refuses any commit that would take the total beyond `bytes`.
    pub fn with_budget(mut self, bytes: usize) -> Self {
        self.budget = Some(bytes);
        self
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn reserved(&self) -> usize {
        self.layout.size()
    }

    pub fn committed(&self) -> Range<usize> {
        self.committed.clone()
    }
}

impl Drop for HostPages {
    fn drop(&mut self) {
        unsafe { dealloc(self.base as *mut u8, self.layout) }
    }
}

impl PageProvider for HostPages {
    fn commit(&mut self, range: Range<usize>, _flags: ArenaFlags) -> Result<(), CommitError> {
        assert_eq!(range.start % PAGE, 0);
        assert_eq!(range.end % PAGE, 0);
        assert!(range.start < range.end);
        if range.start < self.base || range.end > self.base + self.reserved() {
            return Err(CommitError::OutOfRange {
                start: range.start,
                end: range.end,
            });
        }
        let total = range.end.max(self.committed.end) - self.base;
        if self.budget.is_some_and(|budget| total > budget) {
            return Err(CommitError::Exhausted);
        }
        if self.committed.is_empty() {
            self.committed = range.clone();
        } else {
            assert_eq!(range.start, self.committed.end, "commits must extend the arena");
            self.committed.end = range.end;
        }
        self.commits.push(range);
        Ok(())
    }

    fn decommit(&mut self, range: Range<usize>, _flags: ArenaFlags) {
        assert_eq!(range.start % PAGE, 0);
        assert_eq!(range.end, self.committed.end, "decommits must trim the arena end");
        assert!(range.start >= self.committed.start);
        unsafe { std::ptr::write_bytes(range.start as *mut u8, 0xDD, range.end - range.start) };
        self.committed.end = range.start;
        self.decommits.push(range);
    }
}

/// Arena over a fresh reservation: `initial` committed bytes, floor at
/// `min`, ceiling at `max`.
pub fn arena(initial: usize, min: usize, max: usize) -> Arena<HostPages> {
    arena_with(HostPages::new(max), initial, min, max)
}

pub fn arena_with(pages: HostPages, initial: usize, min: usize, max: usize) -> Arena<HostPages> {
    let start = pages.base();
    unsafe { Arena::create(start, start + initial, min, max, ArenaFlags::kernel(), pages) }.unwrap()
}

/// Fills an allocation with a byte derived from `tag`.
pub fn stamp(ptr: *mut u8, len: usize, tag: u8) {
    unsafe { std::ptr::write_bytes(ptr, tag, len) };
}

/// Checks that an allocation still holds what [`stamp`] wrote.
pub fn verify(ptr: *const u8, len: usize, tag: u8) -> bool {
    unsafe { std::slice::from_raw_parts(ptr, len) }
        .iter()
        .all(|&b| b == tag)
}

/// Tiny deterministic RNG for workloads.
pub struct Lcg(pub u64);

impl Lcg {
    pub fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}
