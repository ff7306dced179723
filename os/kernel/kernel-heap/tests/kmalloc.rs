mod common;

use common::{HostPages, PAGE, arena};
use kernel_heap::{HeapError, KernelHeap, Placement, Translate};
use std::alloc::{GlobalAlloc, Layout};

const PHYS_BASE: u64 = 0x20_0000;

/// Identity-offset mapping of one virtual range.
struct Linear {
    start: usize,
    end: usize,
}

impl Translate for Linear {
    fn translate(&self, virt: usize) -> Option<u64> {
        (self.start..self.end)
            .contains(&virt)
            .then(|| PHYS_BASE + (virt - self.start) as u64)
    }
}

struct Unmapped;

impl Translate for Unmapped {
    fn translate(&self, _virt: usize) -> Option<u64> {
        None
    }
}

fn early_region(bytes: usize) -> (usize, usize) {
    let words: &'static mut [u64] = vec![0u64; bytes / 8].leak();
    let start = words.as_mut_ptr() as usize;
    (start, start + bytes)
}

fn heap() -> (KernelHeap<HostPages>, usize, usize) {
    let (start, end) = early_region(4 * PAGE);
    (KernelHeap::new(Placement::new(start, end)), start, end)
}

#[test]
fn placement_serves_requests_before_install() {
    let (heap, start, end) = heap();

    let a = heap.kmalloc(10).unwrap().as_ptr() as usize;
    let b = heap.kmalloc(10).unwrap().as_ptr() as usize;
    assert!((start..end).contains(&a));
    assert!(b >= a + 10 && b < end);

    let c = heap.kmalloc_aligned(8).unwrap().as_ptr() as usize;
    assert_eq!(c % PAGE, 0);
    assert!(c < end);

    // placement memory is never handed back
    let used = heap.placement().used();
    heap.kfree(a as *mut u8);
    assert_eq!(heap.placement().used(), used);

    assert_eq!(
        heap.kmalloc(8 * PAGE),
        Err(HeapError::OutOfMemory { requested: 8 * PAGE })
    );
}

#[test]
fn arena_serves_requests_after_install() {
    let (heap, early_start, early_end) = heap();
    let early = heap.kmalloc(64).unwrap();
    heap.install(arena(4 * PAGE, 4 * PAGE, 64 * PAGE)).ok().unwrap();
    let (start, end) = heap.arena().with_arena(|a| (a.start(), a.end())).unwrap();

    let p = heap.kmalloc(100).unwrap().as_ptr() as usize;
    assert!((start..end).contains(&p));
    assert!(!(early_start..early_end).contains(&p));

    let q = heap.kmalloc_aligned(100).unwrap().as_ptr() as usize;
    assert_eq!(q % PAGE, 0);

    heap.kfree(p as *mut u8);
    heap.kfree(q as *mut u8);
    heap.kfree(early.as_ptr());
    heap.kfree(core::ptr::null_mut());
    assert_eq!(heap.arena().bytes_in_use(), 0);
}

#[test]
fn physical_addresses_are_reported() {
    let (heap, early_start, early_end) = heap();

    let early = Linear {
        start: early_start,
        end: early_end,
    };
    let (p, phys) = heap.kmalloc_aligned_phys(64, &early).unwrap();
    assert_eq!(phys, PHYS_BASE + (p.as_ptr() as usize - early_start) as u64);

    heap.install(arena(4 * PAGE, 4 * PAGE, 64 * PAGE)).ok().unwrap();
    let (start, end) = heap.arena().with_arena(|a| (a.start(), a.end() + 60 * PAGE)).unwrap();
    let mapped = Linear { start, end };

    let (p, phys) = heap.kmalloc_phys(64, &mapped).unwrap();
    assert_eq!(phys, PHYS_BASE + (p.as_ptr() as usize - start) as u64);
    let (q, phys) = heap.kmalloc_aligned_phys(64, &mapped).unwrap();
    assert_eq!(q.as_ptr() as usize % PAGE, 0);
    assert_eq!(phys % PAGE as u64, 0);

    heap.kfree(p.as_ptr());
    heap.kfree(q.as_ptr());
    assert_eq!(heap.arena().bytes_in_use(), 0);
}

#[test]
fn untranslatable_allocation_is_released() {
    let (heap, ..) = heap();
    heap.install(arena(4 * PAGE, 4 * PAGE, 64 * PAGE)).ok().unwrap();

    let err = heap.kmalloc_phys(64, &Unmapped).unwrap_err();
    assert!(matches!(err, HeapError::Unmapped(_)));
    assert_eq!(heap.arena().bytes_in_use(), 0);
}

#[test]
fn global_alloc_interface() {
    let (heap, early_start, early_end) = heap();
    let layout = Layout::from_size_align(256, 128).unwrap();

    let early = unsafe { heap.alloc(layout) };
    assert!(!early.is_null());
    assert!((early_start..early_end).contains(&(early as usize)));
    assert_eq!(early as usize % 128, 0);

    heap.install(arena(4 * PAGE, 4 * PAGE, 64 * PAGE)).ok().unwrap();
    let p = unsafe { heap.alloc(layout) };
    assert!(!p.is_null());
    assert_eq!(p as usize % 128, 0);
    assert!(heap.arena().bytes_in_use() > 0);

    unsafe {
        heap.dealloc(p, layout);
        heap.dealloc(early, layout);
    }
    assert_eq!(heap.arena().bytes_in_use(), 0);

    let huge = Layout::from_size_align(1 << 30, 8).unwrap();
    assert!(unsafe { heap.alloc(huge) }.is_null());
}
