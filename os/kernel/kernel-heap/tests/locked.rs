mod common;

use common::{HostPages, Lcg, PAGE, arena, stamp, verify};
use kernel_heap::{HeapError, IrqControl, LockedArena};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn empty_lock_reports_uninitialized() {
    let heap: LockedArena<HostPages> = LockedArena::new();
    assert!(!heap.is_installed());
    assert_eq!(heap.allocate(8, 0), Err(HeapError::Uninitialized));
    assert_eq!(heap.free(core::ptr::null_mut()), Err(HeapError::Uninitialized));
    assert_eq!(heap.with_arena(|a| a.size()), None);
    assert_eq!(heap.bytes_in_use(), 0);
}

#[test]
fn arena_is_installed_once() {
    let heap: LockedArena<HostPages> = LockedArena::new();
    assert!(heap.install(arena(PAGE, PAGE, 4 * PAGE)).is_ok());
    assert!(heap.is_installed());

    let second = heap.install(arena(2 * PAGE, PAGE, 4 * PAGE));
    assert_eq!(second.map_err(|a| a.size()), Err(2 * PAGE));
    assert_eq!(heap.with_arena(|a| a.size()), Some(PAGE));
}

#[test]
fn guard_gives_exclusive_access() {
    let mut heap: LockedArena<HostPages> = LockedArena::new();
    heap.install(arena(PAGE, PAGE, 4 * PAGE)).ok().unwrap();

    {
        let mut guard = heap.lock();
        let arena = guard.as_mut().unwrap();
        let p = arena.allocate(100, 16).unwrap();
        assert!(heap.try_lock().is_none());
        arena.free(p.as_ptr()).unwrap();
    }
    assert!(heap.try_lock().is_some());

    let arena = heap.get_mut().unwrap();
    assert_eq!(arena.bytes_in_use(), 0);
    arena.check().unwrap();
    assert!(heap.into_inner().is_some());
}

#[test]
fn concurrent_allocations_do_not_overlap() {
    let heap: LockedArena<HostPages> = LockedArena::new();
    heap.install(arena(4 * PAGE, 4 * PAGE, 1024 * PAGE)).ok().unwrap();

    thread::scope(|s| {
        for t in 0..4u8 {
            let heap = &heap;
            s.spawn(move || {
                let mut rng = Lcg(u64::from(t) + 1);
                let mut live = Vec::new();
                for _ in 0..1000 {
                    if live.len() < 32 && rng.below(3) != 0 {
                        let size = rng.below(512) as usize + 1;
                        let p = heap.allocate(size, 0).unwrap();
                        stamp(p.as_ptr(), size, t);
                        live.push((p, size));
                    } else if let Some((p, size)) = live.pop() {
                        assert!(verify(p.as_ptr(), size, t));
                        heap.free(p.as_ptr()).unwrap();
                    }
                }
                for (p, size) in live {
                    assert!(verify(p.as_ptr(), size, t));
                    heap.free(p.as_ptr()).unwrap();
                }
            });
        }
    });

    assert_eq!(heap.bytes_in_use(), 0);
    heap.with_arena(|a| a.check()).unwrap().unwrap();
}

static DISABLED: AtomicUsize = AtomicUsize::new(0);
static RESTORED: AtomicUsize = AtomicUsize::new(0);

struct CountingIrq;

impl IrqControl for CountingIrq {
    fn disable() -> bool {
        DISABLED.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn restore(were_enabled: bool) {
        assert!(were_enabled);
        RESTORED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn interrupts_are_masked_while_locked() {
    let heap: LockedArena<HostPages, CountingIrq> = LockedArena::new();
    heap.install(arena(PAGE, PAGE, 4 * PAGE)).ok().unwrap();
    let base = DISABLED.load(Ordering::SeqCst);

    let guard = heap.lock();
    assert_eq!(DISABLED.load(Ordering::SeqCst), base + 1);
    assert_eq!(RESTORED.load(Ordering::SeqCst), base);

    // a failed attempt leaves the mask as it was
    assert!(heap.try_lock().is_none());
    assert_eq!(DISABLED.load(Ordering::SeqCst), base + 2);
    assert_eq!(RESTORED.load(Ordering::SeqCst), base + 1);

    drop(guard);
    assert_eq!(RESTORED.load(Ordering::SeqCst), base + 2);

    let p = heap.allocate(32, 0).unwrap();
    heap.free(p.as_ptr()).unwrap();
    assert_eq!(DISABLED.load(Ordering::SeqCst), RESTORED.load(Ordering::SeqCst));
}
