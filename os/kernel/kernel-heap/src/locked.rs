//! # Locked Arena
//!
//! An [`Arena`] behind a test-and-test-and-set spinlock, suitable for a
//! `static`. The lock can also mask interrupts for the duration of the
//! critical section through an [`IrqControl`] policy, so an interrupt
//! handler that allocates cannot deadlock against the code it preempted.
//!
//! ```ignore
//! static HEAP: LockedArena<ReservedRegion, X86Irq> = LockedArena::new();
//!
//! let arena = unsafe { Arena::create(start, end, min, max, ArenaFlags::kernel(), region)? };
//! HEAP.install(arena).ok();
//! ```

use crate::arena::Arena;
use crate::error::HeapError;
use crate::provider::PageProvider;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

/// Interrupt masking around a critical section.
pub trait IrqControl {
    /// Masks interrupts and reports whether they were enabled before.
    fn disable() -> bool;

    /// Undoes [`disable`](Self::disable).
    fn restore(were_enabled: bool);
}

/// Leaves interrupts alone.
pub struct NoIrq;

impl IrqControl for NoIrq {
    #[inline]
    fn disable() -> bool {
        false
    }

    #[inline]
    fn restore(_were_enabled: bool) {}
}

/// `cli`/`sti` based masking.
///
/// Only valid where `cli` is permitted, i.e. in ring 0.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub struct X86Irq;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl IrqControl for X86Irq {
    #[inline]
    fn disable() -> bool {
        let rflags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nostack, preserves_flags));
        }
        // IF is bit 9
        let were_enabled = rflags & (1 << 9) != 0;
        if were_enabled {
            unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        were_enabled
    }

    #[inline]
    fn restore(were_enabled: bool) {
        if were_enabled {
            unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
        }
    }
}

pub struct LockedArena<P: PageProvider, I: IrqControl = NoIrq> {
    /// lock state
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    /// Set once an arena has been installed; never cleared.
    installed: AtomicBool,
    arena: UnsafeCell<Option<Arena<P>>>,
    _irq: PhantomData<fn() -> I>,
}

// Safety: mutual exclusion; the arena only moves between threads as a whole.
unsafe impl<P: PageProvider + Send, I: IrqControl> Sync for LockedArena<P, I> {}

impl<P: PageProvider, I: IrqControl> Default for LockedArena<P, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PageProvider, I: IrqControl> LockedArena<P, I> {
    /// An empty lock; [`install`](Self::install) an arena before use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            installed: AtomicBool::new(false),
            arena: UnsafeCell::new(None),
            _irq: PhantomData,
        }
    }

    /// Installs `arena` unless one is already present.
    ///
    /// # Errors
    /// Hands `arena` back if the lock already holds one.
    pub fn install(&self, arena: Arena<P>) -> Result<(), Arena<P>> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(arena);
        }
        log::debug!("Installing arena {:#x}..{:#x}", arena.start(), arena.end());
        *guard = Some(arena);
        self.installed.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether an arena has been installed.
    #[inline]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Try once; returns immediately.
    ///
    /// Interrupts are masked only if the lock was taken.
    #[inline]
    pub fn try_lock(&self) -> Option<ArenaGuard<'_, P, I>> {
        let irq_were_enabled = I::disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(ArenaGuard {
                lock: self,
                irq_were_enabled,
            })
        } else {
            I::restore(irq_were_enabled);
            None
        }
    }

    /// Masks interrupts, then spins until the lock is acquired (TATAS).
    #[inline]
    pub fn lock(&self) -> ArenaGuard<'_, P, I> {
        let irq_were_enabled = I::disable();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        ArenaGuard {
            lock: self,
            irq_were_enabled,
        }
    }

    /// Runs `f` on the installed arena. Returns `None` if there is none.
    #[inline]
    pub fn with_arena<R>(&self, f: impl FnOnce(&mut Arena<P>) -> R) -> Option<R> {
        let mut guard = self.lock();
        guard.as_mut().map(f)
    }

    /// Locked [`Arena::allocate`].
    ///
    /// # Errors
    /// [`HeapError::Uninitialized`] before an arena was installed, otherwise
    /// whatever the arena reports.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_arena(|arena| arena.allocate(size, alignment))
            .unwrap_or(Err(HeapError::Uninitialized))
    }

    /// Locked [`Arena::free`].
    ///
    /// # Errors
    /// [`HeapError::Uninitialized`] before an arena was installed, otherwise
    /// whatever the arena reports.
    pub fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        self.with_arena(|arena| arena.free(ptr))
            .unwrap_or(Err(HeapError::Uninitialized))
    }

    /// Bytes in use, or `0` without an arena.
    pub fn bytes_in_use(&self) -> usize {
        self.with_arena(|arena| arena.bytes_in_use()).unwrap_or(0)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> Option<&mut Arena<P>> {
        self.arena.get_mut().as_mut()
    }

    pub fn into_inner(self) -> Option<Arena<P>> {
        self.arena.into_inner()
    }
}

/// Exclusive access to the arena slot; unlocks, then restores interrupts on drop.
pub struct ArenaGuard<'a, P: PageProvider, I: IrqControl> {
    lock: &'a LockedArena<P, I>,
    irq_were_enabled: bool,
}

impl<P: PageProvider, I: IrqControl> Deref for ArenaGuard<'_, P, I> {
    type Target = Option<Arena<P>>;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.arena.get() }
    }
}

impl<P: PageProvider, I: IrqControl> DerefMut for ArenaGuard<'_, P, I> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.arena.get() }
    }
}

impl<P: PageProvider, I: IrqControl> Drop for ArenaGuard<'_, P, I> {
    fn drop(&mut self) {
        // Release publishes the critical section.
        self.lock.locked.store(false, Ordering::Release);
        I::restore(self.irq_were_enabled);
    }
}
