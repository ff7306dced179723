//! # `kmalloc` Front End
//!
//! The allocation interface the rest of the kernel uses. Until the heap arena
//! is installed, requests are served by a [`Placement`] bump allocator over
//! a fixed early-boot region; such memory is never returned. Afterwards all
//! requests go to the locked arena.
//!
//! ```ignore
//! #[global_allocator]
//! static KERNEL_HEAP: KernelHeap<ReservedRegion, X86Irq> =
//!     KernelHeap::new(Placement::new(EARLY_START, EARLY_END));
//! ```

use crate::error::HeapError;
use crate::locked::{IrqControl, LockedArena, NoIrq};
use crate::provider::PageProvider;
use crate::Arena;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{trace, warn};

/// Virtual to physical address translation for DMA-style requests.
pub trait Translate {
    /// Physical address backing `virt`, if mapped.
    fn translate(&self, virt: usize) -> Option<u64>;
}

/// Lock-free bump allocator over `[start, end)`.
pub struct Placement {
    start: usize,
    next: AtomicUsize,
    end: usize,
}

impl Placement {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            next: AtomicUsize::new(start),
            end,
        }
    }

    /// Hands out the next `size` bytes at `alignment` (`0` meaning none).
    ///
    /// # Errors
    /// [`HeapError::InvalidAlignment`] or [`HeapError::OutOfMemory`] once the
    /// region is used up.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(HeapError::InvalidAlignment(alignment));
        }
        let oom = HeapError::OutOfMemory { requested: size };
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let base = current.checked_next_multiple_of(alignment).ok_or(oom)?;
            let next = base
                .checked_add(size.max(1))
                .filter(|&next| next <= self.end)
                .ok_or(oom)?;
            match self
                .next
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    trace!("Placement allocation of {size} bytes at {base:#x}");
                    return NonNull::new(base as *mut u8).ok_or(oom);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether `addr` was handed out by this allocator.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.next.load(Ordering::Acquire)
    }

    /// Bytes handed out so far, alignment gaps included.
    pub fn used(&self) -> usize {
        self.next.load(Ordering::Acquire) - self.start
    }
}

/// Kernel heap: placement allocation until an arena is installed, the
/// locked arena afterwards.
pub struct KernelHeap<P: PageProvider, I: IrqControl = NoIrq> {
    arena: LockedArena<P, I>,
    placement: Placement,
}

impl<P: PageProvider, I: IrqControl> KernelHeap<P, I> {
    #[must_use]
    pub const fn new(placement: Placement) -> Self {
        Self {
            arena: LockedArena::new(),
            placement,
        }
    }

    /// Switches from placement allocation to `arena`.
    ///
    /// # Errors
    /// Hands `arena` back if one is already installed.
    pub fn install(&self, arena: Arena<P>) -> Result<(), Arena<P>> {
        self.arena.install(arena)
    }

    #[must_use]
    pub const fn arena(&self) -> &LockedArena<P, I> {
        &self.arena
    }

    #[must_use]
    pub const fn placement(&self) -> &Placement {
        &self.placement
    }

    /// # Errors
    /// [`HeapError::OutOfMemory`] if the request cannot be served.
    pub fn kmalloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.allocate(size, 0)
    }

    /// Page-aligned allocation.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if the request cannot be served.
    pub fn kmalloc_aligned(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.allocate(size, P::PAGE_SIZE)
    }

    /// Allocation that also reports its physical address.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if the request cannot be served, and
    /// [`HeapError::Unmapped`] if `translate` knows no backing for it. The
    /// allocation is released again in the latter case.
    pub fn kmalloc_phys(
        &self,
        size: usize,
        translate: &impl Translate,
    ) -> Result<(NonNull<u8>, u64), HeapError> {
        let ptr = self.allocate(size, 0)?;
        self.with_phys(ptr, translate)
    }

    /// Page-aligned allocation that also reports its physical address.
    ///
    /// # Errors
    /// See [`kmalloc_phys`](Self::kmalloc_phys).
    pub fn kmalloc_aligned_phys(
        &self,
        size: usize,
        translate: &impl Translate,
    ) -> Result<(NonNull<u8>, u64), HeapError> {
        let ptr = self.allocate(size, P::PAGE_SIZE)?;
        self.with_phys(ptr, translate)
    }

    /// Releases memory from any `kmalloc` variant.
    ///
    /// Placement memory and null pointers are ignored.
    pub fn kfree(&self, ptr: *mut u8) {
        let addr = ptr as usize;
        if ptr.is_null() || self.placement.contains(addr) {
            return;
        }
        if let Err(e) = self.arena.free(ptr) {
            warn!("kfree({addr:#x}) failed: {e}");
        }
    }

    fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        if self.arena.is_installed() {
            self.arena.allocate(size, alignment)
        } else {
            self.placement.allocate(size, alignment)
        }
    }

    fn with_phys(
        &self,
        ptr: NonNull<u8>,
        translate: &impl Translate,
    ) -> Result<(NonNull<u8>, u64), HeapError> {
        let addr = ptr.as_ptr() as usize;
        if let Some(phys) = translate.translate(addr) {
            return Ok((ptr, phys));
        }
        warn!("No physical backing for kernel heap address {addr:#x}");
        self.kfree(ptr.as_ptr());
        Err(HeapError::Unmapped(addr))
    }
}

unsafe impl<P: PageProvider + Send, I: IrqControl> GlobalAlloc for KernelHeap<P, I> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.kfree(ptr);
    }
}
