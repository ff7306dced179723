use core::fmt;
use kernel_rbtree::TreeViolation;

/// Recoverable heap failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("arena bounds {start:#x}..{end:#x} are not page aligned")]
    Misaligned { start: usize, end: usize },
    #[error("invalid arena geometry: {0}")]
    InvalidGeometry(&'static str),
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("out of memory: no room for {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("double free of {0:#x}")]
    DoubleFree(usize),
    #[error("heap is not initialized")]
    Uninitialized,
    #[error("no physical backing for {0:#x}")]
    Unmapped(usize),
}

/// Structural damage found by [`Arena::check`](crate::Arena::check).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ArenaViolation {
    #[error("bad header magic at {0:#x}")]
    BadHeader(usize),
    #[error("block at {address:#x} has impossible size {size:#x}")]
    BadSize { address: usize, size: usize },
    #[error("footer of block at {0:#x} does not point back at its header")]
    BadFooter(usize),
    #[error("free block at {0:#x} follows another free block")]
    AdjacentFree(usize),
    #[error("tree node at {0:#x} belongs to a used block")]
    IndexedUsed(usize),
    #[error("{free} free blocks in the arena but {indexed} in the tree")]
    Unindexed { free: usize, indexed: usize },
    #[error("{counted} bytes in used blocks but {recorded} accounted")]
    Accounting { counted: usize, recorded: usize },
    #[error(transparent)]
    Tree(#[from] TreeViolation),
}

/// Reports damaged heap metadata and halts.
///
/// Nothing about the heap can be trusted past this point, so there is no
/// recovery path.
#[cold]
#[inline(never)]
#[track_caller]
pub fn heap_corruption(args: fmt::Arguments<'_>) -> ! {
    log::error!("heap corruption: {args}");
    panic!("heap corruption: {args}");
}
