//! Boundary tags and the byte-level layout of a block.
//!
//! ```text
//!  addr                 addr + USER_OFFSET                  addr + size
//!  │                    │                                            │
//!  ▼                    ▼                                            ▼
//!  ┌─────────┬──────────┬───────────────────────────┬───────┬────────┐
//!  │ magic   │ SizeWord │ payload                   │ magic │ header │
//!  └─────────┴──────────┴───────────────────────────┴───────┴────────┘
//!  └──── BlockHeader ───┘ (free: RbNode lives here)  └─ BlockFooter ──┘
//! ```
//!
//! While a block is free, its payload starts with the [`RbNode`] that links
//! it into the free-block tree. While it is used, that space belongs to the
//! caller.

use bitfield_struct::bitfield;
use core::ptr::NonNull;
use kernel_rbtree::RbNode;

/// Size granularity: every block size is a multiple of the pointer width.
pub const GRANULE: usize = size_of::<usize>();

/// Magic stamped into every header and footer.
pub const BLOCK_MAGIC: u64 = 0xA1B2_C3D4_5E6F_7081;

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();
pub const FOOTER_SIZE: usize = size_of::<BlockFooter>();

/// Distance from a block's header to the pointer handed to the caller.
pub const USER_OFFSET: usize = HEADER_SIZE;

/// Smallest block that can hold both tags and a tree node.
pub const MIN_BLOCK_SIZE: usize = round_up(HEADER_SIZE + size_of::<RbNode>() + FOOTER_SIZE);

/// Rounds `size` up to the next multiple of [`GRANULE`].
#[inline]
#[must_use]
pub const fn round_up(size: usize) -> usize {
    (size + GRANULE - 1) & !(GRANULE - 1)
}

/// Size of the block needed to serve a request of `size` bytes.
///
/// Returns `None` if the computation overflows.
#[must_use]
pub const fn block_size_for(size: usize) -> Option<usize> {
    let Some(raw) = size.checked_add(USER_OFFSET + FOOTER_SIZE + GRANULE - 1) else {
        return None;
    };
    let rounded = raw & !(GRANULE - 1);
    if rounded < MIN_BLOCK_SIZE {
        Some(MIN_BLOCK_SIZE)
    } else {
        Some(rounded)
    }
}

/// Bytes to skip at the front of a block so that its user pointer is aligned.
///
/// A non-zero padding becomes a free block of its own and is therefore
/// grown in steps of `alignment` until it reaches [`MIN_BLOCK_SIZE`].
#[must_use]
pub const fn align_padding(user_addr: usize, alignment: usize) -> usize {
    let misalignment = user_addr % alignment;
    if misalignment == 0 {
        return 0;
    }
    let mut padding = alignment - misalignment;
    while padding < MIN_BLOCK_SIZE {
        padding += alignment;
    }
    padding
}

/// Upper bound of [`align_padding`] for any address.
#[must_use]
pub const fn worst_case_padding(alignment: usize) -> usize {
    if alignment <= GRANULE {
        0
    } else {
        alignment + MIN_BLOCK_SIZE
    }
}

/// Second header word: block size and state.
#[bitfield(u64)]
pub struct SizeWord {
    /// Bit 0: the block is free and indexed by the tree.
    pub free: bool,

    /// Bits 1-2: reserved.
    #[bits(2, default = 0)]
    _reserved_1_2: u8,

    /// Bits 3-63: size in granules.
    #[bits(61)]
    pub granules: u64,
}

impl SizeWord {
    pub const fn of(size: usize, free: bool) -> Self {
        Self::new()
            .with_free(free)
            .with_granules((size / GRANULE) as u64)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub const fn size(self) -> usize {
        self.granules() as usize * GRANULE
    }
}

#[repr(C)]
pub struct BlockHeader {
    magic: u64,
    word: SizeWord,
}

#[repr(C)]
pub struct BlockFooter {
    magic: u64,
    header: *mut BlockHeader,
}

/// Handle to a block header somewhere inside an arena.
///
/// A handle is only an address; every accessor that touches memory is
/// `unsafe` and requires the tags it reads to lie in committed arena memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Block(NonNull<BlockHeader>);

impl Block {
    /// # Safety
    /// `addr` must be non-null and [`GRANULE`]-aligned.
    #[inline]
    pub const unsafe fn at(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr % GRANULE == 0);
        Self(unsafe { NonNull::new_unchecked(addr as *mut BlockHeader) })
    }

    /// The block whose embedded tree node is `node`.
    #[inline]
    pub fn from_node(node: NonNull<RbNode>) -> Self {
        Self(unsafe { node.byte_sub(HEADER_SIZE) }.cast())
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn node(self) -> NonNull<RbNode> {
        unsafe { self.0.byte_add(HEADER_SIZE) }.cast()
    }

    #[inline]
    pub fn user_ptr(self) -> NonNull<u8> {
        unsafe { self.0.byte_add(USER_OFFSET) }.cast()
    }

    #[inline]
    pub fn user_addr(self) -> usize {
        self.addr() + USER_OFFSET
    }

    /// # Safety
    /// The header must be readable.
    #[inline]
    pub unsafe fn header_ok(self) -> bool {
        unsafe { (*self.0.as_ptr()).magic == BLOCK_MAGIC }
    }

    /// # Safety
    /// The header must be readable.
    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { (*self.0.as_ptr()).word.size() }
    }

    /// # Safety
    /// The header must be readable.
    #[inline]
    pub unsafe fn is_free(self) -> bool {
        unsafe { (*self.0.as_ptr()).word.free() }
    }

    /// First byte after this block.
    ///
    /// # Safety
    /// The header must be readable.
    #[inline]
    pub unsafe fn end(self) -> usize {
        self.addr() + unsafe { self.size() }
    }

    /// # Safety
    /// Header and footer must be readable.
    pub unsafe fn footer_ok(self) -> bool {
        unsafe {
            let footer = footer_at(self.end());
            (*footer).magic == BLOCK_MAGIC && (*footer).header == self.0.as_ptr()
        }
    }

    /// Stamps header and footer for a block of `size` bytes.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be writable arena memory and `size` a
    /// multiple of [`GRANULE`] no smaller than [`MIN_BLOCK_SIZE`].
    pub unsafe fn write_tags(self, size: usize, free: bool) {
        debug_assert!(size >= MIN_BLOCK_SIZE && size % GRANULE == 0);
        unsafe {
            self.0.as_ptr().write(BlockHeader {
                magic: BLOCK_MAGIC,
                word: SizeWord::of(size, free),
            });
            footer_at(self.addr() + size).write(BlockFooter {
                magic: BLOCK_MAGIC,
                header: self.0.as_ptr(),
            });
        }
    }

    /// Clobbers the header magic.
    ///
    /// # Safety
    /// The header must be writable.
    #[cfg(test)]
    pub unsafe fn scribble(self) {
        unsafe { (*self.0.as_ptr()).magic = !BLOCK_MAGIC }
    }
}

/// Header address recorded by the footer that ends right before `addr`.
///
/// Returns `None` if that footer's magic does not match.
///
/// # Safety
/// `[addr - FOOTER_SIZE, addr)` must be readable.
pub unsafe fn header_before(addr: usize) -> Option<usize> {
    unsafe {
        let footer = footer_at(addr);
        ((*footer).magic == BLOCK_MAGIC).then(|| (*footer).header as usize)
    }
}

/// Footer of a block ending at `end`.
#[inline]
fn footer_at(end: usize) -> *mut BlockFooter {
    (end - FOOTER_SIZE) as *mut BlockFooter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    #[test]
    fn layout_constants() {
        assert_eq!(HEADER_SIZE, 2 * 8);
        assert_eq!(FOOTER_SIZE, 2 * size_of::<usize>());
        assert_eq!(MIN_BLOCK_SIZE % GRANULE, 0);
        assert!(MIN_BLOCK_SIZE >= HEADER_SIZE + size_of::<RbNode>() + FOOTER_SIZE);
    }

    #[test]
    fn request_sizes_are_rounded_and_floored() {
        assert_eq!(block_size_for(0), Some(MIN_BLOCK_SIZE));
        assert_eq!(block_size_for(1), Some(MIN_BLOCK_SIZE));
        let big = 1000;
        let expected = round_up(big + USER_OFFSET + FOOTER_SIZE);
        assert_eq!(block_size_for(big), Some(expected));
        assert_eq!(block_size_for(usize::MAX), None);
    }

    #[test]
    fn padding_is_zero_or_a_whole_block() {
        assert_eq!(align_padding(0x1000, 4096), 0);
        assert_eq!(align_padding(0x1010, 1), 0);
        assert_eq!(align_padding(0x1010, 8), 0);

        // 0x1010 -> 0x2000 needs 0xff0 bytes: already big enough.
        assert_eq!(align_padding(0x1010, 4096), 0xff0);

        // 0x1010 -> 0x1020 is 16 bytes, too small for a block; keep stepping.
        let p = align_padding(0x1010, 32);
        assert!(p >= MIN_BLOCK_SIZE);
        assert_eq!((0x1010 + p) % 32, 0);
        assert!(p <= worst_case_padding(32));
    }

    #[test]
    fn size_word_round_trips_size_and_state() {
        let w = SizeWord::of(4096, true);
        assert!(w.free());
        assert_eq!(w.size(), 4096);
        let w = SizeWord::of(MIN_BLOCK_SIZE, false);
        assert!(!w.free());
        assert_eq!(w.size(), MIN_BLOCK_SIZE);
    }

    #[test]
    fn tags_link_header_and_footer() {
        let mut page = Page([0; 4096]);
        let base = page.0.as_mut_ptr() as usize;
        unsafe {
            let block = Block::at(base);
            block.write_tags(256, true);
            assert!(block.header_ok());
            assert!(block.footer_ok());
            assert!(block.is_free());
            assert_eq!(block.size(), 256);
            assert_eq!(block.end(), base + 256);
            assert_eq!(header_before(base + 256), Some(base));
            assert_eq!(Block::from_node(block.node()), block);
            assert_eq!(block.user_addr(), base + USER_OFFSET);

            block.scribble();
            assert!(!block.header_ok());
        }
    }
}
