//! Ordering of free blocks inside the tree.

use crate::block::{Block, align_padding};
use core::cmp::Ordering;
use core::ptr::NonNull;
use kernel_rbtree::{Comparator, RbNode};

/// What a tree removal is after.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Lookup {
    /// Smallest block that still holds `required` bytes once its user
    /// pointer is moved up to `alignment`.
    BestFit { required: usize, alignment: usize },
    /// The block starting at `address`; the search key is its size.
    Exact { address: usize },
}

/// Keys free blocks by size.
#[derive(Debug, Default, Copy, Clone)]
pub struct BlockOrder;

impl BlockOrder {
    /// Whether `block` still holds `required` bytes after aligning its user pointer.
    pub fn fits(block: Block, required: usize, alignment: usize) -> bool {
        let padding = align_padding(block.user_addr(), alignment);
        unsafe { block.size() }
            .checked_sub(padding)
            .is_some_and(|usable| usable >= required)
    }

    /// Whether `node` or any member of its duplicate chain fits.
    fn chain_fits(node: NonNull<RbNode>, required: usize, alignment: usize) -> bool {
        let mut cursor = Some(node);
        while let Some(member) = cursor {
            if Self::fits(Block::from_node(member), required, alignment) {
                return true;
            }
            cursor = unsafe { member.as_ref() }.duplicate();
        }
        false
    }
}

impl Comparator for BlockOrder {
    type Key = usize;
    type Args = Lookup;

    fn key_of(&self, node: NonNull<RbNode>) -> usize {
        unsafe { Block::from_node(node).size() }
    }

    fn compare(&self, node: NonNull<RbNode>, key: usize, lookup: &Lookup) -> Ordering {
        let block = Block::from_node(node);
        match *lookup {
            Lookup::Exact { .. } => unsafe { block.size() }.cmp(&key),
            Lookup::BestFit { alignment, .. } if Self::chain_fits(node, key, alignment) => {
                Ordering::Equal
            }
            Lookup::BestFit { .. } => Ordering::Less,
        }
    }

    fn select_duplicate(&self, node: NonNull<RbNode>, lookup: &Lookup) -> bool {
        let block = Block::from_node(node);
        match *lookup {
            Lookup::Exact { address } => block.addr() == address,
            Lookup::BestFit {
                required,
                alignment,
            } => Self::fits(block, required, alignment),
        }
    }
}
