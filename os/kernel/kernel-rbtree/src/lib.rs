//! # Intrusive Red-Black Tree with Duplicate Chains
//!
//! A balanced binary search tree whose nodes live *inside* the objects they
//! index, so building the index never allocates. It is the free-block index
//! of the kernel heap, but knows nothing about memory blocks: keys, ordering
//! and duplicate selection all come from a [`Comparator`].
//!
//! ## Algorithm
//!
//! Both insertion and removal are single-pass, top-down red-black
//! algorithms working below a dummy head node:
//!
//! * **insert** flips colors on the way down whenever a node has two red
//!   children and repairs red-red violations with a single or double
//!   rotation at the grandparent.
//! * **remove** pushes a red node down the search path (flips or
//!   rotations), so that the bottom node can be cut out without touching
//!   the black height; the match is replaced by its in-order predecessor.
//!
//! ## Duplicates
//!
//! A node whose key is already resident joins that node's duplicate chain.
//! The tree shape therefore only depends on the number of *distinct* keys.
//! Removal prefers chain members, chosen through
//! [`Comparator::select_duplicate`], which lets a caller ask for a specific
//! node ("the block at address X") among equal keys.
//!
//! ## Comparators
//!
//! [`Comparator::compare`] classifies a node against a search key and
//! caller-supplied arguments:
//!
//! | result    | meaning                                  | search goes |
//! |-----------|------------------------------------------|-------------|
//! | `Less`    | node cannot match, too small             | right       |
//! | `Equal`   | node is a match                          | left        |
//! | `Greater` | node is larger than what is looked for   | left        |
//!
//! Reporting every sufficiently large node as `Equal` turns removal into a
//! best-fit search: the last match on the path is the smallest one.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod node;
mod tree;
mod validate;

use core::cmp::Ordering;
use core::ptr::NonNull;

pub use node::{Color, Link, RbNode};
pub use tree::RbTree;
pub use validate::TreeViolation;

/// Ordering and selection policy of an [`RbTree`].
///
/// The tree only ever hands out pointers to nodes that are currently linked
/// or are being inserted, so implementations may dereference them.
pub trait Comparator {
    /// Key that orders resident nodes.
    type Key: Ord + Copy;

    /// Side-channel arguments of a removal.
    type Args;

    /// Key of a linked node. Must not change while the node is linked.
    fn key_of(&self, node: NonNull<RbNode>) -> Self::Key;

    /// Classifies `node` against a search for `key`.
    fn compare(&self, node: NonNull<RbNode>, key: Self::Key, args: &Self::Args) -> Ordering;

    /// Whether `node`, which compared `Equal` by key, is acceptable for this removal.
    fn select_duplicate(&self, node: NonNull<RbNode>, args: &Self::Args) -> bool;
}
