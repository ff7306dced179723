//! Intrusive tree links and the primitive operations on them.

use core::ptr::NonNull;

/// Index of the left child in [`RbNode::links`].
pub const LEFT: usize = 0;

/// Index of the right child in [`RbNode::links`].
pub const RIGHT: usize = 1;

/// A nullable link to another node.
pub type Link = Option<NonNull<RbNode>>;

/// Node color.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Color {
    Red,
    Black,
}

/// Links embedded into every object that can live in an [`RbTree`](crate::RbTree).
///
/// The node carries no key of its own; the tree asks its
/// [`Comparator`](crate::Comparator) to derive one from the node's address.
/// Only the *representative* node of each distinct key takes part in the
/// tree shape. Further nodes with the same key hang off the representative
/// through the `dup` chain and never see a rotation.
///
/// ```text
///              [32]B
///             /     \
///        [16]R       [64]B ─dup─▶ [64] ─dup─▶ [64]
/// ```
#[repr(C)]
#[derive(Debug)]
pub struct RbNode {
    /// Left (`0`) and right (`1`) children.
    pub(crate) links: [Link; 2],
    /// Next node with an identical key.
    pub(crate) dup: Link,
    pub(crate) color: Color,
}

impl Default for RbNode {
    fn default() -> Self {
        Self::new()
    }
}

impl RbNode {
    /// A detached, red node.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            links: [None, None],
            dup: None,
            color: Color::Red,
        }
    }

    #[must_use]
    pub const fn color(&self) -> Color {
        self.color
    }

    #[must_use]
    pub const fn left(&self) -> Link {
        self.links[LEFT]
    }

    #[must_use]
    pub const fn right(&self) -> Link {
        self.links[RIGHT]
    }

    /// The next node in this node's duplicate chain.
    #[must_use]
    pub const fn duplicate(&self) -> Link {
        self.dup
    }
}

#[inline]
pub const fn flip(dir: usize) -> usize {
    dir ^ 1
}

#[inline]
pub unsafe fn child(node: NonNull<RbNode>, dir: usize) -> Link {
    unsafe { (*node.as_ptr()).links[dir] }
}

#[inline]
pub unsafe fn set_child(node: NonNull<RbNode>, dir: usize, value: Link) {
    unsafe { (*node.as_ptr()).links[dir] = value }
}

#[inline]
pub unsafe fn dup_of(node: NonNull<RbNode>) -> Link {
    unsafe { (*node.as_ptr()).dup }
}

#[inline]
pub unsafe fn set_dup(node: NonNull<RbNode>, value: Link) {
    unsafe { (*node.as_ptr()).dup = value }
}

#[inline]
pub unsafe fn is_red(node: Link) -> bool {
    node.is_some_and(|n| unsafe { (*n.as_ptr()).color } == Color::Red)
}

#[inline]
pub unsafe fn paint(node: NonNull<RbNode>, color: Color) {
    unsafe { (*node.as_ptr()).color = color }
}

/// Paints `node` if it exists.
#[inline]
pub unsafe fn paint_link(node: Link, color: Color) {
    if let Some(n) = node {
        unsafe { paint(n, color) }
    }
}

/// Single rotation of the subtree rooted at `root` towards `dir`.
///
/// The old root is painted red and the promoted child black; the promoted
/// child is returned as the new subtree root.
pub unsafe fn rotate(root: NonNull<RbNode>, dir: usize) -> NonNull<RbNode> {
    unsafe {
        let save = child(root, flip(dir)).expect("rotation pivot must have an inner child");
        set_child(root, flip(dir), child(save, dir));
        set_child(save, dir, Some(root));
        paint(root, Color::Red);
        paint(save, Color::Black);
        save
    }
}

/// Double rotation: first rotate the `!dir` child away from `dir`, then `root` towards `dir`.
pub unsafe fn rotate_double(root: NonNull<RbNode>, dir: usize) -> NonNull<RbNode> {
    unsafe {
        let inner = child(root, flip(dir)).expect("double rotation needs an inner child");
        set_child(root, flip(dir), Some(rotate(inner, flip(dir))));
        rotate(root, dir)
    }
}
