//! Top-down insertion and removal.

use crate::Comparator;
use crate::node::{
    Color, LEFT, Link, RIGHT, RbNode, child, dup_of, flip, is_red, paint, paint_link, rotate,
    rotate_double, set_child, set_dup,
};
use core::cmp::Ordering;
use core::ops::ControlFlow;
use core::ptr::NonNull;

/// Intrusive red-black tree with duplicate chains.
///
/// Nodes are owned by the caller; the tree only links them. Inserting a node
/// whose key is already present attaches it to the duplicate chain of the
/// resident node instead of growing the tree.
///
/// # Invariants
/// - The root is black.
/// - No red node has a red child.
/// - Every path from a node to a null link crosses the same number of black nodes.
/// - In-order traversal of resident nodes yields strictly increasing keys.
pub struct RbTree<C: Comparator> {
    root: Link,
    nodes: usize,
    duplicates: usize,
    comparator: C,
}

// Safety: the tree never shares its nodes; whoever owns the tree owns the links.
unsafe impl<C: Comparator + Send> Send for RbTree<C> {}

impl<C: Comparator> RbTree<C> {
    pub const fn new(comparator: C) -> Self {
        Self {
            root: None,
            nodes: 0,
            duplicates: 0,
            comparator,
        }
    }

    /// Number of tree-resident nodes (one per distinct key).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes
    }

    /// Number of nodes parked on duplicate chains.
    #[must_use]
    pub const fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Total number of linked nodes, duplicates included.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.nodes + self.duplicates
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    #[must_use]
    pub const fn root(&self) -> Link {
        self.root
    }

    #[must_use]
    pub const fn comparator(&self) -> &C {
        &self.comparator
    }

    /// Links `node` into the tree.
    ///
    /// The node's previous link contents are discarded.
    ///
    /// # Panics
    /// Only if the tree's own red-black structure is already broken, e.g.
    /// because a linked node was overwritten.
    ///
    /// # Safety
    /// - `node` must be valid for reads and writes and must not already be linked.
    /// - It must stay valid, and its key must not change, until it is returned by [`remove`](Self::remove).
    pub unsafe fn insert(&mut self, node: NonNull<RbNode>) {
        unsafe {
            node.as_ptr().write(RbNode::new());
        }
        let key = self.comparator.key_of(node);

        let Some(root) = self.root else {
            self.root = Some(node);
            self.nodes = 1;
            unsafe { paint(node, Color::Black) };
            return;
        };

        // Dummy head above the real root; `head.links[RIGHT]` is the root.
        let mut head = RbNode::new();
        let head = NonNull::from(&mut head);

        unsafe {
            set_child(head, RIGHT, Some(root));

            let mut t = head; // great-grandparent
            let mut g: Link = None;
            let mut p: Link = None;
            let mut n: Link = Some(root);
            let mut dir = LEFT;
            let mut last = LEFT;

            loop {
                let current = match n {
                    None => {
                        // Attach at the bottom.
                        let parent = p.expect("an empty slot always has a parent");
                        set_child(parent, dir, Some(node));
                        self.nodes += 1;
                        node
                    }
                    Some(current) => {
                        if is_red(child(current, LEFT)) && is_red(child(current, RIGHT)) {
                            paint(current, Color::Red);
                            paint_link(child(current, LEFT), Color::Black);
                            paint_link(child(current, RIGHT), Color::Black);
                        }
                        current
                    }
                };

                // Red node below a red parent: rotate at the grandparent.
                if is_red(Some(current)) && is_red(p) {
                    let parent = p.expect("checked by is_red");
                    let grand = g.expect("a red parent is never the root");
                    let dir2 = usize::from(child(t, RIGHT) == Some(grand));

                    let top = if child(parent, last) == Some(current) {
                        rotate(grand, flip(last))
                    } else {
                        rotate_double(grand, flip(last))
                    };
                    set_child(t, dir2, Some(top));
                }

                let order = self.comparator.key_of(current).cmp(&key);
                if order == Ordering::Equal {
                    if current != node {
                        set_dup(node, dup_of(current));
                        set_dup(current, Some(node));
                        self.duplicates += 1;
                    }
                    break;
                }

                last = dir;
                dir = usize::from(order == Ordering::Less);

                if let Some(grand) = g {
                    t = grand;
                }
                g = p;
                p = Some(current);
                n = child(current, dir);
            }

            self.root = child(head, RIGHT);
            paint_link(self.root, Color::Black);
        }
    }

    /// Removes the best node matching `key` under `args` and returns it.
    ///
    /// The search descends like a lookup for `key`: nodes the comparator
    /// reports as [`Less`](Ordering::Less) send it right, everything else
    /// sends it left. The last node reported as [`Equal`](Ordering::Equal) on
    /// that path is the match, i.e. the smallest matching key.
    ///
    /// If the match has duplicates, the first chain member accepted by
    /// [`Comparator::select_duplicate`] is unlinked. If none is accepted but
    /// the resident node is, the first duplicate is promoted into the
    /// resident's tree slot. Without duplicates the resident node is removed
    /// with a regular red-black deletion if it is accepted.
    ///
    /// Returns `None` if nothing matches; that is an ordinary outcome.
    ///
    /// # Panics
    /// Only if the tree's own red-black structure is already broken.
    ///
    /// # Safety
    /// All linked nodes must still be valid (see [`insert`](Self::insert)).
    pub unsafe fn remove(&mut self, key: C::Key, args: &C::Args) -> Option<NonNull<RbNode>> {
        let root = self.root?;

        let mut head = RbNode::new();
        let head = NonNull::from(&mut head);

        unsafe {
            set_child(head, RIGHT, Some(root));

            let mut n = head;
            let mut p = head;
            let mut found: Link = None;
            let mut found_parent = head;
            let mut found_dir = RIGHT;
            let mut dir = RIGHT;

            // Push a red node down the search path so the bottom node can be
            // unlinked without breaking the black height.
            while let Some(next) = child(n, dir) {
                let last = dir;

                let grand = p;
                p = n;
                n = next;

                let order = self.comparator.compare(n, key, args);
                dir = usize::from(order == Ordering::Less);

                if order == Ordering::Equal {
                    found = Some(n);
                    found_parent = p;
                    found_dir = last;
                }

                if is_red(Some(n)) || is_red(child(n, dir)) {
                    continue;
                }

                if is_red(child(n, flip(dir))) {
                    let top = rotate(n, dir);
                    set_child(p, last, Some(top));
                    p = top;

                    if found == Some(n) {
                        found_parent = p;
                        found_dir = dir;
                    }
                } else if let Some(sibling) = child(p, flip(last)) {
                    if !is_red(child(sibling, LEFT)) && !is_red(child(sibling, RIGHT)) {
                        paint(p, Color::Black);
                        paint(sibling, Color::Red);
                        paint(n, Color::Red);
                    } else {
                        let dir2 = usize::from(child(grand, RIGHT) == Some(p));

                        if is_red(child(sibling, flip(last))) {
                            set_child(grand, dir2, Some(rotate(p, last)));
                        } else {
                            set_child(grand, dir2, Some(rotate_double(p, last)));
                        }

                        let top = child(grand, dir2).expect("rotation result was just linked");
                        paint(n, Color::Red);
                        paint(top, Color::Red);
                        paint_link(child(top, LEFT), Color::Black);
                        paint_link(child(top, RIGHT), Color::Black);

                        // `p` moved below `top`.
                        if found == Some(p) {
                            found_parent = top;
                            found_dir = last;
                        }
                    }
                }
            }

            let removed = match found {
                Some(f) if dup_of(f).is_some() => self.take_duplicate(f, found_parent, found_dir, args),
                Some(f) if self.comparator.select_duplicate(f, args) => {
                    // `n` is the in-order predecessor of `f` (or `f` itself).
                    let side = usize::from(child(p, RIGHT) == Some(n));
                    let orphan = child(n, usize::from(child(n, LEFT).is_none()));
                    set_child(p, side, orphan);
                    self.nodes -= 1;

                    if n != f {
                        (*n.as_ptr()).links = (*f.as_ptr()).links;
                        (*n.as_ptr()).color = (*f.as_ptr()).color;
                        set_child(found_parent, found_dir, Some(n));
                    }
                    Some(f)
                }
                _ => None,
            };

            self.root = child(head, RIGHT);
            paint_link(self.root, Color::Black);

            if let Some(node) = removed {
                (*node.as_ptr()).links = [None, None];
                set_dup(node, None);
            }
            removed
        }
    }

    /// Unlinks a member of `resident`'s duplicate chain, or promotes the first
    /// duplicate into the resident's slot when only the resident is accepted.
    unsafe fn take_duplicate(
        &mut self,
        resident: NonNull<RbNode>,
        parent: NonNull<RbNode>,
        dir: usize,
        args: &C::Args,
    ) -> Link {
        unsafe {
            let mut prev = resident;
            let mut cursor = dup_of(resident);
            while let Some(candidate) = cursor {
                if self.comparator.select_duplicate(candidate, args) {
                    set_dup(prev, dup_of(candidate));
                    self.duplicates -= 1;
                    return Some(candidate);
                }
                prev = candidate;
                cursor = dup_of(candidate);
            }

            if !self.comparator.select_duplicate(resident, args) {
                return None;
            }

            let heir = dup_of(resident).expect("resident has a duplicate chain");
            (*heir.as_ptr()).links = (*resident.as_ptr()).links;
            (*heir.as_ptr()).color = (*resident.as_ptr()).color;
            set_child(parent, dir, Some(heir));
            self.duplicates -= 1;
            Some(resident)
        }
    }

    /// Visits linked nodes whose key is at least `from`, in ascending key
    /// order, until `visit` breaks. Returns the break value.
    ///
    /// Duplicates are visited right after their resident node. Subtrees
    /// below `from` are skipped.
    pub fn scan_from<B>(
        &self,
        from: C::Key,
        mut visit: impl FnMut(NonNull<RbNode>) -> ControlFlow<B>,
    ) -> Option<B> {
        fn walk<C: Comparator, B>(
            tree: &RbTree<C>,
            link: Link,
            from: C::Key,
            visit: &mut impl FnMut(NonNull<RbNode>) -> ControlFlow<B>,
        ) -> ControlFlow<B> {
            let Some(node) = link else {
                return ControlFlow::Continue(());
            };
            unsafe {
                if tree.comparator.key_of(node) >= from {
                    walk(tree, child(node, LEFT), from, visit)?;
                    visit(node)?;
                    let mut dup = dup_of(node);
                    while let Some(d) = dup {
                        visit(d)?;
                        dup = dup_of(d);
                    }
                }
                walk(tree, child(node, RIGHT), from, visit)
            }
        }
        match walk(self, self.root, from, &mut visit) {
            ControlFlow::Break(found) => Some(found),
            ControlFlow::Continue(()) => None,
        }
    }

    /// Visits every linked node in ascending key order.
    ///
    /// Duplicates are visited right after their resident node.
    pub fn for_each(&self, mut f: impl FnMut(NonNull<RbNode>)) {
        fn walk(link: Link, f: &mut impl FnMut(NonNull<RbNode>)) {
            let Some(node) = link else {
                return;
            };
            unsafe {
                walk(child(node, LEFT), f);
                f(node);
                let mut dup = dup_of(node);
                while let Some(d) = dup {
                    f(d);
                    dup = dup_of(d);
                }
                walk(child(node, RIGHT), f);
            }
        }
        walk(self.root, &mut f);
    }
}
