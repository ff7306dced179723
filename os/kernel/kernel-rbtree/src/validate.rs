//! Independent structural checker.

use crate::node::{Color, Link, RbNode};
use crate::{Comparator, RbTree};
use core::ptr::NonNull;

/// A broken red-black or ordering invariant.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TreeViolation {
    #[error("the root is red")]
    RedRoot,
    #[error("red node {0:#x} has a red child")]
    RedRed(usize),
    #[error("black height differs below node {0:#x}")]
    BlackHeight(usize),
    #[error("node {0:#x} is out of key order")]
    Order(usize),
    #[error("duplicate {0:#x} has a different key than its resident node")]
    Duplicate(usize),
    #[error("counted {found} nodes but the tree reports {expected}")]
    Count { expected: usize, found: usize },
}

struct Walk {
    nodes: usize,
    duplicates: usize,
}

impl<C: Comparator> RbTree<C> {
    /// Recursively checks every invariant and returns the black height.
    ///
    /// The height counts the null links below the leaves as black, so a
    /// single black root has height 2. An empty tree has height 0.
    ///
    /// # Errors
    /// The first violation found.
    pub fn validate(&self) -> Result<usize, TreeViolation> {
        let Some(root) = self.root() else {
            if self.len() != 0 || self.duplicates() != 0 {
                return Err(TreeViolation::Count {
                    expected: self.total(),
                    found: 0,
                });
            }
            return Ok(0);
        };
        if unsafe { (*root.as_ptr()).color } == Color::Red {
            return Err(TreeViolation::RedRoot);
        }

        let mut walk = Walk {
            nodes: 0,
            duplicates: 0,
        };
        let height = self.check(Some(root), None, None, &mut walk)?;
        if walk.nodes != self.len() {
            return Err(TreeViolation::Count {
                expected: self.len(),
                found: walk.nodes,
            });
        }
        if walk.duplicates != self.duplicates() {
            return Err(TreeViolation::Count {
                expected: self.duplicates(),
                found: walk.duplicates,
            });
        }
        Ok(height)
    }

    fn check(
        &self,
        link: Link,
        lower: Option<C::Key>,
        upper: Option<C::Key>,
        walk: &mut Walk,
    ) -> Result<usize, TreeViolation> {
        let Some(node) = link else {
            return Ok(1);
        };
        let addr = node.as_ptr() as usize;
        let n: &RbNode = unsafe { node.as_ref() };
        let key = self.comparator().key_of(node);

        if lower.is_some_and(|lo| key <= lo) || upper.is_some_and(|hi| key >= hi) {
            return Err(TreeViolation::Order(addr));
        }

        if n.color == Color::Red && (is_red(n.left()) || is_red(n.right())) {
            return Err(TreeViolation::RedRed(addr));
        }

        walk.nodes += 1;
        let mut dup = n.duplicate();
        while let Some(d) = dup {
            if self.comparator().key_of(d) != key {
                return Err(TreeViolation::Duplicate(d.as_ptr() as usize));
            }
            walk.duplicates += 1;
            dup = unsafe { d.as_ref() }.duplicate();
        }

        let left = self.check(n.left(), lower, Some(key), walk)?;
        let right = self.check(n.right(), Some(key), upper, walk)?;
        if left != right {
            return Err(TreeViolation::BlackHeight(addr));
        }
        Ok(left + usize::from(n.color == Color::Black))
    }
}

fn is_red(link: Option<NonNull<RbNode>>) -> bool {
    link.is_some_and(|n| unsafe { n.as_ref() }.color == Color::Red)
}
