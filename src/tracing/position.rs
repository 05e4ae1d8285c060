//! Position of a message call within the call tree of one transaction.
//!
//! Two parallel encodings: the raw position indexes every child, the
//! compact position indexes only non-precompile children (a call into a
//! precompile shares its parent's compact position).

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CallPosition {
    raw: Vec<usize>,
    compact: Vec<usize>,
}

impl CallPosition {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(raw: Vec<usize>, compact: Vec<usize>) -> Self {
        Self { raw, compact }
    }

    pub fn raw(&self) -> &[usize] {
        &self.raw
    }

    pub fn compact(&self) -> &[usize] {
        &self.compact
    }

    pub fn is_root(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.raw.len() + 1
    }

    /// Position of a child appended at `child_index` among the raw children
    /// and `compact_index` among the non-precompile children. Precompile
    /// children keep the parent's compact position.
    pub fn child(&self, child_index: usize, compact_index: usize, precompiled: bool) -> Self {
        let mut raw = Vec::with_capacity(self.raw.len() + 1);
        raw.extend_from_slice(&self.raw);
        raw.push(child_index);
        let compact = if precompiled {
            self.compact.clone()
        } else {
            let mut c = Vec::with_capacity(self.compact.len() + 1);
            c.extend_from_slice(&self.compact);
            c.push(compact_index);
            c
        };
        Self { raw, compact }
    }

    pub fn ancestor_of(&self, descendant: &CallPosition) -> bool {
        descendant.raw.len() > self.raw.len() && descendant.raw[..self.raw.len()] == self.raw[..]
    }

    pub fn parent_of(&self, child: &CallPosition) -> bool {
        child.raw.len() == self.raw.len() + 1 && child.raw[..self.raw.len()] == self.raw[..]
    }

    /// Lexicographic happens-before order: `Less` means this call was
    /// entered before the other.
    pub fn cmp_order(&self, other: &CallPosition) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl fmt::Display for CallPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(path: &[usize]) -> String {
            if path.is_empty() {
                return "root".into();
            }
            path.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("_")
        }
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "{}({})", join(&self.raw), join(&self.compact))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_positions() {
        let root = CallPosition::root();
        let a = root.child(0, 0, false);
        let b = root.child(1, 0, true);
        let c = root.child(2, 1, false);
        assert_eq!(a.raw(), &[0]);
        assert_eq!(a.compact(), &[0]);
        assert_eq!(b.raw(), &[1]);
        assert_eq!(b.compact(), &[] as &[usize]);
        assert_eq!(c.raw(), &[2]);
        assert_eq!(c.compact(), &[1]);
    }

    #[test]
    fn compact_never_longer_than_raw() {
        let root = CallPosition::root();
        let p = root.child(0, 0, true).child(0, 0, false).child(1, 1, true);
        assert!(p.compact().len() <= p.raw().len());
        assert_eq!(p.raw().len() - p.compact().len(), 2);
    }

    #[test]
    fn order_and_relations() {
        let root = CallPosition::root();
        let a = root.child(0, 0, false);
        let aa = a.child(0, 0, false);
        let b = root.child(1, 1, false);
        assert_eq!(a.cmp_order(&b), Ordering::Less);
        assert_eq!(a.cmp_order(&aa), Ordering::Less);
        assert!(root.ancestor_of(&aa));
        assert!(a.parent_of(&aa));
        assert!(!a.parent_of(&b));
        assert!(root.parent_of(&a));
    }
}
