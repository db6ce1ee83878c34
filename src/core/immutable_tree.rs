//! A tree keyed by paths, with an optional value at every node.
//!
//! Backs the compound write log and the sync-point index. Updates return new
//! trees; subtrees are plain values so the structure stays send-safe.

use std::collections::BTreeMap;

use crate::core::path::{ChildKey, Path};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImmutableTree<T: Clone> {
    value: Option<T>,
    children: BTreeMap<ChildKey, ImmutableTree<T>>,
}

impl<T: Clone> Default for ImmutableTree<T> {
    fn default() -> Self {
        Self {
            value: None,
            children: BTreeMap::new(),
        }
    }
}

impl<T: Clone> ImmutableTree<T> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn leaf(value: T) -> Self {
        Self {
            value: Some(value),
            children: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn children(&self) -> impl Iterator<Item = (&ChildKey, &ImmutableTree<T>)> {
        self.children.iter()
    }

    pub fn child(&self, key: &ChildKey) -> ImmutableTree<T> {
        self.children.get(key).cloned().unwrap_or_default()
    }

    pub fn subtree(&self, path: &Path) -> ImmutableTree<T> {
        let mut current = self.clone();
        for key in path.segments() {
            match current.children.get(key) {
                Some(child) => current = child.clone(),
                None => return ImmutableTree::empty(),
            }
        }
        current
    }

    pub fn get(&self, path: &Path) -> Option<&T> {
        let mut current = self;
        for key in path.segments() {
            current = current.children.get(key)?;
        }
        current.value.as_ref()
    }

    pub fn set(&self, path: &Path, value: T) -> Self {
        self.update(path, |_| Some(value))
    }

    pub fn remove(&self, path: &Path) -> Self {
        self.update(path, |_| None)
    }

    pub fn update<F>(&self, path: &Path, f: F) -> Self
    where
        F: FnOnce(Option<&T>) -> Option<T>,
    {
        match path.front() {
            None => Self {
                value: f(self.value.as_ref()),
                children: self.children.clone(),
            },
            Some(front) => {
                let child = self.child(front).update(&path.pop_front(), f);
                let mut children = self.children.clone();
                if child.is_empty() {
                    children.remove(front);
                } else {
                    children.insert(front.clone(), child);
                }
                Self {
                    value: self.value.clone(),
                    children,
                }
            }
        }
    }

    /// Replaces the whole subtree at `path`.
    pub fn set_tree(&self, path: &Path, tree: ImmutableTree<T>) -> Self {
        match path.front() {
            None => tree,
            Some(front) => {
                let child = self.child(front).set_tree(&path.pop_front(), tree);
                let mut children = self.children.clone();
                if child.is_empty() {
                    children.remove(front);
                } else {
                    children.insert(front.clone(), child);
                }
                Self {
                    value: self.value.clone(),
                    children,
                }
            }
        }
    }

    /// The shallowest value on the way to `path`, with its location.
    pub fn find_root_most_value_and_path(&self, path: &Path) -> Option<(Path, &T)> {
        let mut current = self;
        let mut walked: Vec<ChildKey> = Vec::new();
        if let Some(value) = &current.value {
            return Some((Path::from_segments(walked), value));
        }
        for key in path.segments() {
            current = current.children.get(key)?;
            walked.push(key.clone());
            if let Some(value) = &current.value {
                return Some((Path::from_segments(walked), value));
            }
        }
        None
    }

    /// Depth-first traversal; the callback sees every stored value with its
    /// full path, parents before children.
    pub fn for_each<F>(&self, f: &mut F)
    where
        F: FnMut(&Path, &T),
    {
        self.for_each_at(&Path::root(), f);
    }

    fn for_each_at<F>(&self, prefix: &Path, f: &mut F)
    where
        F: FnMut(&Path, &T),
    {
        if let Some(value) = &self.value {
            f(prefix, value);
        }
        for (key, child) in &self.children {
            child.for_each_at(&prefix.child(key.clone()), f);
        }
    }

    /// All stored values with their paths, parents before children.
    pub fn entries(&self) -> Vec<(Path, T)> {
        let mut out = Vec::new();
        self.for_each(&mut |path, value| out.push((path.clone(), value.clone())));
        out
    }

    /// True when a value exists at `path` or any ancestor of it.
    pub fn has_value_on_path(&self, path: &Path) -> bool {
        self.find_root_most_value_and_path(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    #[test]
    fn set_get_remove() {
        let tree = ImmutableTree::empty()
            .set(&p("a/b"), 1)
            .set(&p("a/c"), 2)
            .set(&Path::root(), 0);

        assert_eq!(tree.get(&p("a/b")), Some(&1));
        assert_eq!(tree.get(&p("a/c")), Some(&2));
        assert_eq!(tree.get(&Path::root()), Some(&0));
        assert_eq!(tree.get(&p("a")), None);

        let removed = tree.remove(&p("a/b"));
        assert_eq!(removed.get(&p("a/b")), None);
        assert_eq!(removed.get(&p("a/c")), Some(&2));
    }

    #[test]
    fn removing_last_value_prunes_branches() {
        let tree = ImmutableTree::empty().set(&p("x/y/z"), 9).remove(&p("x/y/z"));
        assert!(tree.is_empty());
    }

    #[test]
    fn root_most_value_finds_shallowest() {
        let tree = ImmutableTree::empty().set(&p("a"), 1).set(&p("a/b/c"), 2);
        let (path, value) = tree.find_root_most_value_and_path(&p("a/b/c")).unwrap();
        assert_eq!(path, p("a"));
        assert_eq!(value, &1);
        assert!(tree.has_value_on_path(&p("a/b")));
        assert!(!tree.has_value_on_path(&p("q")));
    }

    #[test]
    fn entries_visit_parents_first() {
        let tree = ImmutableTree::empty().set(&p("a/b"), 2).set(&p("a"), 1);
        let entries = tree.entries();
        assert_eq!(entries, vec![(p("a"), 1), (p("a/b"), 2)]);
    }

    #[test]
    fn set_tree_replaces_subtree() {
        let replacement = ImmutableTree::leaf(7);
        let tree = ImmutableTree::empty()
            .set(&p("a/b"), 1)
            .set_tree(&p("a"), replacement);
        assert_eq!(tree.get(&p("a")), Some(&7));
        assert_eq!(tree.get(&p("a/b")), None);
    }
}
