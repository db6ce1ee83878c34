//! A tree of disjoint staged snapshots; backs the local mirror of
//! onDisconnect operations.

use std::collections::BTreeMap;

use crate::core::node::Node;
use crate::core::path::{ChildKey, Path};

#[derive(Default, Debug)]
pub struct SparseSnapshotTree {
    value: Option<Node>,
    children: BTreeMap<ChildKey, SparseSnapshotTree>,
}

impl SparseSnapshotTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Stages `node` at `path`, absorbing anything staged underneath.
    pub fn remember(&mut self, path: &Path, node: Node) {
        match path.front() {
            None => {
                self.value = Some(node);
                self.children.clear();
            }
            Some(front) => {
                if let Some(value) = &self.value {
                    self.value = Some(value.update_child(path, node));
                    return;
                }
                self.children
                    .entry(front.clone())
                    .or_default()
                    .remember(&path.pop_front(), node);
            }
        }
    }

    /// Unstages everything at or below `path`. Returns true when this
    /// subtree became empty and can be dropped by the parent.
    pub fn forget(&mut self, path: &Path) -> bool {
        match path.front() {
            None => {
                self.value = None;
                self.children.clear();
                true
            }
            Some(front) => {
                if let Some(value) = self.value.take() {
                    if value.is_leaf() {
                        // Forgetting below a leaf wipes the leaf.
                        return true;
                    }
                    // Split the staged node into per-child stages, then
                    // forget within the affected one.
                    for (key, child) in value.children() {
                        self.children
                            .entry(key.clone())
                            .or_default()
                            .remember(&Path::root(), child.clone());
                    }
                    self.forget(path)
                } else {
                    if let Some(child) = self.children.get_mut(front) {
                        if child.forget(&path.pop_front()) {
                            self.children.remove(front);
                        }
                    }
                    self.is_empty()
                }
            }
        }
    }

    /// Visits every staged snapshot with its absolute path.
    pub fn for_each<F>(&self, prefix: &Path, f: &mut F)
    where
        F: FnMut(&Path, &Node),
    {
        if let Some(value) = &self.value {
            f(prefix, value);
        } else {
            for (key, child) in &self.children {
                child.for_each(&prefix.child(key.clone()), f);
            }
        }
    }
}
