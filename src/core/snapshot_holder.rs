//! Mutable holder for a complete in-memory tree; backs the `.info` data.

use crate::core::node::Node;
use crate::core::path::Path;

#[derive(Default, Debug)]
pub struct SnapshotHolder {
    root: Node,
}

impl SnapshotHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Node {
        self.root.get(path)
    }

    pub fn update(&mut self, path: &Path, node: Node) {
        self.root = self.root.update_child(path, node);
    }
}
