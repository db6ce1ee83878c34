//! The two snapshots a view maintains: what listeners saw, and what the
//! server last confirmed.

use crate::core::node::{Index, IndexedNode, Node};
use crate::core::path::{ChildKey, Path};

/// A snapshot with provenance flags: whether it is complete (the whole node
/// is known) and whether it was filtered by query params on the way in.
#[derive(Clone, Debug)]
pub struct CacheNode {
    indexed: IndexedNode,
    fully_initialized: bool,
    filtered: bool,
}

impl CacheNode {
    pub fn new(indexed: IndexedNode, fully_initialized: bool, filtered: bool) -> Self {
        Self {
            indexed,
            fully_initialized,
            filtered,
        }
    }

    pub fn empty(index: Index) -> Self {
        Self {
            indexed: IndexedNode::new(Node::empty(), index),
            fully_initialized: false,
            filtered: false,
        }
    }

    pub fn indexed(&self) -> &IndexedNode {
        &self.indexed
    }

    pub fn node(&self) -> &Node {
        self.indexed.node()
    }

    pub fn is_fully_initialized(&self) -> bool {
        self.fully_initialized
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    pub fn is_complete_for_path(&self, path: &Path) -> bool {
        match path.front() {
            None => self.fully_initialized && !self.filtered,
            Some(front) => self.is_complete_for_child(front),
        }
    }

    pub fn is_complete_for_child(&self, key: &ChildKey) -> bool {
        (self.fully_initialized && !self.filtered) || self.node().has_child(key)
    }
}

#[derive(Clone, Debug)]
pub struct ViewCache {
    event_cache: CacheNode,
    server_cache: CacheNode,
}

impl ViewCache {
    pub fn new(event_cache: CacheNode, server_cache: CacheNode) -> Self {
        Self {
            event_cache,
            server_cache,
        }
    }

    pub fn event_cache(&self) -> &CacheNode {
        &self.event_cache
    }

    pub fn server_cache(&self) -> &CacheNode {
        &self.server_cache
    }

    /// The event snapshot, when it is complete.
    pub fn complete_event_snap(&self) -> Option<&Node> {
        self.event_cache
            .is_fully_initialized()
            .then(|| self.event_cache.node())
    }

    /// The server snapshot, when it is complete.
    pub fn complete_server_snap(&self) -> Option<&Node> {
        self.server_cache
            .is_fully_initialized()
            .then(|| self.server_cache.node())
    }

    pub fn update_event_snap(
        &self,
        indexed: IndexedNode,
        complete: bool,
        filtered: bool,
    ) -> ViewCache {
        ViewCache {
            event_cache: CacheNode::new(indexed, complete, filtered),
            server_cache: self.server_cache.clone(),
        }
    }

    pub fn update_server_snap(
        &self,
        indexed: IndexedNode,
        complete: bool,
        filtered: bool,
    ) -> ViewCache {
        ViewCache {
            event_cache: self.event_cache.clone(),
            server_cache: CacheNode::new(indexed, complete, filtered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::serializer::json_to_node;
    use serde_json::json;

    #[test]
    fn completeness_rules() {
        let node = json_to_node(&json!({ "a": 1 })).unwrap();
        let full = CacheNode::new(IndexedNode::new(node.clone(), Index::Priority), true, false);
        assert!(full.is_complete_for_path(&Path::root()));
        assert!(full.is_complete_for_child(&ChildKey::new("missing").unwrap()));

        let filtered = CacheNode::new(IndexedNode::new(node, Index::Priority), true, true);
        assert!(!filtered.is_complete_for_path(&Path::root()));
        // A filtered cache still vouches for children it actually holds.
        assert!(filtered.is_complete_for_child(&ChildKey::new("a").unwrap()));
        assert!(!filtered.is_complete_for_child(&ChildKey::new("b").unwrap()));
    }
}
