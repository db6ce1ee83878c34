//! Immutable snapshots handed to listener callbacks and read results.

use serde_json::Value;

use crate::api::reference::DatabaseReference;
use crate::core::node::{Index, IndexedNode, Node};
use crate::core::path::Path;
use crate::error::DatabaseResult;

#[derive(Clone, Debug)]
pub struct DataSnapshot {
    reference: DatabaseReference,
    node: Node,
    index: Index,
}

impl DataSnapshot {
    pub(crate) fn new(reference: DatabaseReference, node: Node, index: Index) -> Self {
        Self {
            reference,
            node,
            index,
        }
    }

    pub fn reference(&self) -> &DatabaseReference {
        &self.reference
    }

    pub fn key(&self) -> Option<&str> {
        self.reference.key()
    }

    /// Plain JSON value; `null` when nothing exists here.
    pub fn value(&self) -> Value {
        self.node.value()
    }

    pub fn into_value(self) -> Value {
        self.node.value()
    }

    /// Export-format JSON, `.priority` metadata included.
    pub fn export_value(&self) -> Value {
        self.node.export_value()
    }

    pub fn priority(&self) -> Value {
        self.node.priority().to_json()
    }

    pub fn exists(&self) -> bool {
        !self.node.is_empty()
    }

    pub fn has_children(&self) -> bool {
        self.node.num_children() > 0
    }

    pub fn size(&self) -> usize {
        self.node.num_children()
    }

    pub fn child(&self, relative_path: &str) -> DatabaseResult<DataSnapshot> {
        let relative = Path::parse(relative_path)?;
        Ok(DataSnapshot {
            reference: self.reference.child(relative_path)?,
            node: self.node.get(&relative),
            index: Index::Priority,
        })
    }

    pub fn has_child(&self, relative_path: &str) -> DatabaseResult<bool> {
        let relative = Path::parse(relative_path)?;
        Ok(!self.node.get(&relative).is_empty())
    }

    /// Visits every direct child in the order of the query this snapshot was
    /// produced for. Returning `true` stops iteration early.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(DataSnapshot) -> bool,
    {
        let indexed = IndexedNode::new(self.node.clone(), self.index.clone());
        for (key, child) in indexed.iter() {
            let Ok(reference) = self.reference.child(key.as_str()) else {
                continue;
            };
            let snapshot = DataSnapshot {
                reference,
                node: child,
                index: Index::Priority,
            };
            if f(snapshot) {
                break;
            }
        }
    }
}
