//! The net effect of a set of overlapping writes.
//!
//! A compound write stores node fragments at paths; deeper fragments refine
//! shallower ones, and applying the compound to a base node overlays every
//! fragment. Adding a write at a path discards any fragments underneath it
//! (the new write shadows them).

use crate::core::immutable_tree::ImmutableTree;
use crate::core::node::Node;
use crate::core::path::{ChildKey, Path};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompoundWrite {
    writes: ImmutableTree<Node>,
}

impl CompoundWrite {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn add_write(&self, path: &Path, node: Node) -> CompoundWrite {
        if path.is_empty() {
            return CompoundWrite {
                writes: ImmutableTree::leaf(node),
            };
        }
        // An ancestor write absorbs this one instead of adding a fragment.
        if let Some((ancestor_path, ancestor)) = self.writes.find_root_most_value_and_path(path) {
            let relative = ancestor_path
                .relative(path)
                .expect("root-most path is a prefix");
            let updated = ancestor.update_child(&relative, node);
            return CompoundWrite {
                writes: self.writes.set(&ancestor_path, updated),
            };
        }
        CompoundWrite {
            writes: self.writes.set_tree(path, ImmutableTree::leaf(node)),
        }
    }

    pub fn add_writes(&self, path: &Path, children: &[(Path, Node)]) -> CompoundWrite {
        children.iter().fold(self.clone(), |acc, (child_path, node)| {
            acc.add_write(&path.join(child_path), node.clone())
        })
    }

    /// Removes the write at exactly `path` (and fragments underneath it).
    /// Writes at ancestors are untouched; they still shadow `path`.
    pub fn remove_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return CompoundWrite::empty();
        }
        CompoundWrite {
            writes: self.writes.set_tree(path, ImmutableTree::empty()),
        }
    }

    /// Whether this compound fully determines the node at `path`.
    pub fn has_complete_write(&self, path: &Path) -> bool {
        self.get_complete_node(path).is_some()
    }

    /// The node at `path` if some fragment at or above it pins the value.
    pub fn get_complete_node(&self, path: &Path) -> Option<Node> {
        let (ancestor_path, ancestor) = self.writes.find_root_most_value_and_path(path)?;
        let relative = ancestor_path
            .relative(path)
            .expect("root-most path is a prefix");
        Some(ancestor.get(&relative))
    }

    /// Immediate children of the root that are completely written.
    pub fn complete_children(&self) -> Vec<(ChildKey, Node)> {
        let mut out = Vec::new();
        if let Some(node) = self.writes.value() {
            for (key, child) in node.children() {
                out.push((key.clone(), child.clone()));
            }
            return out;
        }
        for (key, subtree) in self.writes.children() {
            if let Some(node) = subtree.value() {
                out.push((key.clone(), node.clone()));
            }
        }
        out
    }

    pub fn child_compound_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return self.clone();
        }
        if let Some(node) = self.get_complete_node(path) {
            return CompoundWrite {
                writes: ImmutableTree::leaf(node),
            };
        }
        CompoundWrite {
            writes: self.writes.subtree(path),
        }
    }

    /// Overlays every fragment onto `node`.
    pub fn apply(&self, node: &Node) -> Node {
        let mut result = node.clone();
        self.writes.for_each(&mut |path, fragment| {
            result = result.update_child(path, fragment.clone());
        });
        result
    }

    /// Every fragment with its path, shallowest first.
    pub fn entries(&self) -> Vec<(Path, Node)> {
        self.writes.entries()
    }

    pub(crate) fn tree(&self) -> &ImmutableTree<Node> {
        &self.writes
    }

    pub(crate) fn from_tree(writes: ImmutableTree<Node>) -> CompoundWrite {
        CompoundWrite { writes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::serializer::json_to_node;
    use serde_json::json;

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn n(value: serde_json::Value) -> Node {
        json_to_node(&value).unwrap()
    }

    #[test]
    fn apply_overlays_fragments() {
        let write = CompoundWrite::empty()
            .add_write(&p("a/x"), n(json!(1)))
            .add_write(&p("b"), n(json!({ "y": 2 })));
        let base = n(json!({ "a": { "keep": true }, "b": { "old": 0 } }));
        assert_eq!(
            write.apply(&base).value(),
            json!({ "a": { "keep": true, "x": 1 }, "b": { "y": 2 } })
        );
    }

    #[test]
    fn deeper_write_merges_into_ancestor_fragment() {
        let write = CompoundWrite::empty()
            .add_write(&p("a"), n(json!({ "x": 1 })))
            .add_write(&p("a/y"), n(json!(2)));
        assert_eq!(
            write.get_complete_node(&p("a")).unwrap().value(),
            json!({ "x": 1, "y": 2 })
        );
    }

    #[test]
    fn later_shallow_write_shadows_deeper_fragments() {
        let write = CompoundWrite::empty()
            .add_write(&p("a/x"), n(json!(1)))
            .add_write(&p("a"), n(json!({ "fresh": true })));
        assert_eq!(
            write.get_complete_node(&p("a")).unwrap().value(),
            json!({ "fresh": true })
        );
        assert_eq!(write.get_complete_node(&p("a/x")).unwrap().value(), json!(null));
    }

    #[test]
    fn complete_node_requires_covering_fragment() {
        let write = CompoundWrite::empty().add_write(&p("a/x"), n(json!(1)));
        assert!(write.get_complete_node(&p("a")).is_none());
        assert!(write.has_complete_write(&p("a/x")));
        assert!(write.has_complete_write(&p("a/x/deep")));
    }

    #[test]
    fn remove_write_keeps_ancestor_shadow() {
        let write = CompoundWrite::empty()
            .add_write(&p("a"), n(json!({ "x": 1 })))
            .remove_write(&p("a/x"));
        // The ancestor still pins /a entirely.
        assert_eq!(
            write.get_complete_node(&p("a")).unwrap().value(),
            json!({ "x": 1 })
        );

        let removed = CompoundWrite::empty()
            .add_write(&p("a/x"), n(json!(1)))
            .remove_write(&p("a/x"));
        assert!(removed.is_empty());
    }

    #[test]
    fn child_compound_write_narrows_scope() {
        let write = CompoundWrite::empty()
            .add_write(&p("a/x"), n(json!(1)))
            .add_write(&p("b"), n(json!(2)));
        let child = write.child_compound_write(&p("a"));
        assert_eq!(child.get_complete_node(&p("x")).unwrap().value(), json!(1));
        assert!(child.get_complete_node(&p("b")).is_none());
    }

    #[test]
    fn complete_children_from_root_fragment_and_subtrees() {
        let from_root = CompoundWrite::empty().add_write(&Path::root(), n(json!({ "a": 1 })));
        assert_eq!(from_root.complete_children().len(), 1);

        let from_subtree = CompoundWrite::empty()
            .add_write(&p("a"), n(json!(1)))
            .add_write(&p("b/deep"), n(json!(2)));
        let children = from_subtree.complete_children();
        // Only /a is complete at the child level; /b has just a deep fragment.
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0.as_str(), "a");
    }
}
