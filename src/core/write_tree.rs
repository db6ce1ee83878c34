//! The ordered log of not-yet-acknowledged user writes.
//!
//! Writes are totally ordered by write id; later writes shadow earlier ones
//! on overlapping paths. The tree keeps a flattened `CompoundWrite` of all
//! visible writes for fast lookups and recomputes it from the log when a
//! write in the middle is removed or reverted.

use crate::core::compound_write::CompoundWrite;
use crate::core::node::{IndexedNode, Node};
use crate::core::path::{ChildKey, Path};
use crate::core::view::view_cache::CacheNode;

#[derive(Clone, Debug)]
pub enum WritePayload {
    Overwrite(Node),
    Merge(CompoundWrite),
}

#[derive(Clone, Debug)]
pub struct UserWriteRecord {
    pub write_id: u64,
    pub path: Path,
    pub payload: WritePayload,
    /// Invisible writes (transaction intermediates) never reach views but
    /// still participate in hash/offline math.
    pub visible: bool,
}

impl UserWriteRecord {
    fn overlaps(&self, path: &Path) -> bool {
        self.path.overlaps(path)
    }
}

#[derive(Debug, Default)]
pub struct WriteTree {
    visible_writes: CompoundWrite,
    all_writes: Vec<UserWriteRecord>,
    last_write_id: Option<u64>,
}

impl WriteTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.all_writes.is_empty()
    }

    pub fn records(&self) -> &[UserWriteRecord] {
        &self.all_writes
    }

    pub fn add_overwrite(&mut self, path: Path, snap: Node, write_id: u64, visible: bool) {
        debug_assert!(
            self.last_write_id.map(|last| write_id > last).unwrap_or(true),
            "write ids must be issued in order"
        );
        if visible {
            self.visible_writes = self.visible_writes.add_write(&path, snap.clone());
        }
        self.all_writes.push(UserWriteRecord {
            write_id,
            path,
            payload: WritePayload::Overwrite(snap),
            visible,
        });
        self.last_write_id = Some(write_id);
    }

    pub fn add_merge(&mut self, path: Path, changed_children: CompoundWrite, write_id: u64) {
        debug_assert!(
            self.last_write_id.map(|last| write_id > last).unwrap_or(true),
            "write ids must be issued in order"
        );
        for (child_path, node) in changed_children.entries() {
            self.visible_writes = self
                .visible_writes
                .add_write(&path.join(&child_path), node);
        }
        self.all_writes.push(UserWriteRecord {
            write_id,
            path,
            payload: WritePayload::Merge(changed_children),
            visible: true,
        });
        self.last_write_id = Some(write_id);
    }

    pub fn get_write(&self, write_id: u64) -> Option<&UserWriteRecord> {
        self.all_writes
            .iter()
            .find(|record| record.write_id == write_id)
    }

    /// Removes the record; returns true when views may have been observing
    /// it, in which case callers must re-evaluate affected views.
    pub fn remove_write(&mut self, write_id: u64) -> bool {
        let Some(index) = self
            .all_writes
            .iter()
            .position(|record| record.write_id == write_id)
        else {
            return false;
        };
        let removed = self.all_writes.remove(index);
        if !removed.visible {
            return false;
        }

        let overlaps_other = self
            .all_writes
            .iter()
            .any(|record| record.overlaps(&removed.path));
        if overlaps_other {
            // A shadow may have hidden or merged with this write; rebuild the
            // flattened view from the log.
            self.visible_writes = Self::layer_tree(&self.all_writes, &Path::root(), |_| true);
        } else {
            match &removed.payload {
                WritePayload::Overwrite(_) => {
                    self.visible_writes = self.visible_writes.remove_write(&removed.path);
                }
                WritePayload::Merge(children) => {
                    for (child_path, _) in children.entries() {
                        self.visible_writes = self
                            .visible_writes
                            .remove_write(&removed.path.join(&child_path));
                    }
                }
            }
        }
        true
    }

    /// Drops every record, returning them in write-id order for cancellation.
    pub fn purge_all_writes(&mut self) -> Vec<UserWriteRecord> {
        let purged = std::mem::take(&mut self.all_writes);
        self.visible_writes = CompoundWrite::empty();
        purged
    }

    /// The write-shadowed value at `path` if pending writes fully pin it.
    pub fn shadowing_write(&self, path: &Path) -> Option<Node> {
        self.visible_writes.get_complete_node(path)
    }

    /// The complete local view at `tree_path`, given whatever complete server
    /// data exists. `exclude` drops specific writes (revert previews);
    /// `include_hidden` folds invisible writes in.
    pub fn calc_complete_event_cache(
        &self,
        tree_path: &Path,
        complete_server_cache: Option<&Node>,
        exclude: &[u64],
        include_hidden: bool,
    ) -> Option<Node> {
        if exclude.is_empty() && !include_hidden {
            if let Some(shadowing) = self.visible_writes.get_complete_node(tree_path) {
                return Some(shadowing);
            }
            let sub_merge = self.visible_writes.child_compound_write(tree_path);
            if sub_merge.is_empty() {
                return complete_server_cache.cloned();
            }
            if complete_server_cache.is_none() && !sub_merge.has_complete_write(&Path::root()) {
                return None;
            }
            let layered = complete_server_cache.cloned().unwrap_or_else(Node::empty);
            return Some(sub_merge.apply(&layered));
        }

        let merge = self.visible_writes.child_compound_write(tree_path);
        if !include_hidden && merge.is_empty() {
            return complete_server_cache.cloned();
        }
        if !include_hidden
            && complete_server_cache.is_none()
            && !merge.has_complete_write(&Path::root())
        {
            return None;
        }
        let filtered = Self::layer_tree(&self.all_writes, tree_path, |record| {
            (record.visible || include_hidden)
                && !exclude.contains(&record.write_id)
                && record.overlaps(tree_path)
        });
        let layered = complete_server_cache.cloned().unwrap_or_else(Node::empty);
        Some(filtered.apply(&layered))
    }

    /// Complete top-level children visible at `tree_path`.
    pub fn calc_complete_event_children(
        &self,
        tree_path: &Path,
        complete_server_children: Option<&Node>,
    ) -> Node {
        let mut complete = Node::empty();
        if let Some(top_level) = self.visible_writes.get_complete_node(tree_path) {
            for (key, child) in top_level.children() {
                complete = complete.update_immediate_child(key, child.clone());
            }
            return complete;
        }

        let merge = self.visible_writes.child_compound_write(tree_path);
        if let Some(server_children) = complete_server_children {
            for (key, child) in server_children.children() {
                let overlaid = merge
                    .child_compound_write(&Path::root().child(key.clone()))
                    .apply(child);
                complete = complete.update_immediate_child(key, overlaid);
            }
        }
        for (key, node) in merge.complete_children() {
            complete = complete.update_immediate_child(&key, node);
        }
        complete
    }

    /// After a server overwrite at `tree_path`/`child_path`, the new event
    /// snapshot there, or `None` when local writes completely shadow it.
    pub fn calc_event_cache_after_server_overwrite(
        &self,
        tree_path: &Path,
        child_path: &Path,
        existing_server_snap: &Node,
    ) -> Option<Node> {
        let path = tree_path.join(child_path);
        if self.visible_writes.has_complete_write(&path) {
            return None;
        }
        let child_merge = self.visible_writes.child_compound_write(&path);
        if child_merge.is_empty() {
            return Some(existing_server_snap.get(child_path));
        }
        Some(child_merge.apply(&existing_server_snap.get(child_path)))
    }

    /// A complete view of one child, when either writes pin it or the server
    /// cache is complete for it.
    pub fn calc_complete_child(
        &self,
        tree_path: &Path,
        child_key: &ChildKey,
        existing_server_cache: &CacheNode,
    ) -> Option<Node> {
        let path = tree_path.join(&Path::root().child(child_key.clone()));
        if let Some(shadowing) = self.visible_writes.get_complete_node(&path) {
            return Some(shadowing);
        }
        if existing_server_cache.is_complete_for_child(child_key) {
            let child_merge = self.visible_writes.child_compound_write(&path);
            return Some(
                child_merge.apply(&existing_server_cache.node().immediate_child(child_key)),
            );
        }
        None
    }

    /// The child that follows `post_key`/`post_node` in index order within
    /// the merged local view, used by limited views to refill their window.
    #[allow(clippy::too_many_arguments)]
    pub fn calc_next_node_after_post(
        &self,
        tree_path: &Path,
        complete_server_data: Option<&Node>,
        post_key: &ChildKey,
        post_node: &Node,
        reverse: bool,
        index: &crate::core::node::Index,
    ) -> Option<(ChildKey, Node)> {
        let merge = self.visible_writes.child_compound_write(tree_path);
        let to_iterate = match merge.get_complete_node(&Path::root()) {
            Some(shadowing) => shadowing,
            None => match complete_server_data {
                Some(server) => merge.apply(server),
                None => return None,
            },
        };
        let indexed = IndexedNode::new(to_iterate, index.clone());
        let candidates: Vec<(ChildKey, Node)> = if reverse {
            indexed.iter_rev().collect()
        } else {
            indexed.iter().collect()
        };
        candidates
            .into_iter()
            .find(|(key, node)| {
                let cmp = index.compare((post_key, post_node), (key, node));
                if reverse {
                    cmp == std::cmp::Ordering::Greater
                } else {
                    cmp == std::cmp::Ordering::Less
                }
            })
    }

    /// A view of this write tree scoped to one query path.
    pub fn child_writes(&self, path: Path) -> WriteTreeRef<'_> {
        WriteTreeRef {
            path,
            write_tree: self,
        }
    }

    fn layer_tree<F>(writes: &[UserWriteRecord], tree_path: &Path, filter: F) -> CompoundWrite
    where
        F: Fn(&UserWriteRecord) -> bool,
    {
        let mut compound = CompoundWrite::empty();
        for record in writes {
            if !filter(record) {
                continue;
            }
            match &record.payload {
                WritePayload::Overwrite(snap) => {
                    if tree_path.contains(&record.path) {
                        let relative = tree_path.relative(&record.path).expect("prefix checked");
                        compound = compound.add_write(&relative, snap.clone());
                    } else if record.path.contains(tree_path) {
                        let relative = record.path.relative(tree_path).expect("prefix checked");
                        compound = compound.add_write(&Path::root(), snap.get(&relative));
                    }
                }
                WritePayload::Merge(children) => {
                    if tree_path.contains(&record.path) {
                        let relative = tree_path.relative(&record.path).expect("prefix checked");
                        compound = compound.add_writes(&relative, &children.entries());
                    } else if record.path.contains(tree_path) {
                        let relative = record.path.relative(tree_path).expect("prefix checked");
                        if relative.is_empty() {
                            compound = compound.add_writes(&Path::root(), &children.entries());
                        } else if let Some(deep) = children.get_complete_node(&relative) {
                            compound = compound.add_write(&Path::root(), deep);
                        }
                    }
                }
            }
        }
        compound
    }
}

/// A write tree scoped to the path of one query; what views consult while
/// applying operations.
pub struct WriteTreeRef<'a> {
    path: Path,
    write_tree: &'a WriteTree,
}

impl<'a> WriteTreeRef<'a> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn calc_complete_event_cache(&self, complete_server_cache: Option<&Node>) -> Option<Node> {
        self.write_tree
            .calc_complete_event_cache(&self.path, complete_server_cache, &[], false)
    }

    pub fn calc_complete_event_children(&self, complete_server_children: Option<&Node>) -> Node {
        self.write_tree
            .calc_complete_event_children(&self.path, complete_server_children)
    }

    pub fn calc_event_cache_after_server_overwrite(
        &self,
        child_path: &Path,
        existing_server_snap: &Node,
    ) -> Option<Node> {
        self.write_tree.calc_event_cache_after_server_overwrite(
            &self.path,
            child_path,
            existing_server_snap,
        )
    }

    pub fn shadowing_write(&self, child_path: &Path) -> Option<Node> {
        self.write_tree
            .shadowing_write(&self.path.join(child_path))
    }

    pub fn calc_complete_child(
        &self,
        child_key: &ChildKey,
        existing_server_cache: &CacheNode,
    ) -> Option<Node> {
        self.write_tree
            .calc_complete_child(&self.path, child_key, existing_server_cache)
    }

    pub fn calc_next_node_after_post(
        &self,
        complete_server_data: Option<&Node>,
        post_key: &ChildKey,
        post_node: &Node,
        reverse: bool,
        index: &crate::core::node::Index,
    ) -> Option<(ChildKey, Node)> {
        self.write_tree.calc_next_node_after_post(
            &self.path,
            complete_server_data,
            post_key,
            post_node,
            reverse,
            index,
        )
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
    fn later_writes_shadow_earlier_ones() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("x"), n(json!(1)), 1, true);
        tree.add_overwrite(p("x"), n(json!(2)), 2, true);

        assert_eq!(tree.shadowing_write(&p("x")).unwrap().value(), json!(2));
        let cache = tree
            .calc_complete_event_cache(&Path::root(), Some(&Node::empty()), &[], false)
            .unwrap();
        assert_eq!(cache.value(), json!({ "x": 2 }));
    }

    #[test]
    fn removing_shadowed_write_keeps_visible_value() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("x"), n(json!(1)), 1, true);
        tree.add_overwrite(p("x"), n(json!(2)), 2, true);

        assert!(tree.remove_write(1));
        assert_eq!(tree.shadowing_write(&p("x")).unwrap().value(), json!(2));

        assert!(tree.remove_write(2));
        assert!(tree.shadowing_write(&p("x")).is_none());
    }

    #[test]
    fn exclusion_previews_a_revert() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("x"), n(json!(1)), 1, true);
        tree.add_overwrite(p("y"), n(json!(2)), 2, true);

        let without_first = tree
            .calc_complete_event_cache(&Path::root(), Some(&Node::empty()), &[1], false)
            .unwrap();
        assert_eq!(without_first.value(), json!({ "y": 2 }));
    }

    #[test]
    fn merge_fragments_layer_over_server_data() {
        let mut tree = WriteTree::new();
        let merge = CompoundWrite::empty()
            .add_write(&p("a"), n(json!(10)))
            .add_write(&p("b/c"), n(json!(20)));
        tree.add_merge(p("room"), merge, 1);

        let server = n(json!({ "a": 1, "b": { "c": 2, "d": 3 }, "e": 4 }));
        let cache = tree
            .calc_complete_event_cache(&p("room"), Some(&server), &[], false)
            .unwrap();
        assert_eq!(
            cache.value(),
            json!({ "a": 10, "b": { "c": 20, "d": 3 }, "e": 4 })
        );
    }

    #[test]
    fn hidden_writes_are_excluded_unless_requested() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("t"), n(json!("staged")), 1, false);

        let visible = tree.calc_complete_event_cache(&Path::root(), Some(&Node::empty()), &[], false);
        assert_eq!(visible.unwrap().value(), json!(null));

        let with_hidden = tree
            .calc_complete_event_cache(&Path::root(), Some(&Node::empty()), &[], true)
            .unwrap();
        assert_eq!(with_hidden.value(), json!({ "t": "staged" }));
    }

    #[test]
    fn complete_event_children_merges_server_and_writes() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("room/b"), n(json!(2)), 1, true);

        let server = n(json!({ "a": 1 }));
        let children = tree.calc_complete_event_children(&p("room"), Some(&server));
        assert_eq!(children.value(), json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn event_cache_after_server_overwrite_respects_shadows() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("room/a"), n(json!("local")), 1, true);

        let server = n(json!({ "a": "server", "b": "server" }));
        // /room/a is fully shadowed: no server-driven change visible.
        assert!(tree
            .calc_event_cache_after_server_overwrite(&p("room"), &p("a"), &server)
            .is_none());
        // /room/b passes through.
        assert_eq!(
            tree.calc_event_cache_after_server_overwrite(&p("room"), &p("b"), &server)
                .unwrap()
                .value(),
            json!("server")
        );
    }

    #[test]
    fn purge_returns_records_in_order() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a"), n(json!(1)), 1, true);
        tree.add_overwrite(p("b"), n(json!(2)), 2, true);

        let purged = tree.purge_all_writes();
        let ids: Vec<u64> = purged.iter().map(|record| record.write_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(tree.is_empty());
        assert!(tree.shadowing_write(&p("a")).is_none());
    }
}
