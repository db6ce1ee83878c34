//! Applies operations to a view cache and computes the resulting deltas.
//!
//! Server data flows into the server cache, is overlaid with pending writes,
//! and lands in the event cache through the view's filter; user writes go
//! straight to the event cache. Every path through here funnels child deltas
//! into one accumulator so a single operation yields one coherent batch.

use crate::core::compound_write::CompoundWrite;
use crate::core::immutable_tree::ImmutableTree;
use crate::core::node::{Index, IndexedNode, Node};
use crate::core::operation::{Operation, OperationSource};
use crate::core::path::{ChildKey, Path};
use crate::core::view::change::{Change, ChildChangeAccumulator};
use crate::core::view::filter::{CompleteChildSource, NoCompleteSource, NodeFilter};
use crate::core::view::view_cache::{CacheNode, ViewCache};
use crate::core::write_tree::WriteTreeRef;

pub struct ViewProcessor {
    filter: Box<dyn NodeFilter>,
}

impl ViewProcessor {
    pub fn new(filter: Box<dyn NodeFilter>) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &dyn NodeFilter {
        self.filter.as_ref()
    }

    pub fn apply_operation(
        &self,
        old_view_cache: &ViewCache,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
    ) -> (ViewCache, Vec<Change>) {
        let mut acc = ChildChangeAccumulator::new();
        let new_view_cache = match operation {
            Operation::Overwrite { source, path, snap } => match source {
                OperationSource::User => self.apply_user_overwrite(
                    old_view_cache,
                    path,
                    snap,
                    writes,
                    complete_cache,
                    &mut acc,
                ),
                OperationSource::Server | OperationSource::ServerTagged(_) => {
                    // Tagged data was already filtered by the server to the
                    // query's window; keep the server cache filtered then.
                    let filter_server = source.tag().is_some();
                    self.apply_server_overwrite(
                        old_view_cache,
                        path,
                        snap,
                        writes,
                        complete_cache,
                        filter_server,
                        &mut acc,
                    )
                }
            },
            Operation::Merge {
                source,
                path,
                children,
            } => match source {
                OperationSource::User => self.apply_user_merge(
                    old_view_cache,
                    path,
                    children,
                    writes,
                    complete_cache,
                    &mut acc,
                ),
                OperationSource::Server | OperationSource::ServerTagged(_) => {
                    let filter_server = source.tag().is_some();
                    self.apply_server_merge(
                        old_view_cache,
                        path,
                        children,
                        writes,
                        complete_cache,
                        filter_server,
                        &mut acc,
                    )
                }
            },
            Operation::AckUserWrite {
                path,
                affected,
                revert,
            } => {
                if *revert {
                    self.revert_user_write(old_view_cache, path, writes, complete_cache, &mut acc)
                } else {
                    self.ack_user_write(
                        old_view_cache,
                        path,
                        affected,
                        writes,
                        complete_cache,
                        &mut acc,
                    )
                }
            }
            Operation::ListenComplete { path, .. } => {
                self.listen_complete(old_view_cache, path, writes, &mut acc)
            }
        };

        let mut changes = acc.into_changes();
        Self::maybe_add_value_event(old_view_cache, &new_view_cache, &mut changes);
        (new_view_cache, changes)
    }

    fn maybe_add_value_event(
        old_view_cache: &ViewCache,
        new_view_cache: &ViewCache,
        changes: &mut Vec<Change>,
    ) {
        let event_cache = new_view_cache.event_cache();
        if !event_cache.is_fully_initialized() {
            return;
        }
        let node = event_cache.node();
        let is_leaf_or_empty = node.is_leaf() || node.is_empty();
        let old_complete = old_view_cache.complete_event_snap();

        let newly_initialized = !old_view_cache.event_cache().is_fully_initialized();
        let leaf_value_changed = is_leaf_or_empty && old_complete != Some(node);
        let priority_changed = old_complete
            .map(|old| old.priority() != node.priority())
            .unwrap_or(false);

        if !changes.is_empty() || newly_initialized || leaf_value_changed || priority_changed {
            changes.push(Change::Value {
                snapshot: node.clone(),
            });
        }
    }

    fn apply_user_overwrite(
        &self,
        old_view_cache: &ViewCache,
        change_path: &Path,
        changed_snap: &Node,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_event_snap = old_view_cache.event_cache();
        let source = WriteTreeCompleteChildSource {
            writes,
            view_cache: old_view_cache,
            complete_server_cache: complete_cache,
        };

        match change_path.front() {
            None => {
                let new_indexed =
                    IndexedNode::new(changed_snap.clone(), self.filter.index().clone());
                let new_event = self.filter.update_full_node(
                    old_event_snap.indexed(),
                    &new_indexed,
                    Some(&mut *acc),
                );
                old_view_cache.update_event_snap(new_event, true, self.filter.filters_nodes())
            }
            Some(front) if front.as_str() == ".priority" => {
                let priority = crate::core::node::Priority::from_json(&changed_snap.value())
                    .unwrap_or_default();
                let new_event = self
                    .filter
                    .update_priority(old_event_snap.indexed(), priority);
                old_view_cache.update_event_snap(
                    new_event,
                    old_event_snap.is_fully_initialized(),
                    old_event_snap.is_filtered(),
                )
            }
            Some(child_key) => {
                let child_change_path = change_path.pop_front();
                let old_child = old_event_snap.node().immediate_child(child_key);
                let new_child = if child_change_path.is_empty() {
                    changed_snap.clone()
                } else {
                    match source.complete_child(child_key) {
                        Some(complete_child) => {
                            if child_change_path
                                .back()
                                .map(|key| key.as_str() == ".priority")
                                .unwrap_or(false)
                                && complete_child
                                    .get(&child_change_path.parent().unwrap_or_default())
                                    .is_empty()
                            {
                                // Priority write on a node that no longer
                                // exists; nothing to update.
                                complete_child
                            } else {
                                complete_child.update_child(&child_change_path, changed_snap.clone())
                            }
                        }
                        None => Node::empty(),
                    }
                };
                if old_child == new_child {
                    old_view_cache.clone()
                } else {
                    let new_event = self.filter.update_child(
                        old_event_snap.indexed(),
                        child_key,
                        new_child,
                        &child_change_path,
                        &source,
                        Some(&mut *acc),
                    );
                    old_view_cache.update_event_snap(
                        new_event,
                        old_event_snap.is_fully_initialized(),
                        self.filter.filters_nodes(),
                    )
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_server_overwrite(
        &self,
        old_view_cache: &ViewCache,
        change_path: &Path,
        changed_snap: &Node,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        filter_server_node: bool,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_server_snap = old_view_cache.server_cache();
        let server_filter = if filter_server_node {
            self.filter.as_ref()
        } else {
            self.filter.indexed_filter()
        };

        let new_server_cache = match change_path.front() {
            None => {
                let new_indexed =
                    IndexedNode::new(changed_snap.clone(), server_filter.index().clone());
                server_filter.update_full_node(old_server_snap.indexed(), &new_indexed, None)
            }
            Some(_) if server_filter.filters_nodes() && !old_server_snap.is_filtered() => {
                // The server cache was complete but we now need it filtered;
                // run the change through as a full update.
                let new_server_node = old_server_snap
                    .node()
                    .update_child(change_path, changed_snap.clone());
                let new_indexed =
                    IndexedNode::new(new_server_node, server_filter.index().clone());
                server_filter.update_full_node(old_server_snap.indexed(), &new_indexed, None)
            }
            Some(child_key) => {
                if !old_server_snap.is_complete_for_path(change_path) && change_path.len() > 1 {
                    // Deep update for data this view never loaded; ignore.
                    return old_view_cache.clone();
                }
                let child_change_path = change_path.pop_front();
                let child_node = old_server_snap.node().immediate_child(child_key);
                let new_child_node =
                    child_node.update_child(&child_change_path, changed_snap.clone());
                if child_key.as_str() == ".priority" {
                    let priority =
                        crate::core::node::Priority::from_json(&new_child_node.value())
                            .unwrap_or_default();
                    server_filter.update_priority(old_server_snap.indexed(), priority)
                } else {
                    server_filter.update_child(
                        old_server_snap.indexed(),
                        child_key,
                        new_child_node,
                        &child_change_path,
                        &NoCompleteSource,
                        None,
                    )
                }
            }
        };

        let new_view_cache = old_view_cache.update_server_snap(
            new_server_cache,
            old_server_snap.is_fully_initialized() || change_path.is_empty(),
            server_filter.filters_nodes(),
        );
        let source = WriteTreeCompleteChildSource {
            writes,
            view_cache: &new_view_cache,
            complete_server_cache: complete_cache,
        };
        self.generate_event_cache_after_server_event(
            &new_view_cache,
            change_path,
            writes,
            &source,
            acc,
        )
    }

    fn apply_user_merge(
        &self,
        old_view_cache: &ViewCache,
        path: &Path,
        changed_children: &CompoundWrite,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        // Apply children the view already knows first, then the rest, so
        // partially-known merges refine rather than clobber.
        let mut current = old_view_cache.clone();
        for known in [true, false] {
            for (relative_path, child_node) in changed_children.entries() {
                let write_path = path.join(&relative_path);
                let Some(front) = write_path.front() else {
                    continue;
                };
                let is_known = old_view_cache.event_cache().is_complete_for_child(front);
                if is_known == known {
                    current = self.apply_user_overwrite(
                        &current,
                        &write_path,
                        &child_node,
                        writes,
                        complete_cache,
                        acc,
                    );
                }
            }
        }
        current
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_server_merge(
        &self,
        old_view_cache: &ViewCache,
        path: &Path,
        changed_children: &CompoundWrite,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        filter_server_node: bool,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        // No cache yet: this merge targets a previous listen at the same
        // location. Wait for the full update instead.
        if old_view_cache.server_cache().node().is_empty()
            && !old_view_cache.server_cache().is_fully_initialized()
        {
            return old_view_cache.clone();
        }

        let merge_tree = if path.is_empty() {
            changed_children.tree().clone()
        } else {
            ImmutableTree::empty().set_tree(path, changed_children.tree().clone())
        };

        let server_node = old_view_cache.server_cache().node().clone();
        let mut current = old_view_cache.clone();
        for pass in 0..2 {
            for (child_key, child_tree) in merge_tree.children() {
                let known = server_node.has_child(child_key);
                if (pass == 0) != known {
                    continue;
                }
                if pass == 1 {
                    // Deep merges into unknown children wait for real data.
                    let unknown_deep_merge = !old_view_cache
                        .server_cache()
                        .is_complete_for_child(child_key)
                        && child_tree.value().is_none();
                    if unknown_deep_merge {
                        continue;
                    }
                }
                let server_child = server_node.immediate_child(child_key);
                let new_child =
                    CompoundWrite::from_tree(child_tree.clone()).apply(&server_child);
                current = self.apply_server_overwrite(
                    &current,
                    &Path::root().child(child_key.clone()),
                    &new_child,
                    writes,
                    complete_cache,
                    filter_server_node,
                    acc,
                );
            }
        }
        current
    }

    fn ack_user_write(
        &self,
        old_view_cache: &ViewCache,
        ack_path: &Path,
        affected: &ImmutableTree<bool>,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes.shadowing_write(ack_path).is_some() {
            return old_view_cache.clone();
        }

        let filter_server_node = old_view_cache.server_cache().is_filtered();
        let server_cache = old_view_cache.server_cache();
        if affected.value().is_some() {
            // Ack of an overwrite: re-apply the confirmed server state.
            if (ack_path.is_empty() && server_cache.is_fully_initialized())
                || server_cache.is_complete_for_path(ack_path)
            {
                return self.apply_server_overwrite(
                    old_view_cache,
                    ack_path,
                    &server_cache.node().get(ack_path),
                    writes,
                    complete_cache,
                    filter_server_node,
                    acc,
                );
            }
            if ack_path.is_empty() {
                // Acked data at the root with incomplete cache: re-apply what
                // we do have as a merge.
                let mut changed_children = CompoundWrite::empty();
                for (key, node) in server_cache.node().children() {
                    changed_children = changed_children
                        .add_write(&Path::root().child(key.clone()), node.clone());
                }
                return self.apply_server_merge(
                    old_view_cache,
                    ack_path,
                    &changed_children,
                    writes,
                    complete_cache,
                    filter_server_node,
                    acc,
                );
            }
            return old_view_cache.clone();
        }

        // Ack of a merge: re-apply each confirmed fragment.
        let mut changed_children = CompoundWrite::empty();
        affected.for_each(&mut |merge_path, _| {
            let server_cache_path = ack_path.join(merge_path);
            if server_cache.is_complete_for_path(&server_cache_path) {
                changed_children = changed_children
                    .add_write(merge_path, server_cache.node().get(&server_cache_path));
            }
        });
        self.apply_server_merge(
            old_view_cache,
            ack_path,
            &changed_children,
            writes,
            complete_cache,
            filter_server_node,
            acc,
        )
    }

    fn revert_user_write(
        &self,
        old_view_cache: &ViewCache,
        path: &Path,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes.shadowing_write(path).is_some() {
            return old_view_cache.clone();
        }

        let source = WriteTreeCompleteChildSource {
            writes,
            view_cache: old_view_cache,
            complete_server_cache: complete_cache,
        };
        let old_event_cache = old_view_cache.event_cache().indexed().clone();
        let new_event_cache;

        let priority_write = path
            .front()
            .map(|front| front.as_str() == ".priority")
            .unwrap_or(false);
        if path.is_empty() || priority_write {
            let new_node = if old_view_cache.server_cache().is_fully_initialized() {
                writes.calc_complete_event_cache(old_view_cache.complete_server_snap())
            } else {
                Some(writes.calc_complete_event_children(Some(
                    old_view_cache.server_cache().node(),
                )))
            };
            let new_node = new_node.unwrap_or_else(Node::empty);
            let new_indexed = IndexedNode::new(new_node, self.filter.index().clone());
            new_event_cache =
                self.filter
                    .update_full_node(&old_event_cache, &new_indexed, Some(&mut *acc));
        } else {
            let child_key = path.front().expect("non-empty path");
            let mut new_child =
                writes.calc_complete_child(child_key, old_view_cache.server_cache());
            if new_child.is_none()
                && old_view_cache.server_cache().is_complete_for_child(child_key)
            {
                new_child = Some(old_event_cache.node().immediate_child(child_key));
            }
            let updated = match new_child {
                Some(new_child) => self.filter.update_child(
                    &old_event_cache,
                    child_key,
                    new_child,
                    &path.pop_front(),
                    &source,
                    Some(&mut *acc),
                ),
                None if old_view_cache.event_cache().node().has_child(child_key) => {
                    // No complete replacement; drop the stale child.
                    self.filter.update_child(
                        &old_event_cache,
                        child_key,
                        Node::empty(),
                        &path.pop_front(),
                        &source,
                        Some(&mut *acc),
                    )
                }
                None => old_event_cache.clone(),
            };
            // All child writes may have been reverted away from what was a
            // leaf; restore the leaf if the merged view says so.
            let updated = if updated.node().is_empty()
                && old_view_cache.server_cache().is_fully_initialized()
            {
                let complete =
                    writes.calc_complete_event_cache(old_view_cache.complete_server_snap());
                match complete {
                    Some(complete) if complete.is_leaf() => {
                        let new_indexed =
                            IndexedNode::new(complete, self.filter.index().clone());
                        self.filter.update_full_node(&updated, &new_indexed, Some(&mut *acc))
                    }
                    _ => updated,
                }
            } else {
                updated
            };
            new_event_cache = updated;
        }

        let complete = old_view_cache.server_cache().is_fully_initialized()
            || writes.shadowing_write(&Path::root()).is_some();
        old_view_cache.update_event_snap(
            new_event_cache,
            complete,
            self.filter.filters_nodes(),
        )
    }

    fn listen_complete(
        &self,
        old_view_cache: &ViewCache,
        path: &Path,
        writes: &WriteTreeRef<'_>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_server = old_view_cache.server_cache();
        let new_view_cache = old_view_cache.update_server_snap(
            old_server.indexed().clone(),
            old_server.is_fully_initialized() || path.is_empty(),
            old_server.is_filtered(),
        );
        self.generate_event_cache_after_server_event(
            &new_view_cache,
            path,
            writes,
            &NoCompleteSource,
            acc,
        )
    }

    fn generate_event_cache_after_server_event(
        &self,
        view_cache: &ViewCache,
        change_path: &Path,
        writes: &WriteTreeRef<'_>,
        source: &dyn CompleteChildSource,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_event_snap = view_cache.event_cache();
        if writes.shadowing_write(change_path).is_some() {
            // Everything the server told us is locally shadowed.
            return view_cache.clone();
        }

        let new_event_cache = match change_path.front() {
            None => {
                debug_assert!(
                    view_cache.server_cache().is_fully_initialized(),
                    "root change requires complete server data"
                );
                let complete_node = if view_cache.server_cache().is_filtered() {
                    let server_node = view_cache.server_cache().node();
                    let complete_children = if server_node.is_leaf() {
                        Node::empty()
                    } else {
                        server_node.clone()
                    };
                    writes.calc_complete_event_children(Some(&complete_children))
                } else {
                    writes
                        .calc_complete_event_cache(view_cache.complete_server_snap())
                        .unwrap_or_else(Node::empty)
                };
                let new_indexed = IndexedNode::new(complete_node, self.filter.index().clone());
                self.filter
                    .update_full_node(old_event_snap.indexed(), &new_indexed, Some(&mut *acc))
            }
            Some(front) if front.as_str() == ".priority" => {
                let updated = writes.calc_event_cache_after_server_overwrite(
                    change_path,
                    view_cache.server_cache().node(),
                );
                match updated {
                    Some(node) => {
                        let priority =
                            crate::core::node::Priority::from_json(&node.value())
                                .unwrap_or_default();
                        self.filter.update_priority(old_event_snap.indexed(), priority)
                    }
                    None => old_event_snap.indexed().clone(),
                }
            }
            Some(child_key) => {
                let child_change_path = change_path.pop_front();
                let new_event_child = if old_event_snap.is_complete_for_child(child_key) {
                    let event_child_update = writes.calc_event_cache_after_server_overwrite(
                        change_path,
                        view_cache.server_cache().node(),
                    );
                    match event_child_update {
                        Some(update) => Some(
                            old_event_snap
                                .node()
                                .immediate_child(child_key)
                                .update_child(&child_change_path, update),
                        ),
                        None => Some(old_event_snap.node().immediate_child(child_key)),
                    }
                } else {
                    writes.calc_complete_child(child_key, view_cache.server_cache())
                };
                match new_event_child {
                    Some(new_child) => self.filter.update_child(
                        old_event_snap.indexed(),
                        child_key,
                        new_child,
                        &child_change_path,
                        source,
                        Some(&mut *acc),
                    ),
                    None => old_event_snap.indexed().clone(),
                }
            }
        };

        view_cache.update_event_snap(
            new_event_cache,
            old_event_snap.is_fully_initialized() || change_path.is_empty(),
            self.filter.filters_nodes(),
        )
    }
}

/// Completeness source backed by the write tree plus the view's server cache.
struct WriteTreeCompleteChildSource<'a> {
    writes: &'a WriteTreeRef<'a>,
    view_cache: &'a ViewCache,
    complete_server_cache: Option<&'a Node>,
}

impl CompleteChildSource for WriteTreeCompleteChildSource<'_> {
    fn complete_child(&self, key: &ChildKey) -> Option<Node> {
        let event_cache = self.view_cache.event_cache();
        if event_cache.is_complete_for_child(key) {
            return Some(event_cache.node().immediate_child(key));
        }
        match self.complete_server_cache {
            Some(complete) => {
                let server_node = CacheNode::new(
                    IndexedNode::new(complete.clone(), Index::Priority),
                    true,
                    false,
                );
                self.writes.calc_complete_child(key, &server_node)
            }
            None => self
                .writes
                .calc_complete_child(key, self.view_cache.server_cache()),
        }
    }

    fn child_after(
        &self,
        index: &Index,
        key: &ChildKey,
        node: &Node,
        reverse: bool,
    ) -> Option<(ChildKey, Node)> {
        let complete_server = self
            .complete_server_cache
            .cloned()
            .or_else(|| self.view_cache.complete_server_snap().cloned());
        self.writes
            .calc_next_node_after_post(complete_server.as_ref(), key, node, reverse, index)
    }
}
