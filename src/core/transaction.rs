//! Transaction bookkeeping shared with the repo's runner.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::core::node::Node;
use crate::core::path::{ChildKey, Path};
use crate::error::DatabaseError;

/// Upper bound on automatic reruns after `datastale` before a transaction
/// fails with `max-retries`.
pub const MAX_TRANSACTION_RETRIES: u32 = 25;

/// What an updater asks the engine to do with the current value.
pub enum TransactionUpdate {
    /// Stage this value and try to commit it.
    Set(Value),
    /// Leave the data alone and complete with `committed = false`.
    Abort,
}

pub type TransactionUpdater =
    Box<dyn FnMut(Value) -> TransactionUpdate + Send + 'static>;

/// Terminal outcome handed to the completion callback, exactly once.
#[derive(Clone, Debug)]
pub struct TransactionResult {
    pub committed: bool,
    /// The node at the transaction path after the terminal outcome.
    pub snapshot: Value,
}

pub type TransactionCompletion =
    Box<dyn FnOnce(Result<TransactionResult, DatabaseError>) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Staged locally, not yet on the wire; may re-run freely.
    Run,
    /// Sent and awaiting the server's verdict.
    Sent,
    /// Sent, but something invalidated it; abort once the response lands.
    SentNeedsAbort,
    /// Marked for abort before ever being sent.
    NeedsAbort,
    /// Terminal; awaiting removal from the queue.
    Completed,
}

pub struct TransactionData {
    pub path: Path,
    pub update: TransactionUpdater,
    pub on_complete: Option<TransactionCompletion>,
    pub status: TransactionStatus,
    /// Global submission order; serializes transactions at the same path.
    pub order: u64,
    pub apply_locally: bool,
    pub retry_count: u32,
    pub abort_reason: Option<DatabaseError>,
    pub current_write_id: u64,
    pub current_input_snapshot: Node,
    /// Staged output with placeholders intact (what goes on the wire).
    pub current_output_snapshot_raw: Node,
    /// Staged output with placeholders resolved (what views see).
    pub current_output_snapshot_resolved: Node,
}

impl fmt::Debug for TransactionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionData")
            .field("path", &self.path)
            .field("status", &self.status)
            .field("order", &self.order)
            .field("retry_count", &self.retry_count)
            .field("write_id", &self.current_write_id)
            .finish()
    }
}

/// Transactions queued per path; lookups walk ancestors and descendants to
/// find everything that serializes with a location.
#[derive(Default)]
pub struct TransactionTree {
    queue: Vec<TransactionData>,
    children: BTreeMap<ChildKey, TransactionTree>,
}

impl TransactionTree {
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.children.is_empty()
    }

    pub fn node_for_path(&mut self, path: &Path) -> &mut TransactionTree {
        let mut current = self;
        for key in path.segments() {
            current = current.children.entry(key.clone()).or_default();
        }
        current
    }

    pub fn push(&mut self, path: &Path, transaction: TransactionData) {
        self.node_for_path(path).queue.push(transaction);
    }

    /// The shallowest path with transactions on the way to `path`; `path`
    /// itself when none is found higher up.
    pub fn ancestor_transaction_path(&self, path: &Path) -> Path {
        let mut current = self;
        let mut walked: Vec<ChildKey> = Vec::new();
        for key in path.segments() {
            if !current.queue.is_empty() {
                return Path::from_segments(walked);
            }
            match current.children.get(key) {
                Some(child) => {
                    walked.push(key.clone());
                    current = child;
                }
                None => break,
            }
        }
        path.clone()
    }

    /// All transactions in the subtree at `path`, ordered by submission.
    pub fn build_queue(&mut self, path: &Path) -> Vec<&mut TransactionData> {
        let node = self.node_for_path(path);
        let mut list: Vec<&mut TransactionData> = Vec::new();
        Self::collect(node, &mut list);
        list.sort_by_key(|transaction| transaction.order);
        list
    }

    fn collect<'a>(node: &'a mut TransactionTree, out: &mut Vec<&'a mut TransactionData>) {
        out.extend(node.queue.iter_mut());
        for child in node.children.values_mut() {
            Self::collect(child, out);
        }
    }

    /// The shallowest paths holding transactions; each is the root of one
    /// send unit (everything below it goes in a single put).
    pub fn queue_roots(&self) -> Vec<Path> {
        let mut out = Vec::new();
        Self::collect_roots(self, &Path::root(), &mut out);
        out
    }

    fn collect_roots(node: &TransactionTree, prefix: &Path, out: &mut Vec<Path>) {
        if !node.queue.is_empty() {
            out.push(prefix.clone());
            return;
        }
        for (key, child) in &node.children {
            Self::collect_roots(child, &prefix.child(key.clone()), out);
        }
    }

    /// Removes every transaction matching the predicate, pruning empty
    /// branches, and returns them.
    pub fn drain_matching<F>(&mut self, predicate: &F) -> Vec<TransactionData>
    where
        F: Fn(&TransactionData) -> bool,
    {
        let mut drained = Vec::new();
        let queue = std::mem::take(&mut self.queue);
        for transaction in queue {
            if predicate(&transaction) {
                drained.push(transaction);
            } else {
                self.queue.push(transaction);
            }
        }
        let mut dead_children = Vec::new();
        for (key, child) in self.children.iter_mut() {
            drained.extend(child.drain_matching(predicate));
            if child.is_empty() {
                dead_children.push(key.clone());
            }
        }
        for key in dead_children {
            self.children.remove(&key);
        }
        drained
    }

    /// Visits every queue node under `path` (inclusive) plus all ancestors.
    pub fn for_each_related<F>(&mut self, path: &Path, f: &mut F)
    where
        F: FnMut(&Path, &mut Vec<TransactionData>),
    {
        let mut current = &mut *self;
        let mut walked: Vec<ChildKey> = Vec::new();
        for key in path.segments() {
            f(&Path::from_segments(walked.clone()), &mut current.queue);
            match current.children.contains_key(key) {
                true => {
                    walked.push(key.clone());
                    current = current.children.get_mut(key).expect("checked");
                }
                false => return,
            }
        }
        Self::for_each_below(current, &Path::from_segments(walked), f);
    }

    fn for_each_below<F>(node: &mut TransactionTree, prefix: &Path, f: &mut F)
    where
        F: FnMut(&Path, &mut Vec<TransactionData>),
    {
        f(prefix, &mut node.queue);
        for (key, child) in node.children.iter_mut() {
            Self::for_each_below(child, &prefix.child(key.clone()), f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(order: u64, path: &Path) -> TransactionData {
        TransactionData {
            path: path.clone(),
            update: Box::new(|_| TransactionUpdate::Abort),
            on_complete: None,
            status: TransactionStatus::Run,
            order,
            apply_locally: true,
            retry_count: 0,
            abort_reason: None,
            current_write_id: order,
            current_input_snapshot: Node::empty(),
            current_output_snapshot_raw: Node::empty(),
            current_output_snapshot_resolved: Node::empty(),
        }
    }

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    #[test]
    fn queue_builds_in_submission_order_across_subtree() {
        let mut tree = TransactionTree::default();
        tree.push(&p("a/b"), data(2, &p("a/b")));
        tree.push(&p("a"), data(1, &p("a")));
        tree.push(&p("a/c"), data(3, &p("a/c")));

        let orders: Vec<u64> = tree
            .build_queue(&p("a"))
            .iter()
            .map(|transaction| transaction.order)
            .collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn ancestor_path_finds_shallowest_queue() {
        let mut tree = TransactionTree::default();
        tree.push(&p("a"), data(1, &p("a")));
        assert_eq!(tree.ancestor_transaction_path(&p("a/b/c")), p("a"));
        assert_eq!(tree.ancestor_transaction_path(&p("x/y")), p("x/y"));
    }

    #[test]
    fn drain_prunes_empty_branches() {
        let mut tree = TransactionTree::default();
        tree.push(&p("a/b"), data(1, &p("a/b")));
        let drained = tree.drain_matching(&|_| true);
        assert_eq!(drained.len(), 1);
        assert!(tree.is_empty());
    }
}
