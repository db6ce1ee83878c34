//! Operations flowing through the sync tree.
//!
//! Every state change (a user write, a server update, an ack) is expressed
//! as an operation applied at a path. Operations descend the tree toward the
//! views they affect via `for_child`.

use crate::core::compound_write::CompoundWrite;
use crate::core::immutable_tree::ImmutableTree;
use crate::core::node::Node;
use crate::core::path::{ChildKey, Path};

/// Server-assigned identity of a non-default listen, echoed in tagged pushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationSource {
    User,
    Server,
    /// A server update scoped to one tagged (filtered) query.
    ServerTagged(Tag),
}

impl OperationSource {
    pub fn is_from_user(&self) -> bool {
        matches!(self, OperationSource::User)
    }

    pub fn is_from_server(&self) -> bool {
        !self.is_from_user()
    }

    pub fn tag(&self) -> Option<Tag> {
        match self {
            OperationSource::ServerTagged(tag) => Some(*tag),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Operation {
    Overwrite {
        source: OperationSource,
        path: Path,
        snap: Node,
    },
    Merge {
        source: OperationSource,
        path: Path,
        children: CompoundWrite,
    },
    /// Terminal outcome of a user write: confirm (or revert) the parts of the
    /// tree the write touched.
    AckUserWrite {
        path: Path,
        affected: ImmutableTree<bool>,
        revert: bool,
    },
    ListenComplete {
        source: OperationSource,
        path: Path,
    },
}

impl Operation {
    pub fn path(&self) -> &Path {
        match self {
            Operation::Overwrite { path, .. }
            | Operation::Merge { path, .. }
            | Operation::AckUserWrite { path, .. }
            | Operation::ListenComplete { path, .. } => path,
        }
    }

    pub fn source(&self) -> OperationSource {
        match self {
            Operation::Overwrite { source, .. }
            | Operation::Merge { source, .. }
            | Operation::ListenComplete { source, .. } => *source,
            Operation::AckUserWrite { .. } => OperationSource::User,
        }
    }

    /// The part of this operation that applies beneath `child_key`, if any.
    pub fn for_child(&self, child_key: &ChildKey) -> Option<Operation> {
        match self {
            Operation::Overwrite { source, path, snap } => match path.front() {
                None => Some(Operation::Overwrite {
                    source: *source,
                    path: Path::root(),
                    snap: snap.immediate_child(child_key),
                }),
                Some(front) if front == child_key => Some(Operation::Overwrite {
                    source: *source,
                    path: path.pop_front(),
                    snap: snap.clone(),
                }),
                Some(_) => None,
            },
            Operation::Merge {
                source,
                path,
                children,
            } => match path.front() {
                None => {
                    let child_path = Path::root().child(child_key.clone());
                    let child_write = children.child_compound_write(&child_path);
                    if child_write.is_empty() {
                        None
                    } else if let Some(complete) = child_write.get_complete_node(&Path::root()) {
                        // The merge pins this child entirely; descend as an
                        // overwrite.
                        Some(Operation::Overwrite {
                            source: *source,
                            path: Path::root(),
                            snap: complete,
                        })
                    } else {
                        Some(Operation::Merge {
                            source: *source,
                            path: Path::root(),
                            children: child_write,
                        })
                    }
                }
                Some(front) if front == child_key => Some(Operation::Merge {
                    source: *source,
                    path: path.pop_front(),
                    children: children.clone(),
                }),
                Some(_) => None,
            },
            Operation::AckUserWrite {
                path,
                affected,
                revert,
            } => match path.front() {
                None => {
                    if affected.value().is_some() {
                        debug_assert!(
                            affected.children().next().is_none(),
                            "affected tree with a root value must be a leaf"
                        );
                        Some(self.clone())
                    } else {
                        let child_tree =
                            affected.subtree(&Path::root().child(child_key.clone()));
                        if child_tree.is_empty() {
                            None
                        } else {
                            Some(Operation::AckUserWrite {
                                path: Path::root(),
                                affected: child_tree,
                                revert: *revert,
                            })
                        }
                    }
                }
                Some(front) if front == child_key => Some(Operation::AckUserWrite {
                    path: path.pop_front(),
                    affected: affected.clone(),
                    revert: *revert,
                }),
                Some(_) => None,
            },
            Operation::ListenComplete { source, path } => match path.front() {
                None => Some(Operation::ListenComplete {
                    source: *source,
                    path: Path::root(),
                }),
                Some(front) if front == child_key => Some(Operation::ListenComplete {
                    source: *source,
                    path: path.pop_front(),
                }),
                Some(_) => None,
            },
        }
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

    fn key(name: &str) -> ChildKey {
        ChildKey::new(name).unwrap()
    }

    #[test]
    fn overwrite_descends_into_snapshot() {
        let op = Operation::Overwrite {
            source: OperationSource::Server,
            path: Path::root(),
            snap: json_to_node(&json!({ "a": 1, "b": 2 })).unwrap(),
        };
        let Some(Operation::Overwrite { snap, path, .. }) = op.for_child(&key("a")) else {
            panic!("expected overwrite");
        };
        assert!(path.is_empty());
        assert_eq!(snap.value(), json!(1));
    }

    #[test]
    fn overwrite_descends_along_its_path() {
        let op = Operation::Overwrite {
            source: OperationSource::User,
            path: p("a/b"),
            snap: json_to_node(&json!(5)).unwrap(),
        };
        assert!(op.for_child(&key("other")).is_none());
        let Some(Operation::Overwrite { path, .. }) = op.for_child(&key("a")) else {
            panic!("expected overwrite");
        };
        assert_eq!(path, p("b"));
    }

    #[test]
    fn merge_collapses_to_overwrite_when_child_complete() {
        let children = CompoundWrite::empty()
            .add_write(&p("a"), json_to_node(&json!(1)).unwrap())
            .add_write(&p("b/deep"), json_to_node(&json!(2)).unwrap());
        let op = Operation::Merge {
            source: OperationSource::Server,
            path: Path::root(),
            children,
        };

        assert!(matches!(
            op.for_child(&key("a")),
            Some(Operation::Overwrite { .. })
        ));
        assert!(matches!(
            op.for_child(&key("b")),
            Some(Operation::Merge { .. })
        ));
        assert!(op.for_child(&key("c")).is_none());
    }

    #[test]
    fn ack_descends_through_affected_tree() {
        let affected = ImmutableTree::empty().set(&p("a/b"), true);
        let op = Operation::AckUserWrite {
            path: Path::root(),
            affected,
            revert: false,
        };
        let Some(Operation::AckUserWrite { affected, .. }) = op.for_child(&key("a")) else {
            panic!("expected ack");
        };
        assert_eq!(affected.get(&p("b")), Some(&true));
        assert!(op.for_child(&key("x")).is_none());
    }
}
