//! Directed acyclic graph used to order execution.
//!
//! Vertices are stored by [`NodeId`] in deterministic BTree order so walks,
//! transformer output and error messages are stable. An edge `(source,
//! target)` records that `target` must complete before `source`: the source
//! depends on the target. [`Graph::ancestors`] follows dependencies and
//! [`Graph::descendants`] follows dependents, matching the direction the
//! targeting rules use.

mod graph;

pub use graph::{Graph, GraphError, NodeId};
