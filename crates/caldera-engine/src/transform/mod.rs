//! Graph transformers.
//!
//! Each transformer is one independent mutation pass over the graph; the
//! [`crate::GraphBuilder`] composes them in a fixed order per operation.
//! The graph must remain acyclic after every pass.

mod cbd;
mod config;
mod diff;
mod provider;
mod reduce;
mod reference;
mod schema;
mod target;

pub use cbd::{DestroyEdgeTransformer, ForcedCbdTransformer};
pub use config::{ConfigTransformer, OrphanTransformer};
pub use diff::DiffTransformer;
pub use provider::{CloseProviderTransformer, CloseProvisionerTransformer, ProviderTransformer};
pub use reduce::{PruneUnusedTransformer, RootTransformer, TransitiveReductionTransformer};
pub use reference::ReferenceTransformer;
pub use schema::AttachSchemaTransformer;
pub use target::TargetingTransformer;

use caldera_diags::Diagnostics;
use caldera_graph::Graph;

use crate::nodes::Node;

/// One graph mutation pass.
pub trait Transformer {
  fn name(&self) -> &'static str;

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics>;
}
