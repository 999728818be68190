//! Dependency edges from references.

use std::collections::BTreeMap;

use caldera_addrs::ModulePath;
use caldera_diags::Diagnostics;
use caldera_graph::{Graph, NodeId};
use tracing::trace;

use crate::eval::Ref;
use crate::nodes::Node;
use crate::transform::Transformer;

/// Connects every vertex to the vertices providing the symbols it
/// references: variables, resources, module calls and module outputs, plus
/// explicit `depends_on` entries. State-recorded dependencies are handled
/// separately by the destroy-edge transformer.
pub struct ReferenceTransformer;

impl Transformer for ReferenceTransformer {
  fn name(&self) -> &'static str {
    "ReferenceTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    let mut providers: BTreeMap<(ModulePath, Ref), Vec<NodeId>> = BTreeMap::new();
    for (id, node) in graph.nodes() {
      for key in node.provides() {
        providers.entry(key).or_default().push(id);
      }
    }

    let mut edges: Vec<(NodeId, NodeId)> = Vec::new();
    for (id, node) in graph.nodes() {
      for key in node.references() {
        let Some(targets) = providers.get(&key) else {
          continue;
        };
        for target in targets {
          if *target != id {
            trace!(source = %node, "reference edge");
            edges.push((id, *target));
          }
        }
      }
    }

    for (source, target) in edges {
      graph.connect(source, target);
    }
    Ok(())
  }
}
