//! Structural finishing passes: pruning, the root sentinel, and transitive
//! reduction.

use caldera_diags::Diagnostics;
use caldera_graph::Graph;
use tracing::debug;

use crate::nodes::Node;
use crate::transform::Transformer;

/// Removes configuration vertices nothing depends on. Used by destroy plans,
/// where most of the configuration only exists to support the destroy
/// ordering and anything unused would just schedule pointless work.
pub struct PruneUnusedTransformer {
  /// Set for every operation except destroy plans, where the pass is a
  /// pipeline no-op.
  pub skip: bool,
}

impl Transformer for PruneUnusedTransformer {
  fn name(&self) -> &'static str {
    "PruneUnusedTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    if self.skip {
      return Ok(());
    }
    loop {
      let mut removed = 0usize;
      for id in graph.node_ids() {
        let prunable = matches!(
          graph.node(id),
          Some(Node::Variable(_) | Node::Output(_) | Node::ModuleCall(_) | Node::Provider(_))
        );
        if prunable && graph.dependents_of(id).is_empty() {
          if let Some(node) = graph.node(id) {
            debug!(node = %node, "pruning unused vertex");
          }
          graph.remove_node(id);
          removed += 1;
        }
      }
      if removed == 0 {
        return Ok(());
      }
    }
  }
}

/// Adds the synthetic root sentinel every graph funnels into.
pub struct RootTransformer;

impl Transformer for RootTransformer {
  fn name(&self) -> &'static str {
    "RootTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    graph.add_root(Node::Root);
    Ok(())
  }
}

/// Removes edges implied by longer paths. Purely cosmetic: reachability is
/// untouched, the graph is just easier to read in logs and debug output.
pub struct TransitiveReductionTransformer;

impl Transformer for TransitiveReductionTransformer {
  fn name(&self) -> &'static str {
    "TransitiveReductionTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    graph.transitive_reduction();
    Ok(())
  }
}
