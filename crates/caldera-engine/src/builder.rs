//! Graph construction.

use std::sync::Arc;

use caldera_addrs::Targetable;
use caldera_config::Config;
use caldera_diags::{Diagnostic, Diagnostics};
use caldera_graph::Graph;
use caldera_plan::Plan;
use caldera_provider::SchemaCache;
use caldera_state::State;
use tracing::debug;

use crate::context::WalkOperation;
use crate::nodes::Node;
use crate::transform::{
  AttachSchemaTransformer, CloseProviderTransformer, CloseProvisionerTransformer,
  ConfigTransformer, DestroyEdgeTransformer, DiffTransformer, ForcedCbdTransformer,
  OrphanTransformer, ProviderTransformer, PruneUnusedTransformer, ReferenceTransformer,
  RootTransformer, TargetingTransformer, Transformer, TransitiveReductionTransformer,
};

/// Builds the execution graph for one operation by running the fixed
/// transformer pipeline for that operation. After every pass the graph must
/// still be acyclic; the finished graph must funnel into a single root
/// sentinel.
pub struct GraphBuilder {
  pub op: WalkOperation,
  pub config: Arc<Config>,
  pub state: State,
  pub schemas: Arc<SchemaCache>,
  /// The planned changes driving an apply graph.
  pub plan: Option<Plan>,
  pub targets: Vec<Targetable>,
  pub excludes: Vec<Targetable>,
}

impl GraphBuilder {
  pub fn build(self) -> Result<Graph<Node>, Diagnostics> {
    let mut transformers: Vec<Box<dyn Transformer>> = match self.op {
      WalkOperation::Plan | WalkOperation::Validate | WalkOperation::PlanDestroy => vec![
        Box::new(ConfigTransformer {
          config: self.config.clone(),
          destroy_plan: self.op == WalkOperation::PlanDestroy,
        }),
        Box::new(OrphanTransformer { config: self.config.clone(), state: self.state.clone() }),
        Box::new(AttachSchemaTransformer { schemas: self.schemas.clone() }),
        Box::new(ReferenceTransformer),
        Box::new(ProviderTransformer { config: self.config.clone() }),
        Box::new(PruneUnusedTransformer { skip: self.op != WalkOperation::PlanDestroy }),
        Box::new(TargetingTransformer {
          targets: self.targets.clone(),
          excludes: self.excludes.clone(),
        }),
        Box::new(ForcedCbdTransformer),
        Box::new(CloseProviderTransformer),
        Box::new(RootTransformer),
        Box::new(TransitiveReductionTransformer),
      ],
      WalkOperation::Apply => vec![
        Box::new(ConfigTransformer { config: self.config.clone(), destroy_plan: false }),
        Box::new(DiffTransformer {
          plan: self.plan.clone().unwrap_or_default(),
          state: self.state.clone(),
          config: self.config.clone(),
        }),
        Box::new(AttachSchemaTransformer { schemas: self.schemas.clone() }),
        Box::new(ReferenceTransformer),
        Box::new(ProviderTransformer { config: self.config.clone() }),
        Box::new(ForcedCbdTransformer),
        Box::new(DestroyEdgeTransformer { state: self.state.clone() }),
        Box::new(CloseProviderTransformer),
        Box::new(CloseProvisionerTransformer { config: self.config.clone() }),
        Box::new(RootTransformer),
        Box::new(TransitiveReductionTransformer),
      ],
    };

    let mut graph: Graph<Node> = Graph::new();
    for transformer in &mut transformers {
      debug!(transformer = transformer.name(), "running graph transformer");
      transformer.transform(&mut graph)?;
      let cycles = graph.find_cycles();
      if !cycles.is_empty() {
        let names: Vec<String> = cycles[0]
          .iter()
          .filter_map(|id| graph.node(*id))
          .map(|n| n.to_string())
          .collect();
        return Err(
          Diagnostic::bug(
            "Cycle in dependency graph",
            format!(
              "Transformer {} produced a cycle involving {}",
              transformer.name(),
              names.join(", ")
            ),
          )
          .into(),
        );
      }
    }

    graph.validate(Node::is_root).map_err(|e| {
      Diagnostics::from(Diagnostic::bug("Invalid dependency graph", e.to_string()))
    })?;
    Ok(graph)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_config_builds_a_root_only_graph() {
    let builder = GraphBuilder {
      op: WalkOperation::Plan,
      config: Arc::new(Config::default()),
      state: State::new(),
      schemas: Arc::new(SchemaCache::default()),
      plan: None,
      targets: Vec::new(),
      excludes: Vec::new(),
    };
    let graph = builder.build().unwrap();
    assert_eq!(graph.len(), 1);
    assert!(graph.nodes().all(|(_, n)| n.is_root()));
  }
}
