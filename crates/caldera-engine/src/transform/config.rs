//! Transformers that seed the graph from configuration and state.

use std::sync::Arc;

use caldera_addrs::{ConfigResource, Targetable};
use caldera_config::Config;
use caldera_diags::Diagnostics;
use caldera_graph::Graph;
use caldera_state::State;
use tracing::debug;

use crate::nodes::{
  ModuleCallNode, Node, OrphanInstanceNode, OutputNode, ProviderNode, ResourceNode, VariableNode,
};
use crate::transform::Transformer;

/// Adds one vertex per configuration element: variables, providers,
/// resources, outputs and module calls, across the whole module tree.
pub struct ConfigTransformer {
  pub config: Arc<Config>,
  /// Resource vertices expand into destroy-plan instances.
  pub destroy_plan: bool,
}

impl Transformer for ConfigTransformer {
  fn name(&self) -> &'static str {
    "ConfigTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    for path in self.config.all_module_paths() {
      let Some(module) = self.config.descendant(&path) else {
        continue;
      };
      for (name, config) in &module.variables {
        graph.add_node(Node::Variable(VariableNode {
          module: path.clone(),
          name: name.clone(),
          config: config.clone(),
        }));
      }
      let mut provider_blocks: std::collections::BTreeMap<String, Vec<_>> =
        std::collections::BTreeMap::new();
      for block in &module.providers {
        provider_blocks.entry(block.provider_type.clone()).or_default().push(block.clone());
      }
      for (provider_type, configs) in provider_blocks {
        graph.add_node(Node::Provider(ProviderNode {
          module: path.clone(),
          provider_type,
          configs,
        }));
      }
      for resource in &module.resources {
        graph.add_node(Node::Resource(ResourceNode {
          addr: ConfigResource { module: path.clone(), resource: resource.resource() },
          config: resource.clone(),
          schema: None,
          cbd: resource.lifecycle.create_before_destroy,
          destroy_plan: self.destroy_plan,
          targets: Vec::new(),
          excludes: Vec::new(),
        }));
      }
      for (name, config) in &module.outputs {
        graph.add_node(Node::Output(OutputNode {
          module: path.clone(),
          name: name.clone(),
          config: config.clone(),
        }));
      }
      for call in &module.module_calls {
        graph.add_node(Node::ModuleCall(ModuleCallNode {
          parent: path.clone(),
          name: call.name.clone(),
          count: call.count.clone(),
          for_each: call.for_each.clone(),
          variables: call.variables.clone(),
        }));
      }
    }
    Ok(())
  }
}

/// Adds vertices for state objects with no configuration: whole-resource
/// orphans and every deposed object.
pub struct OrphanTransformer {
  pub config: Arc<Config>,
  pub state: State,
}

impl OrphanTransformer {
  fn forget_covers(&self, addr: &caldera_addrs::AbsResourceInstance) -> bool {
    let target = Targetable::ResourceInstance(addr.clone());
    let Some(module) = self.config.descendant(&addr.module.module_path()) else {
      return false;
    };
    module.removed.iter().any(|block| {
      !block.destroy
        && Targetable::parse(&block.from).map(|t| t.contains(&target)).unwrap_or(false)
    })
  }

  fn claimed_by_move(&self, addr: &caldera_addrs::AbsResourceInstance) -> bool {
    self
      .config
      .descendant(&addr.module.module_path())
      .map(|module| {
        module.resources.iter().any(|r| {
          r.mode == addr.resource.mode
            && r.name == addr.resource.name
            && r.moved_from.as_deref() == Some(addr.resource.type_name.as_str())
        })
      })
      .unwrap_or(false)
  }
}

impl Transformer for OrphanTransformer {
  fn name(&self) -> &'static str {
    "OrphanTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    for (addr, instance) in self.state.all_resource_instances() {
      // Deposed objects always plan their destruction, whether or not the
      // resource still has configuration.
      for key in instance.deposed.keys() {
        graph.add_node(Node::OrphanInstance(OrphanInstanceNode {
          addr: addr.clone(),
          deposed: Some(key.clone()),
          forget: false,
        }));
      }

      if instance.current.is_none() {
        continue;
      }
      let has_config = self
        .config
        .descendant(&addr.module.module_path())
        .and_then(|m| m.resource(&addr.resource))
        .is_some();
      if has_config || self.claimed_by_move(&addr) {
        continue;
      }
      debug!(addr = %addr, "state object has no configuration; planning removal");
      let forget = self.forget_covers(&addr);
      graph.add_node(Node::OrphanInstance(OrphanInstanceNode { addr, deposed: None, forget }));
    }
    Ok(())
  }
}
