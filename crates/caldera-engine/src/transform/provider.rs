//! Provider wiring: resource-to-provider edges, default provider blocks,
//! and close vertices.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use caldera_addrs::{AbsProviderConfig, ModulePath};
use caldera_config::{Config, ProviderBlock, ResourceConfig};
use caldera_diags::Diagnostics;
use caldera_graph::{Graph, NodeId};
use tracing::debug;

use crate::nodes::{CloseProviderNode, CloseProvisionerNode, Node, ProviderNode};
use crate::transform::Transformer;

/// The static module whose provider block serves a resource: the resource's
/// own module or the nearest ancestor declaring the provider type, falling
/// back to the root module.
fn declaring_module(config: &Config, mut path: ModulePath, provider_type: &str) -> ModulePath {
  loop {
    if let Some(module) = config.descendant(&path) {
      if module.providers.iter().any(|b| b.provider_type == provider_type) {
        return path;
      }
    }
    match path.parent() {
      Some(parent) => path = parent,
      None => return ModulePath::root(),
    }
  }
}

fn provider_type_for(config: Option<&ResourceConfig>, node: &Node) -> Option<String> {
  if let Some(config) = config {
    if let Some(provider_ref) = &config.provider {
      if let Some(ptype) = &provider_ref.provider_type {
        return Some(ptype.clone());
      }
    }
  }
  node
    .target_addr()
    .map(|t| match t {
      caldera_addrs::Targetable::Resource(r) => r.resource.implied_provider().to_string(),
      caldera_addrs::Targetable::ResourceInstance(r) => {
        r.resource.implied_provider().to_string()
      }
      caldera_addrs::Targetable::Module(_) => String::new(),
    })
    .filter(|s| !s.is_empty())
}

pub(crate) fn node_resource_config(node: &Node) -> Option<&ResourceConfig> {
  match node {
    Node::Resource(n) => Some(&n.config),
    Node::PlanInstance(n) => Some(&n.config),
    Node::ApplyInstance(n) => n.config.as_ref(),
    Node::OpenInstance(n) => n.config.as_ref(),
    _ => None,
  }
}

/// Connects every resource-kind vertex to the provider vertex serving it,
/// adding default (empty) provider blocks at the root for provider types no
/// block declares.
pub struct ProviderTransformer {
  pub config: Arc<Config>,
}

impl Transformer for ProviderTransformer {
  fn name(&self) -> &'static str {
    "ProviderTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    // Index existing provider vertices by (module, type).
    let mut provider_nodes: BTreeMap<(ModulePath, String), NodeId> = BTreeMap::new();
    for (id, node) in graph.nodes() {
      if let Node::Provider(p) = node {
        provider_nodes.insert((p.module.clone(), p.provider_type.clone()), id);
      }
    }

    // Resolve the serving provider for every consumer.
    let mut wanted: Vec<(NodeId, ModulePath, String)> = Vec::new();
    for (id, node) in graph.nodes() {
      let config = node_resource_config(node);
      let Some(ptype) = provider_type_for(config, node) else {
        continue;
      };
      let Some(module) = node.module_path() else {
        continue;
      };
      let declaring = declaring_module(&self.config, module, &ptype);
      wanted.push((id, declaring, ptype));
    }

    for (consumer, declaring, ptype) in wanted {
      let key = (declaring.clone(), ptype.clone());
      let provider_id = match provider_nodes.get(&key) {
        Some(id) => *id,
        None => {
          debug!(provider = %ptype, "adding default provider block at root");
          let id = graph.add_node(Node::Provider(ProviderNode {
            module: ModulePath::root(),
            provider_type: ptype.clone(),
            configs: vec![ProviderBlock { provider_type: ptype.clone(), ..Default::default() }],
          }));
          provider_nodes.insert((ModulePath::root(), ptype.clone()), id);
          if declaring != ModulePath::root() {
            provider_nodes.insert(key, id);
          }
          id
        }
      };
      graph.connect(consumer, provider_id);
    }
    Ok(())
  }
}

/// Adds one close vertex per provider vertex, depending on the provider and
/// on every consumer, so providers shut down only after their last possible
/// user finished.
pub struct CloseProviderTransformer;

impl Transformer for CloseProviderTransformer {
  fn name(&self) -> &'static str {
    "CloseProviderTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    let mut seen: BTreeSet<(ModulePath, String)> = BTreeSet::new();
    let provider_ids: Vec<(NodeId, ModulePath, String)> = graph
      .nodes()
      .filter_map(|(id, node)| match node {
        Node::Provider(p) => Some((id, p.module.clone(), p.provider_type.clone())),
        _ => None,
      })
      .collect();

    for (provider_id, module, ptype) in provider_ids {
      if !seen.insert((module.clone(), ptype.clone())) {
        continue;
      }
      let consumers = graph.dependents_of(provider_id);
      let close_id = graph.add_node(Node::CloseProvider(CloseProviderNode {
        addr: AbsProviderConfig { module, provider_type: ptype, alias: None },
      }));
      graph.connect(close_id, provider_id);
      for consumer in consumers {
        graph.connect(close_id, consumer);
      }
    }
    Ok(())
  }
}

/// Adds one close vertex per provisioner type any resource uses, depending
/// on every vertex that might run it, including destroy vertices whose
/// resource still configures destroy-time provisioners.
pub struct CloseProvisionerTransformer {
  pub config: Arc<Config>,
}

impl Transformer for CloseProvisionerTransformer {
  fn name(&self) -> &'static str {
    "CloseProvisionerTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    let mut users: BTreeMap<String, Vec<caldera_graph::NodeId>> = BTreeMap::new();
    for (id, node) in graph.nodes() {
      let destroyer_config = node.destroyer_addr().and_then(|(addr, _)| {
        self
          .config
          .descendant(&addr.module.module_path())
          .and_then(|m| m.resource(&addr.resource))
      });
      let Some(config) = node_resource_config(node).or(destroyer_config) else {
        continue;
      };
      for provisioner in &config.provisioners {
        users.entry(provisioner.name.clone()).or_default().push(id);
      }
    }

    for (name, user_ids) in users {
      let close_id =
        graph.add_node(Node::CloseProvisioner(CloseProvisionerNode { name }));
      for user in user_ids {
        graph.connect(close_id, user);
      }
    }
    Ok(())
  }
}
