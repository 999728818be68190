//! Diff-driven vertex creation for the apply graph.

use std::collections::BTreeMap;
use std::sync::Arc;

use caldera_addrs::DeposedKey;
use caldera_config::Config;
use caldera_diags::{Diagnostic, Diagnostics};
use caldera_graph::{Graph, NodeId};
use caldera_plan::{Action, Plan};
use caldera_state::State;
use tracing::debug;

use crate::nodes::{
  ApplyInstanceNode, DestroyInstanceNode, ForgetInstanceNode, Node, OpenInstanceNode,
};
use crate::transform::Transformer;

/// Adds one concrete vertex per planned change: an apply vertex for
/// create/update, a destroy vertex for delete, a forget vertex, or an open
/// vertex for ephemeral resources. A replace produces both an apply and a
/// destroy vertex; under create-before-destroy the deposed key is
/// pre-allocated here and threaded to both, so the destroy vertex destroys
/// exactly the object the apply vertex deposes.
pub struct DiffTransformer {
  pub plan: Plan,
  pub state: State,
  pub config: Arc<Config>,
}

impl Transformer for DiffTransformer {
  fn name(&self) -> &'static str {
    "DiffTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    if self.plan.changes.is_empty() {
      return Ok(());
    }
    let mut diags = Diagnostics::new();

    // Whole-resource vertices already in the graph, so per-instance
    // execution never races ahead of resource-level setup.
    let mut resource_nodes: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
    for (id, node) in graph.nodes() {
      if let Node::Resource(n) = node {
        resource_nodes.entry(n.addr.to_string()).or_default().push(id);
      }
    }

    for change in &self.plan.changes {
      let addr = &change.addr;
      let deposed = change.deposed.clone();
      debug!(addr = %addr, deposed = ?deposed, action = %change.action, "found change");

      let (mut update, mut delete, mut forget, mut open) = (false, false, false, false);
      let mut create_before_destroy = false;
      match change.action {
        Action::NoOp => {}
        Action::Delete => delete = true,
        Action::Forget => forget = true,
        Action::DeleteThenCreate | Action::CreateThenDelete => {
          update = true;
          delete = true;
          create_before_destroy = change.action == Action::CreateThenDelete;
        }
        Action::Open => open = true,
        Action::Create | Action::Update => update = true,
      }

      // A deposed object may only be destroyed, forgotten, or left alone.
      if deposed.is_some()
        && !matches!(change.action, Action::Delete | Action::NoOp | Action::Forget)
      {
        diags.push(Diagnostic::bug(
          "Invalid planned change for deposed object",
          format!(
            "The plan contains a non-removal change for {} deposed object {}. The only valid actions for a deposed object are to destroy it or forget it",
            addr,
            deposed.as_ref().map(|k| k.to_string()).unwrap_or_default()
          ),
        ));
        continue;
      }

      // Pre-allocate the deposed key a create-before-destroy replace will
      // use, so both paired vertices agree on it.
      let mut replace_key: Option<DeposedKey> = None;
      if update && delete && create_before_destroy {
        if self.state.modules.is_empty() {
          replace_key = Some(DeposedKey::new_random());
        } else {
          match self.state.resource_instance(addr) {
            Some(instance) => replace_key = Some(instance.find_unused_deposed_key()),
            None => {
              diags.push(Diagnostic::bug(
                "Invalid planned change",
                format!(
                  "The plan contains a replace change for {}, which doesn't exist yet",
                  addr
                ),
              ));
              continue;
            }
          }
        }
      }

      let resource_config = self
        .config
        .descendant(&addr.module.module_path())
        .and_then(|m| m.resource(&addr.resource))
        .cloned();

      if open {
        let id = graph.add_node(Node::OpenInstance(OpenInstanceNode {
          addr: addr.clone(),
          config: resource_config.clone(),
          schema: None,
        }));
        for resource_id in containing_resource_nodes(&resource_nodes, addr) {
          graph.connect(id, resource_id);
        }
      }

      if update {
        let id = graph.add_node(Node::ApplyInstance(ApplyInstanceNode {
          addr: addr.clone(),
          config: resource_config.clone(),
          schema: None,
          cbd: create_before_destroy,
          preallocated_deposed: replace_key.clone(),
        }));
        if let Some(key) = &replace_key {
          debug!(addr = %addr, key = %key, "apply vertex will depose prior object");
        }
        for resource_id in containing_resource_nodes(&resource_nodes, addr) {
          graph.connect(id, resource_id);
        }
      }

      if delete {
        let destroy_key = if update { replace_key.clone() } else { deposed.clone() };
        graph.add_node(Node::DestroyInstance(DestroyInstanceNode {
          addr: addr.clone(),
          deposed: destroy_key,
          cbd: create_before_destroy,
        }));
      }

      if forget {
        graph.add_node(Node::ForgetInstance(ForgetInstanceNode {
          addr: addr.clone(),
          deposed: deposed.clone(),
        }));
      }
    }

    if diags.has_errors() { Err(diags) } else { Ok(()) }
  }
}

fn containing_resource_nodes(
  resource_nodes: &BTreeMap<String, Vec<NodeId>>,
  addr: &caldera_addrs::AbsResourceInstance,
) -> Vec<NodeId> {
  resource_nodes.get(&addr.config_resource().to_string()).cloned().unwrap_or_default()
}
