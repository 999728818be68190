//! Schema attachment.

use std::sync::Arc;

use caldera_diags::{Diagnostic, Diagnostics};
use caldera_graph::Graph;
use caldera_provider::SchemaCache;
use tracing::debug;

use crate::nodes::Node;
use crate::transform::Transformer;

/// Attaches resource type schemas to the vertices that declare a need for
/// one. The cache must be fully populated before this runs; the transformer
/// never triggers loading. Vertices without configuration (orphan and
/// destroy vertices working purely from state) have no schema need and are
/// skipped with a log line.
pub struct AttachSchemaTransformer {
  pub schemas: Arc<SchemaCache>,
}

impl Transformer for AttachSchemaTransformer {
  fn name(&self) -> &'static str {
    "AttachSchemaTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    let mut diags = Diagnostics::new();

    // Provisioner schemas are only verified to exist; provisioners validate
    // their own configuration at run time.
    let mut checked = std::collections::BTreeSet::new();
    for (_, node) in graph.nodes() {
      let Some(config) = super::provider::node_resource_config(node) else {
        continue;
      };
      for provisioner in &config.provisioners {
        if !checked.insert(provisioner.name.clone()) {
          continue;
        }
        if self.schemas.provisioner_schema(&provisioner.name).is_none() {
          diags.push(Diagnostic::error(
            "Failed to load provisioner schema",
            format!("No schema is available for provisioner {:?}.", provisioner.name),
          ));
        }
      }
    }

    for id in graph.node_ids() {
      let Some(node) = graph.node(id) else { continue };
      let (addr_desc, provider_type, mode, type_name) = match node {
        Node::Resource(n) => (
          n.addr.to_string(),
          provider_type_of(&n.config, &n.addr.resource),
          n.addr.resource.mode,
          n.addr.resource.type_name.clone(),
        ),
        Node::PlanInstance(n) => (
          n.addr.to_string(),
          provider_type_of(&n.config, &n.addr.resource),
          n.addr.resource.mode,
          n.addr.resource.type_name.clone(),
        ),
        Node::ApplyInstance(n) => match &n.config {
          Some(config) => (
            n.addr.to_string(),
            provider_type_of(config, &n.addr.resource),
            n.addr.resource.mode,
            n.addr.resource.type_name.clone(),
          ),
          None => {
            debug!(node = %node, "no configuration, skipping schema attach");
            continue;
          }
        },
        Node::OpenInstance(n) => match &n.config {
          Some(config) => (
            n.addr.to_string(),
            provider_type_of(config, &n.addr.resource),
            n.addr.resource.mode,
            n.addr.resource.type_name.clone(),
          ),
          None => {
            debug!(node = %node, "no configuration, skipping schema attach");
            continue;
          }
        },
        _ => continue,
      };

      match self.schemas.resource_type_schema(&provider_type, mode, &type_name) {
        Some(schema) => {
          let schema = schema.clone();
          if let Some(node) = graph.node_mut(id) {
            match node {
              Node::Resource(n) => n.schema = Some(schema),
              Node::PlanInstance(n) => n.schema = Some(schema),
              Node::ApplyInstance(n) => n.schema = Some(schema),
              Node::OpenInstance(n) => n.schema = Some(schema),
              _ => {}
            }
          }
        }
        None => {
          diags.push(
            Diagnostic::error(
              "Failed to load resource schema",
              format!(
                "The provider {:?} has no schema for resource type {:?}.",
                provider_type, type_name
              ),
            )
            .with_subject(addr_desc),
          );
        }
      }
    }

    if diags.has_errors() { Err(diags) } else { Ok(()) }
  }
}

fn provider_type_of(
  config: &caldera_config::ResourceConfig,
  resource: &caldera_addrs::Resource,
) -> String {
  config
    .provider
    .as_ref()
    .and_then(|p| p.provider_type.clone())
    .unwrap_or_else(|| resource.implied_provider().to_string())
}
