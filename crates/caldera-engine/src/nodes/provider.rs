//! Provider vertices: dynamic expansion, instance configuration, close.

use std::collections::BTreeMap;

use caldera_addrs::{AbsProviderInstance, InstanceKey};
use caldera_diags::{Diagnostic, Diagnostics};
use caldera_graph::Graph;
use caldera_provider::Provider;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::EvalContext;
use crate::eval::{eval_alias, eval_config_value, eval_for_each, refs_in};
use crate::nodes::{
  CloseProviderNode, CloseProvisionerNode, Node, ProviderInstanceNode, ProviderNode,
};

/// Expand one provider block into its concrete instances.
///
/// Two levels of expansion compose here: the enclosing module may itself be
/// expanded, and the block may carry `alias` or `for_each`. Duplicate
/// resulting addresses are configuration errors reported with both
/// declaration sites.
pub fn expand_provider(node: &ProviderNode, ctx: &EvalContext) -> Result<Graph<Node>, Diagnostics> {
  let mut diags = Diagnostics::new();
  let mut graph: Graph<Node> = Graph::new();
  // Instance address -> the block description that first declared it.
  let mut seen: BTreeMap<String, String> = BTreeMap::new();

  for (index, block) in node.configs.iter().enumerate() {
    let block_desc = |mi: &caldera_addrs::ModuleInstance| {
      let where_ = if mi.is_root() { String::new() } else { format!(" in {}", mi) };
      format!("provider {:?} block {}{}", node.provider_type, index + 1, where_)
    };

    let mut record = |addr: AbsProviderInstance,
                      declared_at: String,
                      graph: &mut Graph<Node>,
                      diags: &mut Diagnostics| {
      debug!(addr = %addr, "found provider instance");
      if let Some(previous) = seen.get(&addr.to_string()) {
        diags.push(
          Diagnostic::error(
            "Duplicate provider instance",
            format!(
              "A provider instance with the address {} was already declared by {}. Generated provider instance addresses must be unique.",
              addr, previous
            ),
          )
          .with_subject(declared_at),
        );
        return;
      }
      seen.insert(addr.to_string(), declared_at);
      if ctx.schemas.provider_config_schema(&addr.provider_type).is_none() {
        diags.push(Diagnostic::error(
          "Missing provider schema",
          format!("No schema is available for {}.", addr),
        ));
        return;
      }
      graph.add_node(Node::ProviderInstance(ProviderInstanceNode {
        addr,
        config: block.clone(),
      }));
    };

    for mi in ctx.expander.expand_module(&node.module) {
      let scope = ctx.scope_for(&mi);
      let declared_at = block_desc(&mi);
      match (&block.alias, &block.for_each) {
        (None, None) => {
          record(
            AbsProviderInstance::default_for(mi.clone(), node.provider_type.as_str()),
            declared_at,
            &mut graph,
            &mut diags,
          );
        }
        (Some(alias_expr), None) => match eval_alias(alias_expr, &scope, &declared_at) {
          Ok(alias) => record(
            AbsProviderInstance {
              module: mi.clone(),
              provider_type: node.provider_type.clone(),
              alias: Some(alias),
              key: InstanceKey::NoKey,
            },
            declared_at,
            &mut graph,
            &mut diags,
          ),
          Err(more) => diags.extend(more),
        },
        (None, Some(for_each_expr)) => match eval_for_each(for_each_expr, &scope, &declared_at) {
          Ok(map) => {
            for key in map.into_keys() {
              record(
                AbsProviderInstance {
                  module: mi.clone(),
                  provider_type: node.provider_type.clone(),
                  alias: None,
                  key: InstanceKey::Str(key),
                },
                declared_at.clone(),
                &mut graph,
                &mut diags,
              );
            }
          }
          Err(more) => diags.extend(more),
        },
        (Some(_), Some(_)) => {
          // The config loader rejects this combination, so reaching it
          // here means an upstream check was skipped.
          diags.push(Diagnostic::bug(
            "Invalid provider block",
            format!(
              "The {} has both alias and for_each arguments, which should have been rejected during configuration loading",
              declared_at
            ),
          ));
        }
      }
    }
  }

  if diags.has_errors() {
    return Err(diags);
  }
  graph.add_root(Node::Root);
  Ok(graph)
}

/// Instantiate, cache and configure one provider instance. A second
/// initialization of the same address is an error.
pub async fn execute_instance(node: &ProviderInstanceNode, ctx: &EvalContext) -> Diagnostics {
  let mut diags = Diagnostics::new();

  let provider = match ctx.init_provider(&node.addr) {
    Ok(provider) => provider,
    Err(diag) => {
      diags.push(diag);
      return diags;
    }
  };

  let sources: Vec<String> = node
    .config
    .config
    .values()
    .filter_map(Value::as_str)
    .map(str::to_string)
    .collect();
  let refs: Vec<_> = sources.iter().flat_map(|s| refs_in(s)).collect();
  let scope = ctx.scope_with_refs(&node.addr.module, &refs, None);
  let config_value = Value::Object(node.config.config.clone().into_iter().collect());
  let rendered = match eval_config_value(&config_value, &scope) {
    Ok(value) => value,
    Err(e) => {
      diags.push(
        Diagnostic::error("Invalid provider configuration", e.to_string())
          .with_subject(node.addr.to_string()),
      );
      return diags;
    }
  };

  let Some(_permit) = ctx.acquire().await else {
    return EvalContext::cancelled_diag();
  };
  info!(addr = %node.addr, "configuring provider");
  if let Err(e) = provider.configure(rendered).await {
    diags.push(
      Diagnostic::error("Provider configuration failed", e.to_string())
        .with_subject(node.addr.to_string()),
    );
  }

  diags
}

/// Close the cached instance of one provisioner type, if it was ever used.
pub async fn execute_close_provisioner(
  node: &CloseProvisionerNode,
  ctx: &EvalContext,
) -> Diagnostics {
  let mut diags = Diagnostics::new();
  if let Some(provisioner) = ctx.take_provisioner(&node.name) {
    let Some(_permit) = ctx.acquire().await else {
      return EvalContext::cancelled_diag();
    };
    debug!(name = %node.name, "closing provisioner");
    if let Err(e) = provisioner.close().await {
      diags.push(
        Diagnostic::error("Provisioner close failed", e.to_string())
          .with_subject(format!("provisioner.{}", node.name)),
      );
    }
  }
  diags
}

/// Close every cached instance of one provider configuration. Close
/// vertices run only after all possible users completed, enforced by the
/// edges the provider transformer adds.
pub async fn execute_close(node: &CloseProviderNode, ctx: &EvalContext) -> Diagnostics {
  let mut diags = Diagnostics::new();
  for provider in ctx.take_providers_for(&node.addr) {
    let Some(_permit) = ctx.acquire().await else {
      return EvalContext::cancelled_diag();
    };
    debug!(addr = %node.addr, "closing provider");
    if let Err(e) = provider.close().await {
      diags.push(
        Diagnostic::error("Provider close failed", e.to_string())
          .with_subject(node.addr.to_string()),
      );
    }
  }
  diags
}
