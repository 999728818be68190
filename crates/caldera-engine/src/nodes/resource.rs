//! Resource vertices: dynamic expansion and the plan-time lifecycle state
//! machine for one resource instance.

use caldera_addrs::{
  AbsProviderInstance, AbsResource, AbsResourceInstance, InstanceKey, ModuleInstance, ModulePath,
  Resource, ResourceMode, Targetable,
};
use caldera_config::ResourceConfig;
use caldera_diags::{Diagnostic, Diagnostics};
use caldera_graph::Graph;
use caldera_plan::{Action, ResourceInstanceChange};
use caldera_provider::{Provider, Schema};
use caldera_state::ResourceInstanceObject;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::{EvalContext, WalkOperation};
use crate::eval::{Scope, eval_config_value, eval_count, eval_for_each, eval_source};
use crate::nodes::{Node, OrphanInstanceNode, PlanInstanceNode, ResourceNode};

/// Expand a resource block into per-instance vertices.
///
/// For every instance of the enclosing module the block's `count`/`for_each`
/// is evaluated and the concrete instance addresses are registered with the
/// expander; instances present in state but no longer desired become orphan
/// vertices. Targeting filters decide which instances get plan vertices, but
/// expansion is always recorded so references resolve.
pub fn expand_resource(node: &ResourceNode, ctx: &EvalContext) -> Result<Graph<Node>, Diagnostics> {
  let mut diags = Diagnostics::new();
  let mut graph: Graph<Node> = Graph::new();
  let subject = node.addr.to_string();

  for mi in ctx.expander.expand_module(&node.addr.module) {
    let abs = AbsResource { module: mi.clone(), resource: node.addr.resource.clone() };
    let scope = ctx.scope_for(&mi);

    let keyed: Vec<(InstanceKey, Option<Value>)> = if let Some(count) = &node.config.count {
      match eval_count(count, &scope, &subject) {
        Ok(n) => (0..n as i64).map(|i| (InstanceKey::Int(i), None)).collect(),
        Err(more) => {
          diags.extend(more);
          continue;
        }
      }
    } else if let Some(for_each) = &node.config.for_each {
      match eval_for_each(for_each, &scope, &subject) {
        Ok(map) => map.into_iter().map(|(k, v)| (InstanceKey::Str(k), Some(v))).collect(),
        Err(more) => {
          diags.extend(more);
          continue;
        }
      }
    } else {
      vec![(InstanceKey::NoKey, None)]
    };

    let keys: Vec<InstanceKey> = keyed.iter().map(|(k, _)| k.clone()).collect();
    debug!(addr = %abs, instances = keys.len(), "expanded resource");
    ctx.expander.set_resource_keys(abs.clone(), keys.clone());

    let mut seen: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for (key, each_value) in keyed {
      let addr = abs.instance(key);
      if !seen.insert(addr.to_string()) {
        diags.push(
          Diagnostic::error(
            "Duplicate resource instance",
            format!(
              "Two instances of {} expanded to the same address {}. Generated instance addresses must be unique.",
              node.addr, addr
            ),
          )
          .with_subject(subject.clone()),
        );
        continue;
      }
      if ctx.op == WalkOperation::Apply {
        // Apply graphs get their instance vertices from the diff
        // transformer; expansion only records the instance set.
        continue;
      }
      let target = Targetable::ResourceInstance(addr.clone());
      if !node.targets.is_empty() && !node.targets.iter().any(|t| t.contains(&target)) {
        continue;
      }
      if node.excludes.iter().any(|t| t.contains(&target)) {
        continue;
      }

      let moved_from = moved_from_addr(ctx, node, &addr);
      graph.add_node(Node::PlanInstance(PlanInstanceNode {
        import_id: ctx.inputs.import_targets.get(&addr.to_string()).cloned(),
        force_replace: ctx.inputs.force_replace.iter().any(|t| t.contains(&target)),
        addr,
        config: node.config.clone(),
        schema: node.schema.clone(),
        cbd: node.cbd,
        destroy_plan: node.destroy_plan,
        each_value,
        moved_from,
      }));
    }

    // Instances recorded in state that are no longer desired.
    if ctx.op != WalkOperation::Apply {
      for state_key in ctx.state.resource_instance_keys(&abs) {
        if keys.contains(&state_key) {
          continue;
        }
        let addr = abs.instance(state_key);
        let target = Targetable::ResourceInstance(addr.clone());
        if !node.targets.is_empty() && !node.targets.iter().any(|t| t.contains(&target)) {
          continue;
        }
        if node.excludes.iter().any(|t| t.contains(&target)) {
          continue;
        }
        let forget = removed_covers(ctx, &addr);
        graph.add_node(Node::OrphanInstance(OrphanInstanceNode { addr, deposed: None, forget }));
      }
    }
  }

  if diags.has_errors() {
    return Err(diags);
  }
  graph.add_root(Node::Root);
  Ok(graph)
}

fn moved_from_addr(
  ctx: &EvalContext,
  node: &ResourceNode,
  addr: &AbsResourceInstance,
) -> Option<AbsResourceInstance> {
  let old_type = node.config.moved_from.as_ref()?;
  if ctx.state.resource_instance_object(addr, None).is_some() {
    return None;
  }
  let old_addr = AbsResourceInstance {
    module: addr.module.clone(),
    resource: Resource {
      mode: addr.resource.mode,
      type_name: old_type.clone(),
      name: addr.resource.name.clone(),
    },
    key: addr.key.clone(),
  };
  ctx.state.resource_instance_object(&old_addr, None).is_some().then_some(old_addr)
}

/// Whether a removed block in the instance's module asks for a forget
/// instead of a destroy.
pub(crate) fn removed_covers(ctx: &EvalContext, addr: &AbsResourceInstance) -> bool {
  let target = Targetable::ResourceInstance(addr.clone());
  let Some(config) = ctx.config.descendant(&addr.module.module_path()) else {
    return false;
  };
  config.removed.iter().any(|block| {
    !block.destroy
      && Targetable::parse(&block.from).map(|t| t.contains(&target)).unwrap_or(false)
  })
}

/// Resolve the provider instance a resource instance is bound to: explicit
/// configuration, the nearest enclosing module with a matching provider
/// block, or the provider recorded in state for configuration-less orphans.
pub(crate) fn resolve_provider_addr(
  ctx: &EvalContext,
  addr: &AbsResourceInstance,
  config: Option<&ResourceConfig>,
  scope: Option<&Scope>,
) -> Result<AbsProviderInstance, Diagnostic> {
  let Some(config) = config else {
    return Ok(ctx.state.resource_provider(addr).unwrap_or_else(|| {
      AbsProviderInstance::default_for(
        ModuleInstance::root(),
        addr.resource.implied_provider(),
      )
    }));
  };

  let provider_ref = config.provider.clone().unwrap_or_default();
  let provider_type = provider_ref
    .provider_type
    .unwrap_or_else(|| addr.resource.implied_provider().to_string());

  // Walk from the resource's module outward to find the declaring module.
  let mut declaring = ModulePath::root();
  let mut path = addr.module.module_path();
  loop {
    if let Some(module_config) = ctx.config.descendant(&path) {
      let matches = module_config.providers.iter().any(|block| {
        block.provider_type == provider_type
          && match (&provider_ref.alias, &block.alias, &block.for_each) {
            (Some(_), Some(_), _) => provider_ref.alias == block.alias,
            (Some(_), None, _) => false,
            (None, None, Some(_)) => true,
            (None, None, None) => true,
            (None, Some(_), _) => false,
          }
      });
      if matches {
        declaring = path;
        break;
      }
    }
    match path.parent() {
      Some(parent) => path = parent,
      None => break,
    }
  }

  // Truncate the concrete module instance to the declaring module's depth.
  let mut module = ModuleInstance::root();
  for step in addr.module.steps().iter().take(declaring.steps().len()) {
    module = module.child(step.name.clone(), step.key.clone());
  }

  let key = match &provider_ref.key {
    None => InstanceKey::NoKey,
    Some(expr) => {
      let empty = Scope::default();
      let scope = scope.unwrap_or(&empty);
      match eval_source(expr, scope) {
        Ok(Value::String(s)) => InstanceKey::Str(s),
        Ok(other) => {
          return Err(
            Diagnostic::error(
              "Invalid provider instance key",
              format!("The provider key expression must yield a string, not {}.", other),
            )
            .with_subject(addr.to_string()),
          );
        }
        Err(e) => {
          return Err(
            Diagnostic::error("Invalid provider instance key", e.to_string())
              .with_subject(addr.to_string()),
          );
        }
      }
    }
  };

  Ok(AbsProviderInstance { module, provider_type, alias: provider_ref.alias, key })
}

/// Plan one resource instance: refresh and upgrade its prior object, render
/// the desired configuration, and decide the lifecycle action.
pub async fn plan_instance(node: &PlanInstanceNode, ctx: &EvalContext) -> Diagnostics {
  let mut diags = Diagnostics::new();
  let addr = &node.addr;

  let each = node.addr.key.clone();
  let refs: Vec<_> = Node::PlanInstance(node.clone()).references().into_iter().map(|(_, r)| r).collect();
  let each_ctx = match &each {
    InstanceKey::NoKey => None,
    key => Some((key.clone(), node.each_value.clone().unwrap_or(Value::Null))),
  };
  let scope = ctx.scope_with_refs(&addr.module, &refs, each_ctx);

  let provider_addr = match resolve_provider_addr(ctx, addr, Some(&node.config), Some(&scope)) {
    Ok(provider_addr) => provider_addr,
    Err(diag) => {
      diags.push(diag);
      return diags;
    }
  };

  let Some(provider) = ctx.provider(&provider_addr) else {
    diags.push(Diagnostic::bug(
      "Provider not initialized",
      format!("{} is required by {} but was never initialized", provider_addr, addr),
    ));
    return diags;
  };

  let Some(schema) = &node.schema else {
    diags.push(Diagnostic::bug(
      "Missing resource schema",
      format!("No schema was attached for {} before the walk", addr),
    ));
    return diags;
  };

  // Render the desired configuration.
  let config_value = Value::Object(node.config.config.clone().into_iter().collect());
  let mut rendered = match eval_config_value(&config_value, &scope) {
    Ok(value) => value,
    Err(e) => {
      diags.push(
        Diagnostic::error("Invalid resource configuration", e.to_string())
          .with_subject(addr.to_string()),
      );
      return diags;
    }
  };

  if ctx.op == WalkOperation::Validate {
    let Some(_permit) = ctx.acquire().await else {
      return EvalContext::cancelled_diag();
    };
    if let Err(e) = provider
      .validate_resource_config(&addr.resource.type_name, addr.resource.mode, &rendered)
      .await
    {
      diags.push(
        Diagnostic::error("Invalid resource configuration", e.to_string())
          .with_subject(addr.to_string()),
      );
    }
    return diags;
  }

  match addr.resource.mode {
    ResourceMode::Ephemeral => {
      return open_ephemeral(node, ctx, &provider_addr, provider, rendered).await;
    }
    ResourceMode::Data => {
      return read_data(node, ctx, &provider_addr, provider, rendered).await;
    }
    ResourceMode::Managed => {}
  }

  // Recover the prior object: moved state, imports, then plain state.
  let mut prior = ctx.state.resource_instance_object(addr, None);

  if prior.is_none() {
    if let Some(old_addr) = &node.moved_from {
      if let Some(old_object) = ctx.state.resource_instance_object(old_addr, None) {
        let Some(_permit) = ctx.acquire().await else {
          return EvalContext::cancelled_diag();
        };
        info!(from = %old_addr, to = %addr, "moving state to renamed resource type");
        match provider
          .move_state(caldera_provider::UpgradeStateRequest {
            type_name: addr.resource.type_name.clone(),
            prev_type_name: old_addr.resource.type_name.clone(),
            value: old_object.value.clone(),
            from_version: old_object.schema_version,
          })
          .await
        {
          Ok(resp) => {
            let object = ResourceInstanceObject {
              value: resp.value,
              schema_version: old_object.schema_version,
              status: old_object.status,
              dependencies: old_object.dependencies.clone(),
            };
            ctx.state.forget_resource_instance(old_addr);
            ctx.state.set_resource_instance_current(
              addr,
              Some(object.clone()),
              provider_addr.clone(),
            );
            prior = Some(object);
          }
          Err(e) => {
            diags.push(
              Diagnostic::error("Failed to move resource state", e.to_string())
                .with_subject(addr.to_string()),
            );
            return diags;
          }
        }
      }
    }
  }

  if prior.is_none() {
    if let Some(import_id) = &node.import_id {
      let Some(_permit) = ctx.acquire().await else {
        return EvalContext::cancelled_diag();
      };
      info!(addr = %addr, id = %import_id, "importing resource instance");
      match provider
        .read(caldera_provider::ReadRequest {
          type_name: addr.resource.type_name.clone(),
          mode: addr.resource.mode,
          prior: None,
          import_id: Some(import_id.clone()),
        })
        .await
      {
        Ok(resp) => match resp.value {
          Some(value) => {
            let object = ResourceInstanceObject::new(value, schema.version);
            ctx.state.set_resource_instance_current(
              addr,
              Some(object.clone()),
              provider_addr.clone(),
            );
            prior = Some(object);
          }
          None => {
            diags.push(
              Diagnostic::error(
                "Cannot import non-existent remote object",
                format!(
                  "The provider returned no object for id {:?} while importing {}.",
                  import_id, addr
                ),
              )
              .with_subject(addr.to_string()),
            );
            return diags;
          }
        },
        Err(e) => {
          diags.push(
            Diagnostic::error("Import failed", e.to_string()).with_subject(addr.to_string()),
          );
          return diags;
        }
      }
    }
  }

  // Schema version handling, before the object is used for anything.
  if let Some(object) = prior.clone() {
    match upgrade_object(node, ctx, &provider_addr, provider.as_ref(), schema, object).await {
      Ok(upgraded) => prior = Some(upgraded),
      Err(more) => {
        diags.extend(more);
        return diags;
      }
    }
  }

  // Refresh the prior object so the diff is computed against reality.
  if let Some(object) = prior.clone() {
    let Some(_permit) = ctx.acquire().await else {
      return EvalContext::cancelled_diag();
    };
    match provider
      .read(caldera_provider::ReadRequest {
        type_name: addr.resource.type_name.clone(),
        mode: addr.resource.mode,
        prior: Some(object.value.clone()),
        import_id: None,
      })
      .await
    {
      Ok(resp) => match resp.value {
        Some(value) => {
          let refreshed = ResourceInstanceObject { value, ..object };
          ctx.state.set_resource_instance_current(
            addr,
            Some(refreshed.clone()),
            provider_addr.clone(),
          );
          prior = Some(refreshed);
        }
        None => {
          debug!(addr = %addr, "object no longer exists; removing from state");
          ctx.state.set_resource_instance_current(addr, None, provider_addr.clone());
          prior = None;
        }
      },
      Err(e) => {
        diags
          .push(Diagnostic::error("Refresh failed", e.to_string()).with_subject(addr.to_string()));
        return diags;
      }
    }
  }

  // Destroy plans skip the diff entirely.
  if node.destroy_plan {
    let Some(object) = prior else {
      return diags;
    };
    if node.config.lifecycle.prevent_destroy {
      diags.push(prevent_destroy_diag(addr));
      return diags;
    }
    record_change(ctx, addr, None, Action::Delete, Some(object.value), None, provider_addr);
    return diags;
  }

  // Reset ignored attributes to their prior values before diffing.
  for ignored in &node.config.lifecycle.ignore_changes {
    let Some(attr) = schema.attributes.get(ignored) else {
      diags.push(
        Diagnostic::error(
          "Unsupported attribute in ignore_changes",
          format!("The resource type {} has no attribute {:?}.", addr.resource.type_name, ignored),
        )
        .with_subject(addr.to_string()),
      );
      return diags;
    };
    if attr.computed {
      diags.push(
        Diagnostic::error(
          "Unsupported attribute in ignore_changes",
          format!("The attribute {:?} is computed by the provider and cannot be ignored.", ignored),
        )
        .with_subject(addr.to_string()),
      );
      return diags;
    }
    if let (Some(prior_obj), Some(map)) = (&prior, rendered.as_object_mut()) {
      match prior_obj.value.get(ignored) {
        Some(v) => {
          map.insert(ignored.clone(), v.clone());
        }
        None => {
          map.remove(ignored);
        }
      }
    }
  }

  let Some(_permit) = ctx.acquire().await else {
    return EvalContext::cancelled_diag();
  };
  let response = match provider
    .plan_change(caldera_provider::PlanChangeRequest {
      type_name: addr.resource.type_name.clone(),
      mode: addr.resource.mode,
      prior: prior.as_ref().map(|o| o.value.clone()),
      config: Some(rendered),
    })
    .await
  {
    Ok(response) => response,
    Err(e) => {
      diags.push(Diagnostic::error("Plan failed", e.to_string()).with_subject(addr.to_string()));
      return diags;
    }
  };

  let tainted = prior
    .as_ref()
    .map(|o| o.status == caldera_state::ObjectStatus::Tainted)
    .unwrap_or(false);
  let action = match &prior {
    None => Action::Create,
    Some(object) => {
      if tainted || node.force_replace || !response.requires_replace.is_empty() {
        if node.cbd { Action::CreateThenDelete } else { Action::DeleteThenCreate }
      } else if response.planned.as_ref() == Some(&object.value) {
        Action::NoOp
      } else {
        Action::Update
      }
    }
  };

  if action.destroys() && node.config.lifecycle.prevent_destroy {
    diags.push(prevent_destroy_diag(addr));
    return diags;
  }

  info!(addr = %addr, action = %action, "planned resource instance");
  record_change(
    ctx,
    addr,
    None,
    action,
    prior.map(|o| o.value),
    response.planned,
    provider_addr,
  );
  diags
}

async fn open_ephemeral(
  node: &PlanInstanceNode,
  ctx: &EvalContext,
  provider_addr: &AbsProviderInstance,
  provider: std::sync::Arc<dyn caldera_provider::Provider>,
  rendered: Value,
) -> Diagnostics {
  let mut diags = Diagnostics::new();
  let addr = &node.addr;
  let Some(_permit) = ctx.acquire().await else {
    return EvalContext::cancelled_diag();
  };
  match provider
    .read(caldera_provider::ReadRequest {
      type_name: addr.resource.type_name.clone(),
      mode: ResourceMode::Ephemeral,
      prior: Some(rendered),
      import_id: None,
    })
    .await
  {
    Ok(resp) => {
      let value = resp.value.unwrap_or(Value::Null);
      ctx.set_ephemeral_value(addr, value.clone());
      record_change(ctx, addr, None, Action::Open, None, Some(value), provider_addr.clone());
    }
    Err(e) => {
      diags.push(
        Diagnostic::error("Failed to open ephemeral resource", e.to_string())
          .with_subject(addr.to_string()),
      );
    }
  }
  diags
}

async fn read_data(
  node: &PlanInstanceNode,
  ctx: &EvalContext,
  provider_addr: &AbsProviderInstance,
  provider: std::sync::Arc<dyn caldera_provider::Provider>,
  rendered: Value,
) -> Diagnostics {
  let mut diags = Diagnostics::new();
  let addr = &node.addr;
  let Some(_permit) = ctx.acquire().await else {
    return EvalContext::cancelled_diag();
  };
  match provider
    .read(caldera_provider::ReadRequest {
      type_name: addr.resource.type_name.clone(),
      mode: ResourceMode::Data,
      prior: Some(rendered),
      import_id: None,
    })
    .await
  {
    Ok(resp) => {
      let value = resp.value.unwrap_or(Value::Null);
      let schema_version = node.schema.as_ref().map(|s| s.version).unwrap_or(0);
      ctx.state.set_resource_instance_current(
        addr,
        Some(ResourceInstanceObject::new(value.clone(), schema_version)),
        provider_addr.clone(),
      );
      record_change(ctx, addr, None, Action::NoOp, None, Some(value), provider_addr.clone());
    }
    Err(e) => {
      diags.push(
        Diagnostic::error("Failed to read data source", e.to_string())
          .with_subject(addr.to_string()),
      );
    }
  }
  diags
}

/// Bring a prior object to the current schema version. A recorded version
/// newer than the provider's is always fatal; an older one passes through
/// the provider's upgrade transform, whose result must conform to the
/// current schema.
async fn upgrade_object(
  node: &PlanInstanceNode,
  ctx: &EvalContext,
  provider_addr: &AbsProviderInstance,
  provider: &dyn caldera_provider::Provider,
  schema: &Schema,
  object: ResourceInstanceObject,
) -> Result<ResourceInstanceObject, Diagnostics> {
  let addr = &node.addr;
  if object.schema_version > schema.version {
    return Err(
      Diagnostic::error(
        "Resource instance managed by newer provider version",
        format!(
          "The current state of {} was created by a newer provider version than is currently selected. Upgrade the {} provider to work with this state.",
          addr,
          addr.resource.implied_provider()
        ),
      )
      .with_subject(addr.to_string())
      .into(),
    );
  }
  if object.schema_version == schema.version {
    return Ok(object);
  }

  let Some(_permit) = ctx.acquire().await else {
    return Err(EvalContext::cancelled_diag());
  };
  info!(
    addr = %addr,
    from = object.schema_version,
    to = schema.version,
    "upgrading resource state"
  );
  let response = provider
    .upgrade_state(caldera_provider::UpgradeStateRequest {
      type_name: addr.resource.type_name.clone(),
      prev_type_name: addr.resource.type_name.clone(),
      value: object.value.clone(),
      from_version: object.schema_version,
    })
    .await
    .map_err(|e| {
      Diagnostics::from(
        Diagnostic::error("Failed to upgrade resource state", e.to_string())
          .with_subject(addr.to_string()),
      )
    })?;

  let problems = schema.conformance_problems(&response.value);
  if !problems.is_empty() {
    return Err(
      Diagnostic::error(
        "Invalid result from provider state upgrade",
        format!(
          "The upgraded state for {} does not conform to the current schema: {}.",
          addr,
          problems.join("; ")
        ),
      )
      .with_subject(addr.to_string())
      .into(),
    );
  }

  let upgraded = ResourceInstanceObject {
    value: response.value,
    schema_version: schema.version,
    status: object.status,
    dependencies: object.dependencies,
  };
  ctx
    .state
    .set_resource_instance_current(addr, Some(upgraded.clone()), provider_addr.clone());
  Ok(upgraded)
}

fn prevent_destroy_diag(addr: &AbsResourceInstance) -> Diagnostic {
  Diagnostic::error(
    "Instance cannot be destroyed",
    format!(
      "Resource {} has lifecycle.prevent_destroy set, but the plan calls for this resource to be destroyed.",
      addr
    ),
  )
  .with_subject(addr.to_string())
}

/// Plan the removal of an orphaned object: an instance (or deposed object)
/// recorded in state with no matching configuration.
pub async fn plan_orphan(node: &OrphanInstanceNode, ctx: &EvalContext) -> Diagnostics {
  let diags = Diagnostics::new();
  let addr = &node.addr;
  let Some(object) = ctx.state.resource_instance_object(addr, node.deposed.as_ref()) else {
    return diags;
  };
  let provider_addr = ctx.state.resource_provider(addr).unwrap_or_else(|| {
    AbsProviderInstance::default_for(ModuleInstance::root(), addr.resource.implied_provider())
  });

  let action = if node.deposed.is_some() {
    // Deposed objects are never kept; they are destroyed by the next apply.
    Action::Delete
  } else if node.forget {
    Action::Forget
  } else {
    Action::Delete
  };

  info!(addr = %addr, deposed = ?node.deposed, action = %action, "planned orphan");
  record_change(
    ctx,
    addr,
    node.deposed.clone(),
    action,
    Some(object.value),
    None,
    provider_addr,
  );
  diags
}

fn record_change(
  ctx: &EvalContext,
  addr: &AbsResourceInstance,
  deposed: Option<caldera_addrs::DeposedKey>,
  action: Action,
  before: Option<Value>,
  after: Option<Value>,
  provider: AbsProviderInstance,
) {
  ctx.plan.record_change(ResourceInstanceChange {
    addr: addr.clone(),
    deposed,
    action,
    before,
    after,
    provider,
  });
}
