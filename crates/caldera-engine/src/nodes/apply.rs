//! Apply-time vertices: realize planned actions against the providers and
//! record the results in state.

use caldera_addrs::{AbsProviderInstance, ModuleInstance, ResourceMode};
use caldera_config::ProvisionWhen;
use caldera_diags::{Diagnostic, Diagnostics};
use caldera_plan::Action;
use caldera_provider::Provider;
use caldera_state::ResourceInstanceObject;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::EvalContext;
use crate::eval::Ref;
use crate::nodes::{
  ApplyInstanceNode, DestroyInstanceNode, ForgetInstanceNode, Node, OpenInstanceNode,
};

/// Create or update one resource instance according to its planned change.
/// For a create-before-destroy replace this vertex deposes the current
/// object under the pre-allocated key before creating its replacement; the
/// paired destroy vertex destroys exactly that deposed object later.
pub async fn apply_instance(node: &ApplyInstanceNode, ctx: &EvalContext) -> Diagnostics {
  let mut diags = Diagnostics::new();
  let addr = &node.addr;

  let Some(change) = ctx.plan.change_for(addr, None) else {
    diags.push(Diagnostic::bug(
      "Missing planned change",
      format!("{} has an apply vertex but the plan has no change for it", addr),
    ));
    return diags;
  };

  match change.action {
    Action::NoOp => return diags,
    action if action.creates_or_updates() => {}
    action => {
      diags.push(Diagnostic::bug(
        "Invalid planned change",
        format!("{} reached the apply vertex with non-apply action {}", addr, action),
      ));
      return diags;
    }
  }

  let Some(provider) = ctx.provider(&change.provider) else {
    diags.push(Diagnostic::bug(
      "Provider not initialized",
      format!("{} is required by {} but was never initialized", change.provider, addr),
    ));
    return diags;
  };

  let mut prior = ctx.state.resource_instance_object(addr, None);

  if change.action == Action::CreateThenDelete && prior.is_some() {
    match ctx.state.depose_resource_instance(addr, node.preallocated_deposed.clone()) {
      Ok(key) => {
        info!(addr = %addr, key = ?key, "deposed current object pending replacement");
        prior = None;
      }
      Err(e) => {
        diags.push(Diagnostic::bug("Failed to depose object", e.to_string()));
        return diags;
      }
    }
  }

  let creating = prior.is_none();
  let apply_result = {
    let Some(_permit) = ctx.acquire().await else {
      return EvalContext::cancelled_diag();
    };
    info!(addr = %addr, action = %change.action, "applying change");
    provider
      .apply_change(caldera_provider::ApplyChangeRequest {
        type_name: addr.resource.type_name.clone(),
        mode: addr.resource.mode,
        prior: prior.map(|o| o.value),
        planned: change.after.clone(),
      })
      .await
  };

  match apply_result {
    Ok(resp) => match resp.new_value {
      Some(value) => {
        let mut object = ResourceInstanceObject {
          value,
          schema_version: node.schema.as_ref().map(|s| s.version).unwrap_or(0),
          status: caldera_state::ObjectStatus::Ready,
          dependencies: recorded_dependencies(node),
        };
        // Creation-time provisioners run once the object exists; a failed
        // run taints the new object so the next plan replaces it.
        if creating {
          let provision_diags = run_provisioners(
            node.config.as_ref(),
            ProvisionWhen::Create,
            &object.value,
            ctx,
            addr,
          )
          .await;
          if provision_diags.has_errors() {
            object.status = caldera_state::ObjectStatus::Tainted;
          }
          diags.extend(provision_diags);
        }
        ctx.state.set_resource_instance_current(addr, Some(object), change.provider.clone());
      }
      None => {
        ctx.state.set_resource_instance_current(addr, None, change.provider.clone());
      }
    },
    Err(e) => {
      diags.push(Diagnostic::error("Apply failed", e.to_string()).with_subject(addr.to_string()));
    }
  }

  diags
}

/// Run the provisioners of one phase against an instance value. The value
/// is exposed to configuration templates as `self`.
async fn run_provisioners(
  config: Option<&caldera_config::ResourceConfig>,
  when: ProvisionWhen,
  instance_value: &Value,
  ctx: &EvalContext,
  addr: &caldera_addrs::AbsResourceInstance,
) -> Diagnostics {
  let mut diags = Diagnostics::new();
  let Some(config) = config else {
    return diags;
  };
  for provisioner_config in config.provisioners.iter().filter(|p| p.when == when) {
    let provisioner = match ctx.provisioner(&provisioner_config.name) {
      Ok(provisioner) => provisioner,
      Err(diag) => {
        diags.push(diag.with_subject(addr.to_string()));
        continue;
      }
    };

    let mut scope = ctx.scope_for(&addr.module);
    scope.extra.insert("self".to_string(), instance_value.clone());
    let raw = Value::Object(provisioner_config.config.clone().into_iter().collect());
    let rendered = match crate::eval::eval_config_value(&raw, &scope) {
      Ok(rendered) => rendered,
      Err(e) => {
        diags.push(
          Diagnostic::error("Invalid provisioner configuration", e.to_string())
            .with_subject(addr.to_string()),
        );
        continue;
      }
    };

    let Some(_permit) = ctx.acquire().await else {
      return EvalContext::cancelled_diag();
    };
    info!(addr = %addr, provisioner = %provisioner_config.name, "running provisioner");
    if let Err(e) = provisioner
      .provision(caldera_provider::ProvisionRequest {
        config: rendered,
        instance_value: instance_value.clone(),
      })
      .await
    {
      diags.push(
        Diagnostic::error("Provisioning failed", e.to_string()).with_subject(addr.to_string()),
      );
    }
  }
  diags
}

/// The resource addresses this instance depends on, recorded into state so
/// destroys can be ordered after the configuration is gone.
fn recorded_dependencies(node: &ApplyInstanceNode) -> Vec<caldera_addrs::AbsResource> {
  let as_node = Node::ApplyInstance(node.clone());
  as_node
    .references()
    .into_iter()
    .filter_map(|(_, r)| match r {
      Ref::Resource(resource) => Some(caldera_addrs::AbsResource {
        module: node.addr.module.clone(),
        resource,
      }),
      _ => None,
    })
    .collect()
}

/// Destroy one object: the instance's current object, or the deposed object
/// named by the vertex's key.
pub async fn destroy_instance(node: &DestroyInstanceNode, ctx: &EvalContext) -> Diagnostics {
  let mut diags = Diagnostics::new();
  let addr = &node.addr;

  if addr.resource.mode == ResourceMode::Ephemeral {
    diags.push(Diagnostic::bug(
      "An ephemeral resource planned for destroy",
      format!(
        "A destroy operation has been planned for the ephemeral resource {}. This is a Caldera error",
        addr
      ),
    ));
    return diags;
  }

  let Some(object) = ctx.state.resource_instance_object(addr, node.deposed.as_ref()) else {
    // Already gone; nothing to destroy.
    return diags;
  };

  // Destroy-time provisioners run first; when one fails the object must be
  // left alone so the run can be retried.
  let resource_config = ctx
    .config
    .descendant(&addr.module.module_path())
    .and_then(|m| m.resource(&addr.resource))
    .cloned();
  let provision_diags =
    run_provisioners(resource_config.as_ref(), ProvisionWhen::Destroy, &object.value, ctx, addr)
      .await;
  if provision_diags.has_errors() {
    diags.extend(provision_diags);
    return diags;
  }
  diags.extend(provision_diags);

  let provider_addr = ctx
    .plan
    .change_for(addr, node.deposed.as_ref())
    .map(|c| c.provider)
    .or_else(|| ctx.state.resource_provider(addr))
    .unwrap_or_else(|| {
      AbsProviderInstance::default_for(ModuleInstance::root(), addr.resource.implied_provider())
    });
  let Some(provider) = ctx.provider(&provider_addr) else {
    diags.push(Diagnostic::bug(
      "Provider not initialized",
      format!("{} is required to destroy {} but was never initialized", provider_addr, addr),
    ));
    return diags;
  };

  let Some(_permit) = ctx.acquire().await else {
    return EvalContext::cancelled_diag();
  };
  match &node.deposed {
    Some(key) => info!(addr = %addr, key = %key, "destroying deposed object"),
    None => info!(addr = %addr, "destroying object"),
  }
  match provider
    .apply_change(caldera_provider::ApplyChangeRequest {
      type_name: addr.resource.type_name.clone(),
      mode: addr.resource.mode,
      prior: Some(object.value),
      planned: None,
    })
    .await
  {
    Ok(_) => match &node.deposed {
      Some(key) => ctx.state.remove_resource_instance_deposed(addr, key),
      None => ctx.state.set_resource_instance_current(addr, None, provider_addr),
    },
    Err(e) => {
      diags
        .push(Diagnostic::error("Destroy failed", e.to_string()).with_subject(addr.to_string()));
    }
  }

  diags
}

/// Remove an object from state without destroying the real-world object.
pub async fn forget_instance(node: &ForgetInstanceNode, ctx: &EvalContext) -> Diagnostics {
  let addr = &node.addr;
  match &node.deposed {
    Some(key) => {
      warn!(addr = %addr, key = %key, "deposed object removed from state but not destroyed");
      ctx.state.remove_resource_instance_deposed(addr, key);
    }
    None => {
      warn!(addr = %addr, "object removed from state but not destroyed");
      ctx.state.forget_resource_instance(addr);
    }
  }
  Diagnostics::new()
}

/// Open an ephemeral resource for the duration of the apply walk.
pub async fn open_instance(node: &OpenInstanceNode, ctx: &EvalContext) -> Diagnostics {
  let mut diags = Diagnostics::new();
  let addr = &node.addr;

  let Some(change) = ctx.plan.change_for(addr, None) else {
    diags.push(Diagnostic::bug(
      "Missing planned change",
      format!("{} has an open vertex but the plan has no change for it", addr),
    ));
    return diags;
  };

  let Some(provider) = ctx.provider(&change.provider) else {
    diags.push(Diagnostic::bug(
      "Provider not initialized",
      format!("{} is required by {} but was never initialized", change.provider, addr),
    ));
    return diags;
  };

  let Some(_permit) = ctx.acquire().await else {
    return EvalContext::cancelled_diag();
  };
  info!(addr = %addr, "opening ephemeral resource");
  match provider
    .read(caldera_provider::ReadRequest {
      type_name: addr.resource.type_name.clone(),
      mode: ResourceMode::Ephemeral,
      prior: change.after.clone(),
      import_id: None,
    })
    .await
  {
    Ok(resp) => {
      ctx.set_ephemeral_value(addr, resp.value.unwrap_or(Value::Null));
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
