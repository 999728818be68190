//! Variable, output and module-call vertices.

use caldera_addrs::InstanceKey;
use caldera_diags::{Diagnostic, Diagnostics};
use caldera_state::OutputValue;
use serde_json::Value;
use tracing::debug;

use crate::context::{EvalContext, VariableValue};
use crate::eval::{eval_config_value, eval_count, eval_for_each, eval_source, refs_in};
use crate::nodes::{ModuleCallNode, OutputNode, VariableNode};

/// Evaluate the call's `count`/`for_each` for every instance of the calling
/// module and register the resulting module instances with the expander.
pub async fn execute_module_call(node: &ModuleCallNode, ctx: &EvalContext) -> Diagnostics {
  let mut diags = Diagnostics::new();
  let subject = format!("module.{}", node.name);

  for parent in ctx.expander.expand_module(&node.parent) {
    let scope = ctx.scope_for(&parent);
    let keys = if let Some(count) = &node.count {
      match eval_count(count, &scope, &subject) {
        Ok(n) => (0..n as i64).map(InstanceKey::Int).collect(),
        Err(more) => {
          diags.extend(more);
          continue;
        }
      }
    } else if let Some(for_each) = &node.for_each {
      match eval_for_each(for_each, &scope, &subject) {
        Ok(map) => map.into_keys().map(InstanceKey::Str).collect(),
        Err(more) => {
          diags.extend(more);
          continue;
        }
      }
    } else {
      vec![InstanceKey::NoKey]
    };
    debug!(call = %subject, parent = %parent, instances = keys.len(), "expanded module call");
    ctx.expander.set_module_call_instances(&parent, &node.name, keys);
  }

  diags
}

/// Resolve the variable's value for every instance of its module: from the
/// walk inputs at the root, from the calling module's arguments elsewhere,
/// falling back to the declared default.
pub async fn execute_variable(node: &VariableNode, ctx: &EvalContext) -> Diagnostics {
  let mut diags = Diagnostics::new();

  for instance in ctx.expander.expand_module(&node.module) {
    let value = if node.module.is_root() {
      ctx
        .inputs
        .root_variables
        .get(&node.name)
        .cloned()
        .or_else(|| node.config.default.clone())
    } else {
      let Some(step) = instance.steps().last().cloned() else {
        continue;
      };
      let parent = parent_instance(&instance);
      let call = node
        .module
        .parent()
        .and_then(|p| ctx.config.descendant(&p))
        .and_then(|c| c.module_call(&step.name).cloned());
      let arg = call.as_ref().and_then(|c| c.variables.get(&node.name).cloned());
      match arg {
        Some(template) => {
          let sources: Vec<String> = template_sources(&template);
          let refs: Vec<_> =
            sources.iter().flat_map(|s| refs_in(s)).collect();
          let each = match &step.key {
            InstanceKey::NoKey => None,
            key @ InstanceKey::Int(_) => Some((key.clone(), Value::Null)),
            key @ InstanceKey::Str(s) => Some((key.clone(), Value::String(s.clone()))),
          };
          let scope = ctx.scope_with_refs(&parent, &refs, each);
          match eval_config_value(&template, &scope) {
            Ok(value) => Some(value),
            Err(e) => {
              diags.push(
                Diagnostic::error("Invalid module argument", e.to_string())
                  .with_subject(format!("module.{}.{}", step.name, node.name)),
              );
              continue;
            }
          }
        }
        None => node.config.default.clone(),
      }
    };

    match value {
      Some(value) => {
        ctx.set_variable(
          instance,
          &node.name,
          VariableValue { value, sensitive: node.config.sensitive },
        );
      }
      None => {
        diags.push(
          Diagnostic::error(
            "No value for required variable",
            format!(
              "The variable {:?} has no default and no value was supplied.",
              node.name
            ),
          )
          .with_subject(format!("var.{}", node.name)),
        );
      }
    }
  }

  diags
}

/// Render the output value for every instance of its module and record it
/// in state.
pub async fn execute_output(node: &OutputNode, ctx: &EvalContext) -> Diagnostics {
  let mut diags = Diagnostics::new();
  let refs = refs_in(&node.config.value);

  for instance in ctx.expander.expand_module(&node.module) {
    let scope = ctx.scope_with_refs(&instance, &refs, None);
    match eval_source(&node.config.value, &scope) {
      Ok(value) => {
        ctx.state.set_output(
          &instance,
          &node.name,
          OutputValue { value, sensitive: node.config.sensitive },
        );
      }
      Err(e) => {
        diags.push(
          Diagnostic::error("Invalid output value", e.to_string())
            .with_subject(format!("output.{}", node.name)),
        );
      }
    }
  }

  diags
}

fn parent_instance(instance: &caldera_addrs::ModuleInstance) -> caldera_addrs::ModuleInstance {
  let mut parent = caldera_addrs::ModuleInstance::root();
  let steps = instance.steps();
  for step in &steps[..steps.len().saturating_sub(1)] {
    parent = parent.child(step.name.clone(), step.key.clone());
  }
  parent
}

fn template_sources(value: &Value) -> Vec<String> {
  let mut out = Vec::new();
  fn collect(value: &Value, out: &mut Vec<String>) {
    match value {
      Value::String(s) if s.contains("{{") => out.push(s.clone()),
      Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
      Value::Object(map) => map.values().for_each(|v| collect(v, out)),
      _ => {}
    }
  }
  collect(value, &mut out);
  out
}
