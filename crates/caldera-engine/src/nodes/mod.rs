//! Graph node types.
//!
//! One sum type covers every vertex kind; capabilities that the Go-style
//! original expressed as interface assertions are methods returning
//! `Option` here, so transformers probe for them without type switches
//! scattered through the pipeline.

mod apply;
mod provider;
mod resource;
mod value;

use std::fmt;

use caldera_addrs::{
  AbsProviderConfig, AbsProviderInstance, AbsResource, AbsResourceInstance, ConfigResource,
  DeposedKey, InstanceKey, ModuleInstance, ModulePath, Targetable,
};
use caldera_config::{OutputConfig, ProviderBlock, ResourceConfig, VariableConfig};
use caldera_diags::Diagnostics;
use caldera_graph::Graph;
use caldera_provider::Schema;
use serde_json::Value;

use crate::context::EvalContext;
use crate::eval::{Ref, refs_in};

#[derive(Debug, Clone)]
pub struct VariableNode {
  pub module: ModulePath,
  pub name: String,
  pub config: VariableConfig,
}

#[derive(Debug, Clone)]
pub struct OutputNode {
  pub module: ModulePath,
  pub name: String,
  pub config: OutputConfig,
}

#[derive(Debug, Clone)]
pub struct ModuleCallNode {
  pub parent: ModulePath,
  pub name: String,
  pub count: Option<String>,
  pub for_each: Option<String>,
  pub variables: std::collections::BTreeMap<String, Value>,
}

/// One vertex per provider type per module, holding every configuration
/// block for that type so duplicate generated instance addresses can be
/// detected across blocks during expansion.
#[derive(Debug, Clone)]
pub struct ProviderNode {
  pub module: ModulePath,
  pub provider_type: String,
  pub configs: Vec<ProviderBlock>,
}

#[derive(Debug, Clone)]
pub struct ProviderInstanceNode {
  pub addr: AbsProviderInstance,
  pub config: ProviderBlock,
}

#[derive(Debug, Clone)]
pub struct CloseProviderNode {
  pub addr: AbsProviderConfig,
}

#[derive(Debug, Clone)]
pub struct CloseProvisionerNode {
  pub name: String,
}

#[derive(Debug, Clone)]
pub struct ResourceNode {
  pub addr: ConfigResource,
  pub config: ResourceConfig,
  pub schema: Option<Schema>,
  pub cbd: bool,
  /// Expand into destroy-plan instances instead of regular plan instances.
  pub destroy_plan: bool,
  pub targets: Vec<Targetable>,
  pub excludes: Vec<Targetable>,
}

#[derive(Debug, Clone)]
pub struct PlanInstanceNode {
  pub addr: AbsResourceInstance,
  pub config: ResourceConfig,
  pub schema: Option<Schema>,
  pub cbd: bool,
  pub destroy_plan: bool,
  pub force_replace: bool,
  pub import_id: Option<String>,
  pub each_value: Option<Value>,
  /// State found under a renamed resource type that must be moved through
  /// the provider before planning.
  pub moved_from: Option<AbsResourceInstance>,
}

/// An instance (or deposed object) present in state with no configuration;
/// plans a delete, or a forget when a removed block asks for it.
#[derive(Debug, Clone)]
pub struct OrphanInstanceNode {
  pub addr: AbsResourceInstance,
  pub deposed: Option<DeposedKey>,
  pub forget: bool,
}

#[derive(Debug, Clone)]
pub struct ApplyInstanceNode {
  pub addr: AbsResourceInstance,
  pub config: Option<ResourceConfig>,
  pub schema: Option<Schema>,
  pub cbd: bool,
  /// For a create-before-destroy replace, the key the current object will
  /// be deposed under; the paired destroy node carries the same key.
  pub preallocated_deposed: Option<DeposedKey>,
}

#[derive(Debug, Clone)]
pub struct DestroyInstanceNode {
  pub addr: AbsResourceInstance,
  pub deposed: Option<DeposedKey>,
  pub cbd: bool,
}

#[derive(Debug, Clone)]
pub struct ForgetInstanceNode {
  pub addr: AbsResourceInstance,
  pub deposed: Option<DeposedKey>,
}

#[derive(Debug, Clone)]
pub struct OpenInstanceNode {
  pub addr: AbsResourceInstance,
  pub config: Option<ResourceConfig>,
  pub schema: Option<Schema>,
}

/// One graph vertex.
#[derive(Debug, Clone)]
pub enum Node {
  /// Synthetic sentinel every graph funnels into.
  Root,
  Variable(VariableNode),
  Output(OutputNode),
  ModuleCall(ModuleCallNode),
  Provider(ProviderNode),
  ProviderInstance(ProviderInstanceNode),
  CloseProvider(CloseProviderNode),
  CloseProvisioner(CloseProvisionerNode),
  Resource(ResourceNode),
  PlanInstance(PlanInstanceNode),
  OrphanInstance(OrphanInstanceNode),
  ApplyInstance(ApplyInstanceNode),
  DestroyInstance(DestroyInstanceNode),
  ForgetInstance(ForgetInstanceNode),
  OpenInstance(OpenInstanceNode),
}

fn scoped(module: &ModulePath, name: &str) -> String {
  if module.is_root() {
    name.to_string()
  } else {
    format!("{}.{}", module, name)
  }
}

impl fmt::Display for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Root => f.write_str("root"),
      Self::Variable(n) => f.write_str(&scoped(&n.module, &format!("var.{}", n.name))),
      Self::Output(n) => f.write_str(&scoped(&n.module, &format!("output.{}", n.name))),
      Self::ModuleCall(n) => {
        f.write_str(&scoped(&n.parent, &format!("module.{} (expand)", n.name)))
      }
      Self::Provider(n) => {
        let name = format!("provider.{}", n.provider_type);
        write!(f, "{} (expand)", scoped(&n.module, &name))
      }
      Self::ProviderInstance(n) => write!(f, "{}", n.addr),
      Self::CloseProvider(n) => write!(f, "{} (close)", n.addr),
      Self::CloseProvisioner(n) => write!(f, "provisioner.{} (close)", n.name),
      Self::Resource(n) => write!(f, "{} (expand)", n.addr),
      Self::PlanInstance(n) => write!(f, "{} (plan)", n.addr),
      Self::OrphanInstance(n) => match &n.deposed {
        Some(key) => write!(f, "{} deposed {} (plan)", n.addr, key),
        None => write!(f, "{} (plan orphan)", n.addr),
      },
      Self::ApplyInstance(n) => write!(f, "{} (apply)", n.addr),
      Self::DestroyInstance(n) => match &n.deposed {
        Some(key) => write!(f, "{} deposed {} (destroy)", n.addr, key),
        None => write!(f, "{} (destroy)", n.addr),
      },
      Self::ForgetInstance(n) => match &n.deposed {
        Some(key) => write!(f, "{} deposed {} (forget)", n.addr, key),
        None => write!(f, "{} (forget)", n.addr),
      },
      Self::OpenInstance(n) => write!(f, "{} (open)", n.addr),
    }
  }
}

/// A static module path rendered as an unkeyed module instance, for
/// targeting comparisons against config-level vertices.
fn unkeyed_instance(path: &ModulePath) -> ModuleInstance {
  let mut instance = ModuleInstance::root();
  for step in path.steps() {
    instance = instance.child(step.clone(), InstanceKey::NoKey);
  }
  instance
}

impl Node {
  pub fn is_root(&self) -> bool {
    matches!(self, Self::Root)
  }

  /// The static module scope the node's expressions evaluate in.
  pub fn module_path(&self) -> Option<ModulePath> {
    match self {
      Self::Root | Self::CloseProvisioner(_) => None,
      Self::Variable(n) => Some(n.module.clone()),
      Self::Output(n) => Some(n.module.clone()),
      Self::ModuleCall(n) => Some(n.parent.clone()),
      Self::Provider(n) => Some(n.module.clone()),
      Self::ProviderInstance(n) => Some(n.addr.module.module_path()),
      Self::CloseProvider(n) => Some(n.addr.module.clone()),
      Self::Resource(n) => Some(n.addr.module.clone()),
      Self::PlanInstance(n) => Some(n.addr.module.module_path()),
      Self::OrphanInstance(n) => Some(n.addr.module.module_path()),
      Self::ApplyInstance(n) => Some(n.addr.module.module_path()),
      Self::DestroyInstance(n) => Some(n.addr.module.module_path()),
      Self::ForgetInstance(n) => Some(n.addr.module.module_path()),
      Self::OpenInstance(n) => Some(n.addr.module.module_path()),
    }
  }

  /// The concrete module instance the walker should bind the context to.
  pub fn path_binding(&self) -> Option<ModuleInstance> {
    match self {
      Self::ProviderInstance(n) => Some(n.addr.module.clone()),
      Self::PlanInstance(n) => Some(n.addr.module.clone()),
      Self::OrphanInstance(n) => Some(n.addr.module.clone()),
      Self::ApplyInstance(n) => Some(n.addr.module.clone()),
      Self::DestroyInstance(n) => Some(n.addr.module.clone()),
      Self::ForgetInstance(n) => Some(n.addr.module.clone()),
      Self::OpenInstance(n) => Some(n.addr.module.clone()),
      _ => None,
    }
  }

  /// References this node makes, paired with the module scope each was
  /// written in. Every vertex configured inside a nested module implicitly
  /// references the call that expands the module, so nothing evaluates
  /// before its module instances are known.
  pub fn references(&self) -> Vec<(ModulePath, Ref)> {
    let mut refs: Vec<(ModulePath, Ref)> = Vec::new();
    if let Some(module) = self.module_path() {
      if let (Some(parent), Some(call)) = (module.parent(), module.steps().last()) {
        refs.push((parent, Ref::ModuleCall(call.clone())));
      }
    }
    let mut add_sources = |module: &ModulePath, sources: &[&str]| {
      for source in sources {
        for r in refs_in(source) {
          refs.push((module.clone(), r));
        }
      }
    };
    match self {
      Self::Variable(_) => {}
      Self::Output(n) => add_sources(&n.module, &[n.config.value.as_str()]),
      Self::ModuleCall(n) => {
        let sources: Vec<&str> = n
          .count
          .iter()
          .chain(n.for_each.iter())
          .map(String::as_str)
          .chain(n.variables.values().filter_map(Value::as_str))
          .collect();
        add_sources(&n.parent, &sources);
      }
      Self::Provider(n) => {
        for block in &n.configs {
          let mut sources: Vec<&str> = block.for_each.iter().map(String::as_str).collect();
          sources.extend(block.alias.iter().map(String::as_str));
          sources.extend(config_template_sources(&block.config));
          add_sources(&n.module, &sources);
        }
      }
      Self::Resource(n) => {
        refs.extend(resource_config_refs(&n.addr.module, &n.config));
      }
      Self::PlanInstance(n) => {
        refs.extend(resource_config_refs(&n.addr.module.module_path(), &n.config));
      }
      Self::ApplyInstance(n) => {
        if let Some(config) = &n.config {
          refs.extend(resource_config_refs(&n.addr.module.module_path(), config));
        }
      }
      Self::OpenInstance(n) => {
        if let Some(config) = &n.config {
          refs.extend(resource_config_refs(&n.addr.module.module_path(), config));
        }
      }
      _ => {}
    }
    refs
  }

  /// What this node provides to referencers.
  pub fn provides(&self) -> Vec<(ModulePath, Ref)> {
    match self {
      Self::Variable(n) => vec![(n.module.clone(), Ref::Variable(n.name.clone()))],
      Self::Resource(n) => {
        vec![(n.addr.module.clone(), Ref::Resource(n.addr.resource.clone()))]
      }
      Self::PlanInstance(n) => vec![(
        n.addr.module.module_path(),
        Ref::Resource(n.addr.resource.clone()),
      )],
      Self::ApplyInstance(n) => vec![(
        n.addr.module.module_path(),
        Ref::Resource(n.addr.resource.clone()),
      )],
      Self::OpenInstance(n) => vec![(
        n.addr.module.module_path(),
        Ref::Resource(n.addr.resource.clone()),
      )],
      Self::ModuleCall(n) => vec![
        (n.parent.clone(), Ref::Module(n.name.clone())),
        (n.parent.clone(), Ref::ModuleCall(n.name.clone())),
      ],
      Self::Output(n) => match (n.module.parent(), n.module.steps().last()) {
        (Some(parent), Some(call)) => vec![(parent, Ref::Module(call.clone()))],
        _ => Vec::new(),
      },
      _ => Vec::new(),
    }
  }

  /// The targetable address of resource-kind vertices.
  pub fn target_addr(&self) -> Option<Targetable> {
    match self {
      Self::Resource(n) => Some(Targetable::Resource(AbsResource {
        module: unkeyed_instance(&n.addr.module),
        resource: n.addr.resource.clone(),
      })),
      Self::PlanInstance(n) => Some(Targetable::ResourceInstance(n.addr.clone())),
      Self::OrphanInstance(n) => Some(Targetable::ResourceInstance(n.addr.clone())),
      Self::ApplyInstance(n) => Some(Targetable::ResourceInstance(n.addr.clone())),
      Self::DestroyInstance(n) => Some(Targetable::ResourceInstance(n.addr.clone())),
      Self::ForgetInstance(n) => Some(Targetable::ResourceInstance(n.addr.clone())),
      Self::OpenInstance(n) => Some(Targetable::ResourceInstance(n.addr.clone())),
      _ => None,
    }
  }

  pub fn is_output(&self) -> bool {
    matches!(self, Self::Output(_))
  }

  pub fn creates_before_destroy(&self) -> Option<bool> {
    match self {
      Self::Resource(n) => Some(n.cbd),
      Self::PlanInstance(n) => Some(n.cbd),
      Self::ApplyInstance(n) => Some(n.cbd),
      Self::DestroyInstance(n) => Some(n.cbd),
      _ => None,
    }
  }

  /// Force create-before-destroy on or off. Fails on nodes without the
  /// capability so the caller can name the resource in its diagnostic.
  pub fn set_create_before_destroy(&mut self, cbd: bool) -> Result<(), String> {
    match self {
      Self::Resource(n) => n.cbd = cbd,
      Self::PlanInstance(n) => n.cbd = cbd,
      Self::ApplyInstance(n) => n.cbd = cbd,
      Self::DestroyInstance(n) => n.cbd = cbd,
      other => return Err(format!("{} cannot take a create_before_destroy setting", other)),
    }
    Ok(())
  }

  /// The instance this node creates or updates, for destroy-edge wiring.
  pub fn creator_addr(&self) -> Option<AbsResourceInstance> {
    match self {
      Self::ApplyInstance(n) => Some(n.addr.clone()),
      _ => None,
    }
  }

  /// The object this node destroys.
  pub fn destroyer_addr(&self) -> Option<(AbsResourceInstance, Option<DeposedKey>)> {
    match self {
      Self::DestroyInstance(n) => Some((n.addr.clone(), n.deposed.clone())),
      _ => None,
    }
  }

  pub fn set_targets(&mut self, targets: Vec<Targetable>) {
    if let Self::Resource(n) = self {
      n.targets = targets;
    }
  }

  pub fn set_excludes(&mut self, excludes: Vec<Targetable>) {
    if let Self::Resource(n) = self {
      n.excludes = excludes;
    }
  }

  /// Visit this vertex: run its behavior against the walk context.
  pub async fn execute(&self, ctx: &EvalContext) -> Diagnostics {
    match self {
      Self::Root | Self::Provider(_) | Self::Resource(_) => Diagnostics::new(),
      Self::Variable(n) => value::execute_variable(n, ctx).await,
      Self::Output(n) => value::execute_output(n, ctx).await,
      Self::ModuleCall(n) => value::execute_module_call(n, ctx).await,
      Self::ProviderInstance(n) => provider::execute_instance(n, ctx).await,
      Self::CloseProvider(n) => provider::execute_close(n, ctx).await,
      Self::CloseProvisioner(n) => provider::execute_close_provisioner(n, ctx).await,
      Self::PlanInstance(n) => resource::plan_instance(n, ctx).await,
      Self::OrphanInstance(n) => resource::plan_orphan(n, ctx).await,
      Self::ApplyInstance(n) => apply::apply_instance(n, ctx).await,
      Self::DestroyInstance(n) => apply::destroy_instance(n, ctx).await,
      Self::ForgetInstance(n) => apply::forget_instance(n, ctx).await,
      Self::OpenInstance(n) => apply::open_instance(n, ctx).await,
    }
  }

  /// Produce the runtime-determined subgraph for dynamically expandable
  /// vertices, or `None` for everything else.
  pub fn dynamic_expand(&self, ctx: &EvalContext) -> Option<Result<Graph<Node>, Diagnostics>> {
    match self {
      Self::Provider(n) => Some(provider::expand_provider(n, ctx)),
      Self::Resource(n) => Some(resource::expand_resource(n, ctx)),
      _ => None,
    }
  }
}

fn config_template_sources(config: &std::collections::BTreeMap<String, Value>) -> Vec<&str> {
  fn collect<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
      Value::String(s) if s.contains("{{") => out.push(s.as_str()),
      Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
      Value::Object(map) => map.values().for_each(|v| collect(v, out)),
      _ => {}
    }
  }
  let mut out = Vec::new();
  for value in config.values() {
    collect(value, &mut out);
  }
  out
}

fn resource_config_refs(module: &ModulePath, config: &ResourceConfig) -> Vec<(ModulePath, Ref)> {
  let mut refs = Vec::new();
  let mut sources: Vec<&str> = Vec::new();
  sources.extend(config.count.iter().map(String::as_str));
  sources.extend(config.for_each.iter().map(String::as_str));
  sources.extend(config_template_sources(&config.config));
  for source in sources {
    for r in refs_in(source) {
      refs.push((module.clone(), r));
    }
  }
  for dep in &config.depends_on {
    if let Ok(target) = Targetable::parse(dep) {
      match target {
        Targetable::Resource(abs) => {
          refs.push((module.clone(), Ref::Resource(abs.resource)));
        }
        Targetable::ResourceInstance(abs) => {
          refs.push((module.clone(), Ref::Resource(abs.resource)));
        }
        Targetable::Module(mi) => {
          if let Some(step) = mi.steps().first() {
            refs.push((module.clone(), Ref::Module(step.name.clone())));
          }
        }
      }
    }
  }
  refs
}
