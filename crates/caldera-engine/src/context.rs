//! The shared evaluation context.
//!
//! One [`EvalContext`] is created per walk and cloned into every vertex
//! task; clones share the provider cache, variable values, plan, state and
//! concurrency limiter through `Arc`s. The `path` field is the only
//! per-clone piece: the walker rebinds it for vertices that declare a
//! specific module instance.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use caldera_addrs::{
  AbsProviderConfig, AbsProviderInstance, AbsResourceInstance, InstanceKey, ModuleInstance,
  Resource, ResourceMode, Targetable,
};
use caldera_config::Config;
use caldera_diags::{Diagnostic, Diagnostics};
use caldera_plan::SyncPlan;
use caldera_provider::{
  Provider, ProviderFactories, Provisioner, ProvisionerFactories, SchemaCache,
};
use caldera_state::SyncState;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::eval::{Ref, Scope};

/// What kind of walk is running. Transformer pipelines are selected by the
/// engine; vertices branch on this to decide how much work a visit does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOperation {
  Plan,
  PlanDestroy,
  Validate,
  Apply,
}

/// A module variable's resolved value.
#[derive(Debug, Clone)]
pub struct VariableValue {
  pub value: Value,
  pub sensitive: bool,
}

/// Inputs to one walk that come from outside the graph.
#[derive(Debug, Clone, Default)]
pub struct WalkInputs {
  pub root_variables: BTreeMap<String, Value>,
  /// Instances the user asked to replace regardless of diff.
  pub force_replace: Vec<Targetable>,
  /// Import requests: instance address -> remote object id.
  pub import_targets: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct EvalContext {
  /// The module instance this context is bound to.
  pub path: ModuleInstance,
  pub op: WalkOperation,
  pub config: Arc<Config>,
  pub state: SyncState,
  pub plan: SyncPlan,
  pub schemas: Arc<SchemaCache>,
  pub expander: Arc<crate::Expander>,
  pub inputs: Arc<WalkInputs>,
  factories: Arc<ProviderFactories>,
  provisioner_factories: Arc<ProvisionerFactories>,
  providers: Arc<Mutex<BTreeMap<AbsProviderInstance, Arc<dyn Provider>>>>,
  provisioners: Arc<Mutex<BTreeMap<String, Arc<dyn Provisioner>>>>,
  variables: Arc<Mutex<BTreeMap<ModuleInstance, BTreeMap<String, VariableValue>>>>,
  ephemeral: Arc<Mutex<BTreeMap<String, Value>>>,
  semaphore: Arc<Semaphore>,
  cancel: CancellationToken,
}

impl EvalContext {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    op: WalkOperation,
    config: Arc<Config>,
    state: SyncState,
    plan: SyncPlan,
    schemas: Arc<SchemaCache>,
    factories: Arc<ProviderFactories>,
    provisioner_factories: Arc<ProvisionerFactories>,
    inputs: WalkInputs,
    parallelism: usize,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      path: ModuleInstance::root(),
      op,
      config,
      state,
      plan,
      schemas,
      expander: Arc::new(crate::Expander::new()),
      inputs: Arc::new(inputs),
      factories,
      provisioner_factories,
      providers: Arc::new(Mutex::new(BTreeMap::new())),
      provisioners: Arc::new(Mutex::new(BTreeMap::new())),
      variables: Arc::new(Mutex::new(BTreeMap::new())),
      ephemeral: Arc::new(Mutex::new(BTreeMap::new())),
      semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
      cancel,
    }
  }

  /// A clone of this context bound to a different module instance.
  pub fn with_path(&self, path: ModuleInstance) -> Self {
    let mut ctx = self.clone();
    ctx.path = path;
    ctx
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Acquire a slot from the walk-wide concurrency limiter before any
  /// provider call, keeping the total number of in-flight provider
  /// operations bounded regardless of graph width. Returns `None` when the
  /// walk is cancelled while waiting; an operation already running is
  /// allowed to finish instead of being killed.
  pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
      permit = self.semaphore.clone().acquire_owned() => permit.ok(),
      _ = self.cancel.cancelled() => None,
    }
  }

  // ---- provider instance cache -------------------------------------------

  /// Instantiate and cache the provider for `addr`. Initializing the same
  /// address twice is an error, not a silent overwrite.
  pub fn init_provider(
    &self,
    addr: &AbsProviderInstance,
  ) -> Result<Arc<dyn Provider>, Diagnostic> {
    let factory = self.factories.get(&addr.provider_type).ok_or_else(|| {
      Diagnostic::error(
        "Unknown provider type",
        format!("No provider factory is registered for provider type {:?}.", addr.provider_type),
      )
      .with_subject(addr.to_string())
    })?;
    let mut providers = self.providers.lock().unwrap();
    if providers.contains_key(addr) {
      return Err(Diagnostic::bug(
        "Provider already initialized",
        format!("{} is already initialized", addr),
      ));
    }
    let provider = factory();
    providers.insert(addr.clone(), provider.clone());
    Ok(provider)
  }

  pub fn provider(&self, addr: &AbsProviderInstance) -> Option<Arc<dyn Provider>> {
    self.providers.lock().unwrap().get(addr).cloned()
  }

  /// Remove and return every cached instance of one provider type declared
  /// in one module, for the close vertex to shut down.
  pub fn take_providers_for(&self, config_addr: &AbsProviderConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers = self.providers.lock().unwrap();
    let keys: Vec<AbsProviderInstance> = providers
      .keys()
      .filter(|key| {
        key.provider_type == config_addr.provider_type
          && key.module.module_path() == config_addr.module
      })
      .cloned()
      .collect();
    keys.into_iter().filter_map(|key| providers.remove(&key)).collect()
  }

  // ---- provisioner instance cache ----------------------------------------

  /// The cached provisioner for `name`, instantiating it on first use.
  /// Unlike providers there is exactly one instance per provisioner type per
  /// walk, so first use initializes and later uses share it.
  pub fn provisioner(&self, name: &str) -> Result<Arc<dyn Provisioner>, Diagnostic> {
    let mut provisioners = self.provisioners.lock().unwrap();
    if let Some(existing) = provisioners.get(name) {
      return Ok(existing.clone());
    }
    let factory = self.provisioner_factories.get(name).ok_or_else(|| {
      Diagnostic::error(
        "Unknown provisioner",
        format!("No provisioner factory is registered for {:?}.", name),
      )
    })?;
    let provisioner = factory();
    provisioners.insert(name.to_string(), provisioner.clone());
    Ok(provisioner)
  }

  /// Remove and return the cached instance of one provisioner type, for its
  /// close vertex.
  pub fn take_provisioner(&self, name: &str) -> Option<Arc<dyn Provisioner>> {
    self.provisioners.lock().unwrap().remove(name)
  }

  // ---- variables ----------------------------------------------------------

  pub fn set_variable(&self, module: ModuleInstance, name: &str, value: VariableValue) {
    debug!(module = %module, name, "setting module variable");
    self
      .variables
      .lock()
      .unwrap()
      .entry(module)
      .or_default()
      .insert(name.to_string(), value);
  }

  /// The expression scope for a module instance: its variables plus their
  /// sensitivity set.
  pub fn scope_for(&self, module: &ModuleInstance) -> Scope {
    let variables = self.variables.lock().unwrap();
    let mut scope = Scope::default();
    if let Some(vars) = variables.get(module) {
      for (name, value) in vars {
        scope.vars.insert(name.clone(), value.value.clone());
        if value.sensitive {
          scope.sensitive_vars.insert(name.clone());
        }
      }
    }
    scope
  }

  /// A scope extended with the resolved values of the given references,
  /// suitable for rendering attribute templates and output values.
  pub fn scope_with_refs(
    &self,
    module: &ModuleInstance,
    refs: &[Ref],
    each: Option<(InstanceKey, Value)>,
  ) -> Scope {
    let mut scope = self.scope_for(module);
    scope.each = each;
    for reference in refs {
      match reference {
        Ref::Resource(resource) => {
          let value = self.resource_ref_value(resource, module).unwrap_or(Value::Null);
          insert_resource_ref(&mut scope.extra, resource, value);
        }
        Ref::Module(name) => {
          let value = self.module_ref_value(module, name);
          let modules = scope
            .extra
            .entry("module")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
          if let Some(map) = modules.as_object_mut() {
            map.insert(name.clone(), value);
          }
        }
        Ref::Variable(_) | Ref::ModuleCall(_) => {}
      }
    }
    scope
  }

  /// The value a reference to a resource resolves to: the single instance's
  /// object for an unexpanded resource, a list for `count`, a map for
  /// `for_each`. Planned values take precedence over recorded state.
  pub fn resource_ref_value(&self, resource: &Resource, module: &ModuleInstance) -> Option<Value> {
    let abs = caldera_addrs::AbsResource { module: module.clone(), resource: resource.clone() };
    let keys = self.expander.resource_keys(&abs)?;
    let value_of = |key: &InstanceKey| -> Value {
      let addr = abs.instance(key.clone());
      self.instance_value(&addr).unwrap_or(Value::Null)
    };
    match keys.as_slice() {
      [InstanceKey::NoKey] => Some(value_of(&InstanceKey::NoKey)),
      keys if keys.iter().all(|k| matches!(k, InstanceKey::Int(_))) => {
        Some(Value::Array(keys.iter().map(value_of).collect()))
      }
      keys => {
        let mut map = serde_json::Map::new();
        for key in keys {
          if let InstanceKey::Str(s) = key {
            map.insert(s.clone(), value_of(key));
          }
        }
        Some(Value::Object(map))
      }
    }
  }

  fn instance_value(&self, addr: &AbsResourceInstance) -> Option<Value> {
    if addr.resource.mode == ResourceMode::Ephemeral {
      return self.ephemeral.lock().unwrap().get(&addr.to_string()).cloned();
    }
    if let Some(change) = self.plan.change_for(addr, None) {
      if let Some(after) = change.after {
        return Some(after);
      }
    }
    self.state.resource_instance_object(addr, None).map(|o| o.value)
  }

  fn module_ref_value(&self, module: &ModuleInstance, call_name: &str) -> Value {
    let path = module.module_path().child(call_name);
    let instances: Vec<ModuleInstance> = self
      .expander
      .expand_module(&path)
      .into_iter()
      .filter(|mi| module.contains(mi))
      .collect();
    let outputs_of = |mi: &ModuleInstance| -> Value {
      let outputs = self.state.module_outputs(mi);
      Value::Object(outputs.into_iter().map(|(k, v)| (k, v.value)).collect())
    };
    match instances.as_slice() {
      [single] if single.steps().last().map(|s| s.key == InstanceKey::NoKey).unwrap_or(false) => {
        outputs_of(single)
      }
      instances => {
        let mut map = serde_json::Map::new();
        for mi in instances {
          if let Some(step) = mi.steps().last() {
            map.insert(step.key.key_part(), outputs_of(mi));
          }
        }
        Value::Object(map)
      }
    }
  }

  // ---- ephemeral values ---------------------------------------------------

  pub fn set_ephemeral_value(&self, addr: &AbsResourceInstance, value: Value) {
    self.ephemeral.lock().unwrap().insert(addr.to_string(), value);
  }

  // ---- diagnostics helpers ------------------------------------------------

  pub fn cancelled_diag() -> Diagnostics {
    Diagnostic::error("Execution cancelled", "The operation was cancelled before it completed.")
      .into()
  }
}

fn insert_resource_ref(extra: &mut serde_json::Map<String, Value>, resource: &Resource, value: Value) {
  match resource.mode {
    ResourceMode::Managed => {
      let types = extra
        .entry(resource.type_name.clone())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
      if let Some(map) = types.as_object_mut() {
        map.insert(resource.name.clone(), value);
      }
    }
    ResourceMode::Data | ResourceMode::Ephemeral => {
      let root_key = resource.mode.prefix().trim_end_matches('.');
      let root = extra
        .entry(root_key.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
      if let Some(types) = root.as_object_mut() {
        let entry = types
          .entry(resource.type_name.clone())
          .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(map) = entry.as_object_mut() {
          map.insert(resource.name.clone(), value);
        }
      }
    }
  }
}
