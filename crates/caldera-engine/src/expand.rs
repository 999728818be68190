//! Instance expansion registry.
//!
//! Expansion happens at walk time: module-call and resource vertices
//! evaluate their `count`/`for_each` and record the concrete instances here,
//! so later vertices (and anything resolving references across modules) can
//! enumerate them. The registry is shared across the whole walk and guarded
//! by a single mutex.

use std::collections::BTreeMap;
use std::sync::Mutex;

use caldera_addrs::{AbsResource, InstanceKey, ModuleInstance, ModulePath};

#[derive(Debug, Default)]
struct ExpanderState {
  /// Fully-expanded instances per static module path. The root path is
  /// always present with the single root instance.
  module_instances: BTreeMap<ModulePath, Vec<ModuleInstance>>,
  resource_keys: BTreeMap<AbsResource, Vec<InstanceKey>>,
}

/// Shared registry of module and resource expansions for one walk.
#[derive(Debug, Default)]
pub struct Expander {
  inner: Mutex<ExpanderState>,
}

impl Expander {
  pub fn new() -> Self {
    let expander = Self::default();
    expander
      .inner
      .lock()
      .unwrap()
      .module_instances
      .insert(ModulePath::root(), vec![ModuleInstance::root()]);
    expander
  }

  /// Record the instances of one module call under one parent instance.
  pub fn set_module_call_instances(
    &self,
    parent: &ModuleInstance,
    call_name: &str,
    keys: Vec<InstanceKey>,
  ) {
    let mut state = self.inner.lock().unwrap();
    let path = parent.module_path().child(call_name);
    let entry = state.module_instances.entry(path).or_default();
    for key in keys {
      let instance = parent.child(call_name, key);
      if !entry.contains(&instance) {
        entry.push(instance);
      }
    }
    entry.sort();
  }

  /// All known instances of the given static module path. Empty if the
  /// module (or an ancestor) expanded to nothing.
  pub fn expand_module(&self, path: &ModulePath) -> Vec<ModuleInstance> {
    self.inner.lock().unwrap().module_instances.get(path).cloned().unwrap_or_default()
  }

  pub fn set_resource_keys(&self, addr: AbsResource, keys: Vec<InstanceKey>) {
    self.inner.lock().unwrap().resource_keys.insert(addr, keys);
  }

  pub fn resource_keys(&self, addr: &AbsResource) -> Option<Vec<InstanceKey>> {
    self.inner.lock().unwrap().resource_keys.get(addr).cloned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn root_is_always_expanded() {
    let expander = Expander::new();
    assert_eq!(expander.expand_module(&ModulePath::root()), vec![ModuleInstance::root()]);
  }

  #[test]
  fn nested_module_expansion_composes() {
    let expander = Expander::new();
    let root = ModuleInstance::root();
    expander.set_module_call_instances(
      &root,
      "net",
      vec![InstanceKey::Str("east".into()), InstanceKey::Str("west".into())],
    );
    for parent in expander.expand_module(&ModulePath::root().child("net")) {
      expander.set_module_call_instances(&parent, "subnet", vec![InstanceKey::Int(0)]);
    }

    let subnets = expander.expand_module(&ModulePath::root().child("net").child("subnet"));
    assert_eq!(subnets.len(), 2);
    assert!(subnets.iter().all(|mi| mi.steps().len() == 2));

    // An unexpanded path yields nothing.
    assert!(expander.expand_module(&ModulePath::root().child("missing")).is_empty());
  }
}
