use std::collections::BTreeMap;

use caldera_addrs::{
  AbsProviderInstance, AbsResource, AbsResourceInstance, DeposedKey, InstanceKey, ModuleInstance,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether an object is believed to be in sync with its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
  #[default]
  Ready,
  /// A previous apply failed partway; the object must be replaced.
  Tainted,
}

/// The recorded remote object for one resource instance generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceObject {
  pub value: Value,
  /// The provider schema version the value was written with. When this is
  /// older than the provider's current version the object must pass through
  /// the provider's upgrade transform before use; when newer, the state was
  /// written by a newer provider and is unusable.
  #[serde(default)]
  pub schema_version: u64,
  #[serde(default)]
  pub status: ObjectStatus,
  /// Addresses of the resources this object depended on when it was written,
  /// used to order destroys when the configuration is gone.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<AbsResource>,
}

impl ResourceInstanceObject {
  pub fn new(value: Value, schema_version: u64) -> Self {
    Self { value, schema_version, status: ObjectStatus::Ready, dependencies: Vec::new() }
  }
}

/// State of one resource instance: at most one current object plus any
/// deposed objects pending destruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub current: Option<ResourceInstanceObject>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub deposed: BTreeMap<DeposedKey, ResourceInstanceObject>,
}

impl InstanceState {
  pub fn has_objects(&self) -> bool {
    self.current.is_some() || !self.deposed.is_empty()
  }

  /// Generate a deposed key guaranteed not to be in use for this instance at
  /// the time of the call. The keyspace is small, so spin until unused.
  pub fn find_unused_deposed_key(&self) -> DeposedKey {
    loop {
      let key = DeposedKey::new_random();
      if !self.deposed.contains_key(&key) {
        return key;
      }
    }
  }

  /// Move the current object into the deposed map under `force_key` (or a
  /// fresh unused key) and clear current. Returns the key used, or `None`
  /// when there is no current object to depose. The caller must ensure a
  /// forced key is unused; see [`crate::SyncState::depose_resource_instance`].
  pub fn depose_current(&mut self, force_key: Option<DeposedKey>) -> Option<DeposedKey> {
    let current = self.current.take()?;
    let key = force_key.unwrap_or_else(|| self.find_unused_deposed_key());
    self.deposed.insert(key.clone(), current);
    Some(key)
  }
}

/// State of one resource: the provider that manages it plus its instances,
/// keyed by the compact instance-key form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
  pub addr: AbsResource,
  /// The provider instance that most recently managed this resource, kept so
  /// objects are destroyed and refreshed by the same provider even after the
  /// configuration block is gone.
  pub provider: AbsProviderInstance,
  #[serde(default)]
  pub instances: BTreeMap<InstanceKey, InstanceState>,
}

/// State of one module instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub resources: BTreeMap<String, ResourceState>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub outputs: BTreeMap<String, OutputValue>,
}

/// A module output value recorded in state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
  pub value: Value,
  #[serde(default)]
  pub sensitive: bool,
}

/// The full recorded state, keyed by rendered module instance address (the
/// typed address lives on each resource).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
  #[serde(default)]
  pub modules: BTreeMap<String, ModuleState>,
}

impl State {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn module(&self, module: &ModuleInstance) -> Option<&ModuleState> {
    self.modules.get(&module.to_string())
  }

  pub fn module_mut(&mut self, module: &ModuleInstance) -> &mut ModuleState {
    self.modules.entry(module.to_string()).or_default()
  }

  pub fn resource(&self, addr: &AbsResource) -> Option<&ResourceState> {
    self.module(&addr.module)?.resources.get(&addr.resource.to_string())
  }

  pub fn ensure_resource(
    &mut self,
    addr: &AbsResource,
    provider: AbsProviderInstance,
  ) -> &mut ResourceState {
    self
      .module_mut(&addr.module)
      .resources
      .entry(addr.resource.to_string())
      .or_insert_with(|| ResourceState { addr: addr.clone(), provider, instances: BTreeMap::new() })
  }

  pub fn resource_instance(&self, addr: &AbsResourceInstance) -> Option<&InstanceState> {
    self.resource(&addr.abs_resource())?.instances.get(&addr.key)
  }

  pub fn resource_instance_mut(&mut self, addr: &AbsResourceInstance) -> Option<&mut InstanceState> {
    self
      .modules
      .get_mut(&addr.module.to_string())?
      .resources
      .get_mut(&addr.resource.to_string())?
      .instances
      .get_mut(&addr.key)
  }

  /// Every resource instance address present in state, in address order.
  pub fn all_resource_instances(&self) -> Vec<(AbsResourceInstance, &InstanceState)> {
    let mut out = Vec::new();
    for module in self.modules.values() {
      for resource in module.resources.values() {
        for (key, instance) in &resource.instances {
          out.push((resource.addr.instance(key.clone()), instance));
        }
      }
    }
    out.sort_by_key(|(addr, _)| addr.to_string());
    out
  }

  /// Drop resources with no remaining objects and modules with no remaining
  /// resources or outputs.
  pub fn prune(&mut self) {
    for module in self.modules.values_mut() {
      module.resources.retain(|_, resource| {
        resource.instances.retain(|_, instance| instance.has_objects());
        !resource.instances.is_empty()
      });
    }
    self
      .modules
      .retain(|_, module| !module.resources.is_empty() || !module.outputs.is_empty());
  }
}

#[cfg(test)]
mod tests {
  use caldera_addrs::Resource;
  use serde_json::json;

  use super::*;

  fn addr(name: &str) -> AbsResourceInstance {
    AbsResource { module: ModuleInstance::root(), resource: Resource::managed("test_thing", name) }
      .instance(InstanceKey::NoKey)
  }

  fn provider() -> AbsProviderInstance {
    AbsProviderInstance::default_for(ModuleInstance::root(), "test")
  }

  #[test]
  fn depose_moves_current_aside() {
    let mut instance = InstanceState {
      current: Some(ResourceInstanceObject::new(json!({"id": "a"}), 1)),
      deposed: BTreeMap::new(),
    };
    let key = instance.depose_current(None).unwrap();
    assert!(instance.current.is_none());
    assert_eq!(instance.deposed[&key].value, json!({"id": "a"}));

    // Nothing left to depose.
    assert!(instance.depose_current(None).is_none());
  }

  #[test]
  fn find_unused_deposed_key_avoids_existing() {
    let mut instance = InstanceState::default();
    for _ in 0..32 {
      let key = instance.find_unused_deposed_key();
      assert!(!instance.deposed.contains_key(&key));
      instance.deposed.insert(key, ResourceInstanceObject::new(json!({}), 0));
    }
  }

  #[test]
  fn prune_drops_empty_entries() {
    let mut state = State::new();
    let a = addr("web");
    state
      .ensure_resource(&a.abs_resource(), provider())
      .instances
      .insert(a.key.clone(), InstanceState::default());
    assert!(state.resource_instance(&a).is_some());
    state.prune();
    assert!(state.modules.is_empty());
  }

  #[test]
  fn state_round_trips_through_json() {
    let mut state = State::new();
    let a = addr("web");
    state.ensure_resource(&a.abs_resource(), provider()).instances.insert(
      a.key.clone(),
      InstanceState {
        current: Some(ResourceInstanceObject::new(json!({"id": "i-1"}), 2)),
        deposed: BTreeMap::new(),
      },
    );
    let encoded = serde_json::to_string(&state).unwrap();
    let decoded: State = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, state);
  }
}
