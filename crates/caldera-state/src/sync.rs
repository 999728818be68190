use std::sync::{Arc, RwLock};

use caldera_addrs::{
  AbsProviderInstance, AbsResourceInstance, DeposedKey, ModuleInstance,
};
use thiserror::Error;

use crate::{InstanceState, OutputValue, ResourceInstanceObject, State};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
  /// A forced deposed key collided with one already recorded. The diff
  /// transformer pre-allocates keys from a snapshot of state, so a collision
  /// here means some other path allocated the same key mid-walk.
  #[error("deposed key {key} for {addr} is already in use")]
  DeposedKeyInUse { addr: String, key: DeposedKey },
}

/// Concurrency-safe handle to the state mutated during a graph walk.
///
/// Each walk gets its own wrapper around a deep copy of the input state, so
/// the caller's state is never mutated in place. All mutation goes through
/// these methods; the lock is never exposed.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
  inner: Arc<RwLock<State>>,
}

impl SyncState {
  pub fn new(state: State) -> Self {
    Self { inner: Arc::new(RwLock::new(state)) }
  }

  /// The object for the given generation: current when `deposed` is `None`,
  /// otherwise the deposed object under that key.
  pub fn resource_instance_object(
    &self,
    addr: &AbsResourceInstance,
    deposed: Option<&DeposedKey>,
  ) -> Option<ResourceInstanceObject> {
    let state = self.inner.read().unwrap();
    let instance = state.resource_instance(addr)?;
    match deposed {
      None => instance.current.clone(),
      Some(key) => instance.deposed.get(key).cloned(),
    }
  }

  /// The provider recorded for a resource, used to destroy or refresh
  /// objects whose configuration block no longer exists.
  pub fn resource_provider(&self, addr: &AbsResourceInstance) -> Option<AbsProviderInstance> {
    let state = self.inner.read().unwrap();
    state.resource(&addr.abs_resource()).map(|r| r.provider.clone())
  }

  /// Write (or with `None`, remove) the current object for an instance.
  pub fn set_resource_instance_current(
    &self,
    addr: &AbsResourceInstance,
    object: Option<ResourceInstanceObject>,
    provider: AbsProviderInstance,
  ) {
    let mut state = self.inner.write().unwrap();
    let resource = state.ensure_resource(&addr.abs_resource(), provider);
    let instance = resource.instances.entry(addr.key.clone()).or_default();
    instance.current = object;
    if !instance.has_objects() {
      resource.instances.remove(&addr.key);
    }
  }

  /// Depose the current object. When `force_key` is given it must be unused;
  /// the pre-allocating caller worked from a state snapshot, so a collision
  /// is reported as an error rather than silently overwriting.
  pub fn depose_resource_instance(
    &self,
    addr: &AbsResourceInstance,
    force_key: Option<DeposedKey>,
  ) -> Result<Option<DeposedKey>, StateError> {
    let mut state = self.inner.write().unwrap();
    let Some(instance) = state.resource_instance_mut(addr) else {
      return Ok(None);
    };
    if let Some(key) = &force_key {
      if instance.deposed.contains_key(key) {
        return Err(StateError::DeposedKeyInUse { addr: addr.to_string(), key: key.clone() });
      }
    }
    Ok(instance.depose_current(force_key))
  }

  pub fn remove_resource_instance_deposed(&self, addr: &AbsResourceInstance, key: &DeposedKey) {
    let mut state = self.inner.write().unwrap();
    if let Some(instance) = state.resource_instance_mut(addr) {
      instance.deposed.remove(key);
    }
  }

  /// Remove an instance's current object from state without touching the
  /// real-world object.
  pub fn forget_resource_instance(&self, addr: &AbsResourceInstance) {
    let mut state = self.inner.write().unwrap();
    if let Some(instance) = state.resource_instance_mut(addr) {
      instance.current = None;
    }
  }

  pub fn find_unused_deposed_key(&self, addr: &AbsResourceInstance) -> DeposedKey {
    let state = self.inner.read().unwrap();
    match state.resource_instance(addr) {
      Some(instance) => instance.find_unused_deposed_key(),
      None => DeposedKey::new_random(),
    }
  }

  pub fn set_output(&self, module: &ModuleInstance, name: &str, value: OutputValue) {
    let mut state = self.inner.write().unwrap();
    state.module_mut(module).outputs.insert(name.to_string(), value);
  }

  pub fn module_outputs(&self, module: &ModuleInstance) -> std::collections::BTreeMap<String, OutputValue> {
    let state = self.inner.read().unwrap();
    state.module(module).map(|m| m.outputs.clone()).unwrap_or_default()
  }

  pub fn instance_state(&self, addr: &AbsResourceInstance) -> Option<InstanceState> {
    self.inner.read().unwrap().resource_instance(addr).cloned()
  }

  /// The instance keys currently recorded for a resource.
  pub fn resource_instance_keys(
    &self,
    addr: &caldera_addrs::AbsResource,
  ) -> Vec<caldera_addrs::InstanceKey> {
    let state = self.inner.read().unwrap();
    state
      .resource(addr)
      .map(|r| r.instances.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Copy the state out, pruned of empty entries.
  pub fn snapshot(&self) -> State {
    let mut state = self.inner.read().unwrap().clone();
    state.prune();
    state
  }
}

#[cfg(test)]
mod tests {
  use caldera_addrs::{AbsResource, InstanceKey, Resource};
  use serde_json::json;

  use super::*;

  fn addr() -> AbsResourceInstance {
    AbsResource {
      module: ModuleInstance::root(),
      resource: Resource::managed("test_thing", "web"),
    }
    .instance(InstanceKey::NoKey)
  }

  fn provider() -> AbsProviderInstance {
    AbsProviderInstance::default_for(ModuleInstance::root(), "test")
  }

  #[test]
  fn set_and_read_current() {
    let sync = SyncState::new(State::new());
    let a = addr();
    sync.set_resource_instance_current(
      &a,
      Some(ResourceInstanceObject::new(json!({"id": "i-1"}), 1)),
      provider(),
    );
    let object = sync.resource_instance_object(&a, None).unwrap();
    assert_eq!(object.value, json!({"id": "i-1"}));
    assert_eq!(sync.resource_provider(&a), Some(provider()));
  }

  #[test]
  fn forced_deposed_key_collision_is_an_error() {
    let sync = SyncState::new(State::new());
    let a = addr();
    sync.set_resource_instance_current(
      &a,
      Some(ResourceInstanceObject::new(json!({"id": "old"}), 1)),
      provider(),
    );
    let key = sync.depose_resource_instance(&a, None).unwrap().unwrap();

    sync.set_resource_instance_current(
      &a,
      Some(ResourceInstanceObject::new(json!({"id": "new"}), 1)),
      provider(),
    );
    let err = sync.depose_resource_instance(&a, Some(key.clone())).unwrap_err();
    assert_eq!(err, StateError::DeposedKeyInUse { addr: a.to_string(), key });
  }

  #[test]
  fn forget_leaves_deposed_objects() {
    let sync = SyncState::new(State::new());
    let a = addr();
    sync.set_resource_instance_current(
      &a,
      Some(ResourceInstanceObject::new(json!({"id": "old"}), 1)),
      provider(),
    );
    let key = sync.depose_resource_instance(&a, None).unwrap().unwrap();
    sync.set_resource_instance_current(
      &a,
      Some(ResourceInstanceObject::new(json!({"id": "new"}), 1)),
      provider(),
    );

    sync.forget_resource_instance(&a);
    assert!(sync.resource_instance_object(&a, None).is_none());
    assert!(sync.resource_instance_object(&a, Some(&key)).is_some());

    sync.remove_resource_instance_deposed(&a, &key);
    assert!(sync.snapshot().modules.is_empty());
  }
}
