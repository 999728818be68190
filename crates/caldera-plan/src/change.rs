use std::fmt;

use caldera_addrs::{AbsProviderInstance, AbsResourceInstance, DeposedKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The lifecycle action decided for one resource instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
  NoOp,
  Create,
  Update,
  Delete,
  /// Replace with the default ordering: destroy the old object first.
  DeleteThenCreate,
  /// Replace under `create_before_destroy`: the old object is deposed and
  /// destroyed only after its replacement exists.
  CreateThenDelete,
  /// Remove from state without destroying the real-world object.
  Forget,
  /// Open an ephemeral resource for the duration of the run.
  Open,
}

impl Action {
  pub fn is_replace(self) -> bool {
    matches!(self, Self::DeleteThenCreate | Self::CreateThenDelete)
  }

  /// Whether applying this action destroys a real-world object.
  pub fn destroys(self) -> bool {
    matches!(self, Self::Delete | Self::DeleteThenCreate | Self::CreateThenDelete)
  }

  /// Whether applying this action creates or updates an object.
  pub fn creates_or_updates(self) -> bool {
    matches!(
      self,
      Self::Create | Self::Update | Self::DeleteThenCreate | Self::CreateThenDelete
    )
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::NoOp => "no-op",
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
      Self::DeleteThenCreate => "replace (delete then create)",
      Self::CreateThenDelete => "replace (create then delete)",
      Self::Forget => "forget",
      Self::Open => "open",
    };
    f.write_str(name)
  }
}

/// One planned change for a resource instance, or for one of its deposed
/// objects when `deposed` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceChange {
  pub addr: AbsResourceInstance,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub deposed: Option<DeposedKey>,
  pub action: Action,
  /// Object value before the change, if the object existed.
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub before: Option<Value>,
  /// Planned object value after the change, if one will exist.
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub after: Option<Value>,
  /// The provider instance that planned this change and must apply it.
  pub provider: AbsProviderInstance,
}

/// The complete set of changes produced by one plan operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
  pub changes: Vec<ResourceInstanceChange>,
  /// Set when the producing walk reported errors; an errored plan must not
  /// be applied.
  #[serde(default)]
  pub errored: bool,
}

impl Plan {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn change_for(
    &self,
    addr: &AbsResourceInstance,
    deposed: Option<&DeposedKey>,
  ) -> Option<&ResourceInstanceChange> {
    self
      .changes
      .iter()
      .find(|c| c.addr == *addr && c.deposed.as_ref() == deposed)
  }

  /// All changes for the given instance address, current object first.
  pub fn changes_for_addr(&self, addr: &AbsResourceInstance) -> Vec<&ResourceInstanceChange> {
    let mut changes: Vec<&ResourceInstanceChange> =
      self.changes.iter().filter(|c| c.addr == *addr).collect();
    changes.sort_by_key(|c| c.deposed.clone());
    changes
  }

  pub fn is_empty(&self) -> bool {
    self.changes.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use caldera_addrs::{InstanceKey, ModuleInstance, Resource};

  use super::*;

  fn change(action: Action, deposed: Option<DeposedKey>) -> ResourceInstanceChange {
    let addr = caldera_addrs::AbsResource {
      module: ModuleInstance::root(),
      resource: Resource::managed("test_thing", "web"),
    }
    .instance(InstanceKey::NoKey);
    ResourceInstanceChange {
      addr,
      deposed,
      action,
      before: None,
      after: None,
      provider: AbsProviderInstance::default_for(ModuleInstance::root(), "test"),
    }
  }

  #[test]
  fn action_classification() {
    assert!(Action::CreateThenDelete.is_replace());
    assert!(Action::CreateThenDelete.destroys());
    assert!(Action::CreateThenDelete.creates_or_updates());
    assert!(!Action::Forget.destroys());
    assert!(!Action::Open.creates_or_updates());
  }

  #[test]
  fn change_lookup_distinguishes_deposed() {
    let key = DeposedKey::parse("deadbeef").unwrap();
    let plan = Plan {
      changes: vec![change(Action::Update, None), change(Action::Delete, Some(key.clone()))],
      errored: false,
    };
    let addr = plan.changes[0].addr.clone();
    assert_eq!(plan.change_for(&addr, None).map(|c| c.action), Some(Action::Update));
    assert_eq!(plan.change_for(&addr, Some(&key)).map(|c| c.action), Some(Action::Delete));
    assert_eq!(plan.changes_for_addr(&addr).len(), 2);
  }
}
