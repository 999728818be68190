use std::sync::{Arc, RwLock};

use caldera_addrs::{AbsResourceInstance, DeposedKey};

use crate::{Plan, ResourceInstanceChange};

/// Concurrency-safe handle to the plan being built by a graph walk.
///
/// Multiple vertices record changes for disjoint addresses concurrently;
/// recording a change for an address that already has one replaces it, since
/// a later decision for the same object supersedes the earlier one.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
  inner: Arc<RwLock<Plan>>,
}

impl SyncPlan {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_plan(plan: Plan) -> Self {
    Self { inner: Arc::new(RwLock::new(plan)) }
  }

  pub fn record_change(&self, change: ResourceInstanceChange) {
    let mut plan = self.inner.write().unwrap();
    plan
      .changes
      .retain(|c| !(c.addr == change.addr && c.deposed == change.deposed));
    plan.changes.push(change);
  }

  pub fn change_for(
    &self,
    addr: &AbsResourceInstance,
    deposed: Option<&DeposedKey>,
  ) -> Option<ResourceInstanceChange> {
    self.inner.read().unwrap().change_for(addr, deposed).cloned()
  }

  pub fn set_errored(&self) {
    self.inner.write().unwrap().errored = true;
  }

  /// Copy the plan out, with changes in a stable address order.
  pub fn snapshot(&self) -> Plan {
    let mut plan = self.inner.read().unwrap().clone();
    plan
      .changes
      .sort_by(|a, b| (a.addr.to_string(), &a.deposed).cmp(&(b.addr.to_string(), &b.deposed)));
    plan
  }
}

#[cfg(test)]
mod tests {
  use caldera_addrs::{AbsProviderInstance, AbsResource, InstanceKey, ModuleInstance, Resource};

  use super::*;
  use crate::Action;

  fn change(name: &str, action: Action) -> ResourceInstanceChange {
    let addr = AbsResource {
      module: ModuleInstance::root(),
      resource: Resource::managed("test_thing", name),
    }
    .instance(InstanceKey::NoKey);
    ResourceInstanceChange {
      addr,
      deposed: None,
      action,
      before: None,
      after: None,
      provider: AbsProviderInstance::default_for(ModuleInstance::root(), "test"),
    }
  }

  #[test]
  fn recording_same_address_replaces() {
    let plan = SyncPlan::new();
    plan.record_change(change("web", Action::Create));
    plan.record_change(change("web", Action::Update));
    let snapshot = plan.snapshot();
    assert_eq!(snapshot.changes.len(), 1);
    assert_eq!(snapshot.changes[0].action, Action::Update);
  }

  #[test]
  fn snapshot_is_sorted_by_address() {
    let plan = SyncPlan::new();
    plan.record_change(change("zebra", Action::Create));
    plan.record_change(change("ant", Action::Create));
    let names: Vec<String> =
      plan.snapshot().changes.iter().map(|c| c.addr.resource.name.clone()).collect();
    assert_eq!(names, vec!["ant", "zebra"]);
  }
}
