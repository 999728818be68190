//! End-to-end plan/apply tests against the in-memory test provider.

use std::collections::BTreeMap;

use caldera_addrs::{
  AbsProviderInstance, AbsResource, DeposedKey, InstanceKey, ModuleInstance, Resource,
  ResourceMode,
};
use caldera_config::Config;
use caldera_engine::{Engine, EngineConfig, PlanOpts};
use caldera_plan::{Action, Plan, ResourceInstanceChange};
use caldera_provider::{
  Provider, ProviderFactories, Provisioner, ProvisionerFactories, SchemaCache, TestProvider,
  TestProvisioner,
};
use caldera_state::{InstanceState, ResourceInstanceObject, State};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn engine_for(provider: &TestProvider) -> Engine {
  engine_with_config(provider, EngineConfig::default())
}

fn engine_with_config(provider: &TestProvider, config: EngineConfig) -> Engine {
  let mut schemas = SchemaCache::default();
  schemas.insert("test", provider.schema());
  let mut factories = ProviderFactories::new();
  factories.insert("test".to_string(), provider.factory());
  Engine::new(config, factories, schemas)
}

fn engine_with_provisioner(provider: &TestProvider, provisioner: &TestProvisioner) -> Engine {
  let mut schemas = SchemaCache::default();
  schemas.insert("test", provider.schema());
  schemas.insert_provisioner("test-exec", provisioner.schema());
  let mut factories = ProviderFactories::new();
  factories.insert("test".to_string(), provider.factory());
  let mut provisioners = ProvisionerFactories::new();
  provisioners.insert("test-exec".to_string(), provisioner.factory());
  Engine::new(EngineConfig::default(), factories, schemas).with_provisioners(provisioners)
}

fn config_from(value: serde_json::Value) -> Config {
  serde_json::from_value(value).expect("invalid test config")
}

fn root_instance(type_name: &str, name: &str) -> caldera_addrs::AbsResourceInstance {
  AbsResource {
    module: ModuleInstance::root(),
    resource: Resource::managed(type_name, name),
  }
  .instance(InstanceKey::NoKey)
}

fn test_provider_instance() -> AbsProviderInstance {
  AbsProviderInstance::default_for(ModuleInstance::root(), "test")
}

fn state_with_object(name: &str, value: serde_json::Value, schema_version: u64) -> State {
  let mut state = State::new();
  let addr = root_instance("test_thing", name);
  state
    .ensure_resource(&addr.abs_resource(), test_provider_instance())
    .instances
    .insert(
      InstanceKey::NoKey,
      InstanceState {
        current: Some(ResourceInstanceObject::new(value, schema_version)),
        deposed: BTreeMap::new(),
      },
    );
  state
}

fn index_of(log: &[String], entry: &str) -> usize {
  log
    .iter()
    .position(|l| l == entry)
    .unwrap_or_else(|| panic!("log entry {:?} not found in {:?}", entry, log))
}

#[tokio::test]
async fn chain_is_created_in_dependency_order() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "a", "config": { "name": "a" } },
      { "type_name": "test_thing", "name": "b",
        "config": { "name": "{{ test_thing.a.name }}-b" } },
      { "type_name": "test_thing", "name": "c",
        "config": { "name": "{{ test_thing.b.name }}-c" } }
    ]
  }));

  let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  assert!(!diags.has_errors(), "plan diags: {:?}", diags);
  assert_eq!(plan.changes.len(), 3);
  assert!(plan.changes.iter().all(|c| c.action == Action::Create));
  // Rendered references flow through the planned values.
  let change_c = plan.change_for(&root_instance("test_thing", "c"), None).unwrap();
  assert_eq!(change_c.after.as_ref().unwrap()["name"], json!("a-b-c"));

  let (state, diags) = engine.apply(&config, &plan, &State::new(), BTreeMap::new()).await;
  assert!(!diags.has_errors(), "apply diags: {:?}", diags);

  let log = provider.take_log();
  let a = index_of(&log, "create:test_thing:a");
  let b = index_of(&log, "create:test_thing:a-b");
  let c = index_of(&log, "create:test_thing:a-b-c");
  assert!(a < b, "a must be created before b: {:?}", log);
  assert!(b < c, "b must be created before c: {:?}", log);

  assert_eq!(state.all_resource_instances().len(), 3);
  for (_, instance) in state.all_resource_instances() {
    let id = instance.current.as_ref().unwrap().value["id"].as_str().unwrap();
    assert!(id.starts_with("t-"));
  }
}

#[tokio::test]
async fn plan_is_no_op_after_apply() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "a", "config": { "name": "a" } }
    ]
  }));

  let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  let (state, _) = engine.apply(&config, &plan, &State::new(), BTreeMap::new()).await;

  let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  assert_eq!(plan.changes.len(), 1);
  assert_eq!(plan.changes[0].action, Action::NoOp);
}

#[tokio::test]
async fn replace_with_create_before_destroy() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config_v1 = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "web",
        "lifecycle": { "create_before_destroy": true },
        "config": { "name": "web", "location": "east" } }
    ]
  }));

  let (plan, _) = engine.plan(&config_v1, &State::new(), PlanOpts::default()).await;
  let (state, diags) = engine.apply(&config_v1, &plan, &State::new(), BTreeMap::new()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  // Changing a force-new attribute replaces; CBD reverses the ordering.
  let config_v2 = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "web",
        "lifecycle": { "create_before_destroy": true },
        "config": { "name": "web", "location": "west" } }
    ]
  }));
  let (plan, diags) = engine.plan(&config_v2, &state, PlanOpts::default()).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  assert_eq!(plan.changes.len(), 1);
  assert_eq!(plan.changes[0].action, Action::CreateThenDelete);

  provider.log_handle().lock().unwrap().clear();
  let (state, diags) = engine.apply(&config_v2, &plan, &state, BTreeMap::new()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let log = provider.take_log();
  let create = index_of(&log, "create:test_thing:web");
  let destroy = index_of(&log, "destroy:test_thing:web");
  assert!(create < destroy, "replacement must exist before the old object dies: {:?}", log);

  // The old object is gone: one current object, no deposed remnants.
  let instances = state.all_resource_instances();
  assert_eq!(instances.len(), 1);
  assert!(instances[0].1.deposed.is_empty());
  assert_eq!(instances[0].1.current.as_ref().unwrap().value["location"], json!("west"));
}

#[tokio::test]
async fn cbd_replace_threads_one_deposed_key_through_both_vertices() {
  let provider = TestProvider::new();
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "web",
        "lifecycle": { "create_before_destroy": true },
        "config": { "name": "web", "location": "west" } }
    ]
  }));
  let state = state_with_object("web", json!({"name": "web", "location": "east", "id": "t-0"}), 1);

  let plan = Plan {
    changes: vec![ResourceInstanceChange {
      addr: root_instance("test_thing", "web"),
      deposed: None,
      action: Action::CreateThenDelete,
      before: Some(json!({"name": "web", "location": "east", "id": "t-0"})),
      after: Some(json!({"name": "web", "location": "west", "id": null})),
      provider: test_provider_instance(),
    }],
    errored: false,
  };

  let mut schemas = SchemaCache::default();
  schemas.insert("test", provider.schema());
  let builder = caldera_engine::GraphBuilder {
    op: caldera_engine::WalkOperation::Apply,
    config: std::sync::Arc::new(config),
    state,
    schemas: std::sync::Arc::new(schemas),
    plan: Some(plan),
    targets: Vec::new(),
    excludes: Vec::new(),
  };
  let graph = builder.build().expect("apply graph must build");

  let mut apply_key = None;
  let mut destroy_key = None;
  for (_, node) in graph.nodes() {
    match node {
      caldera_engine::Node::ApplyInstance(n) => apply_key = n.preallocated_deposed.clone(),
      caldera_engine::Node::DestroyInstance(n) => destroy_key = n.deposed.clone(),
      _ => {}
    }
  }
  let apply_key = apply_key.expect("apply vertex must pre-allocate a deposed key");
  assert_eq!(Some(apply_key), destroy_key, "both replace vertices must agree on the key");
}

#[tokio::test]
async fn state_from_newer_provider_version_is_fatal() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "web", "config": { "name": "web" } }
    ]
  }));
  let state = state_with_object("web", json!({"name": "web", "id": "t-1"}), 6);

  let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
  assert!(plan.errored);
  assert!(
    diags.iter().any(|d| d.summary == "Resource instance managed by newer provider version"),
    "{:?}",
    diags
  );
  // The upgrade transform must never run for a newer recorded version.
  let log = provider.take_log();
  assert!(!log.iter().any(|l| l.starts_with("upgrade:")), "{:?}", log);
}

#[tokio::test]
async fn old_state_is_upgraded_before_use() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "web", "config": { "name": "old-name" } }
    ]
  }));
  // Schema version 0 used the attribute "nick" instead of "name".
  let state = state_with_object("web", json!({"nick": "old-name", "id": "t-1"}), 0);

  let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let log = provider.take_log();
  assert!(log.contains(&"upgrade:test_thing:0".to_string()), "{:?}", log);
  // After the rename upgrade the config matches and nothing changes.
  assert_eq!(plan.changes[0].action, Action::NoOp);
}

#[tokio::test]
async fn non_removal_change_for_deposed_object_is_a_bug() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({}));
  let state = state_with_object("web", json!({"name": "web", "id": "t-1"}), 1);

  let plan = Plan {
    changes: vec![ResourceInstanceChange {
      addr: root_instance("test_thing", "web"),
      deposed: Some(DeposedKey::parse("deadbeef").unwrap()),
      action: Action::Update,
      before: None,
      after: Some(json!({"name": "web"})),
      provider: test_provider_instance(),
    }],
    errored: false,
  };

  let (_, diags) = engine.apply(&config, &plan, &state, BTreeMap::new()).await;
  let diag = diags
    .iter()
    .find(|d| d.summary == "Invalid planned change for deposed object")
    .expect("must reject non-removal deposed change");
  assert!(diag.is_bug());
}

#[tokio::test]
async fn destroying_an_ephemeral_resource_is_a_bug() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({}));

  let addr = AbsResource {
    module: ModuleInstance::root(),
    resource: Resource {
      mode: ResourceMode::Ephemeral,
      type_name: "test_token".to_string(),
      name: "t".to_string(),
    },
  }
  .instance(InstanceKey::NoKey);

  let plan = Plan {
    changes: vec![ResourceInstanceChange {
      addr,
      deposed: None,
      action: Action::Delete,
      before: Some(json!({"name": "t"})),
      after: None,
      provider: test_provider_instance(),
    }],
    errored: false,
  };

  let (_, diags) = engine.apply(&config, &plan, &State::new(), BTreeMap::new()).await;
  let diag = diags
    .iter()
    .find(|d| d.summary == "An ephemeral resource planned for destroy")
    .expect("must reject ephemeral destroy");
  assert!(diag.is_bug());
}

#[tokio::test]
async fn orphans_are_destroyed_unless_a_removed_block_forgets_them() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);

  let mut state = State::new();
  for name in ["keepable", "forgettable"] {
    let addr = root_instance("test_thing", name);
    state.ensure_resource(&addr.abs_resource(), test_provider_instance()).instances.insert(
      InstanceKey::NoKey,
      InstanceState {
        current: Some(ResourceInstanceObject::new(
          json!({"name": name, "id": format!("t-{}", name)}),
          1,
        )),
        deposed: BTreeMap::new(),
      },
    );
  }

  let config = config_from(json!({
    "removed": [ { "from": "test_thing.forgettable", "destroy": false } ]
  }));

  let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  let actions: BTreeMap<String, Action> =
    plan.changes.iter().map(|c| (c.addr.to_string(), c.action)).collect();
  assert_eq!(actions["test_thing.keepable"], Action::Delete);
  assert_eq!(actions["test_thing.forgettable"], Action::Forget);

  provider.log_handle().lock().unwrap().clear();
  let (state, diags) = engine.apply(&config, &plan, &state, BTreeMap::new()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let log = provider.take_log();
  assert!(log.contains(&"destroy:test_thing:keepable".to_string()), "{:?}", log);
  assert!(!log.iter().any(|l| l.contains("forgettable")), "forget must not call the provider");
  assert!(state.all_resource_instances().is_empty());
}

#[tokio::test]
async fn a_panicking_vertex_does_not_take_down_the_walk() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "bad",
        "config": { "name": "bad", "boom": true } },
      { "type_name": "test_thing", "name": "good", "config": { "name": "good" } }
    ]
  }));

  let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  let panic_diag = diags
    .iter()
    .find(|d| d.summary == "Panic during graph walk")
    .expect("panic must surface as a diagnostic");
  assert!(panic_diag.is_bug());

  // The sibling subtree still planned.
  assert!(plan.change_for(&root_instance("test_thing", "good"), None).is_some());
  assert!(plan.change_for(&root_instance("test_thing", "bad"), None).is_none());
}

#[tokio::test]
async fn cancellation_stops_the_walk() {
  let provider = TestProvider::new();
  let cancel = CancellationToken::new();
  cancel.cancel();
  let engine = engine_with_config(&provider, EngineConfig { parallelism: 4, cancel });
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "a", "config": { "name": "a" } }
    ]
  }));

  let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  assert!(plan.errored);
  assert!(diags.iter().any(|d| d.summary == "Execution cancelled"), "{:?}", diags);
}

#[tokio::test]
async fn import_reads_the_remote_object_during_plan() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "web", "config": { "name": "i-123" } }
    ]
  }));

  let opts = PlanOpts {
    import_targets: BTreeMap::from([("test_thing.web".to_string(), "i-123".to_string())]),
    ..Default::default()
  };
  let (plan, diags) = engine.plan(&config, &State::new(), opts).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let log = provider.take_log();
  assert!(log.contains(&"import:test_thing:i-123".to_string()), "{:?}", log);
  // The imported object matches the configuration, so nothing changes.
  let change = plan.change_for(&root_instance("test_thing", "web"), None).unwrap();
  assert_eq!(change.action, Action::NoOp);
}

#[tokio::test]
async fn module_for_each_expands_per_instance_addresses() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "variables": {
      "regions": { "default": { "east": {}, "west": {} } }
    },
    "module_calls": [{
      "name": "net",
      "for_each": "{{ var.regions }}",
      "variables": { "region": "{{ each.key }}" },
      "config": {
        "variables": { "region": {} },
        "resources": [
          { "type_name": "test_thing", "name": "node",
            "config": { "name": "node-{{ var.region }}" } }
        ]
      }
    }]
  }));

  let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let addrs: Vec<String> = plan.changes.iter().map(|c| c.addr.to_string()).collect();
  assert_eq!(
    addrs,
    vec![
      "module.net[\"east\"].test_thing.node",
      "module.net[\"west\"].test_thing.node"
    ]
  );
  for change in &plan.changes {
    assert_eq!(change.action, Action::Create);
  }
  let east = &plan.changes[0];
  assert_eq!(east.after.as_ref().unwrap()["name"], json!("node-east"));
}

#[tokio::test]
async fn destroy_plan_reverses_the_destroy_order() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "base", "config": { "name": "base" } },
      { "type_name": "test_thing", "name": "leaf",
        "config": { "name": "{{ test_thing.base.name }}-leaf" } }
    ]
  }));

  let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  let (state, diags) = engine.apply(&config, &plan, &State::new(), BTreeMap::new()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let (plan, diags) =
    engine.plan(&config, &state, PlanOpts { destroy: true, ..Default::default() }).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  assert_eq!(plan.changes.len(), 2);
  assert!(plan.changes.iter().all(|c| c.action == Action::Delete));

  provider.log_handle().lock().unwrap().clear();
  let (state, diags) = engine.apply(&config, &plan, &state, BTreeMap::new()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let log = provider.take_log();
  let leaf = index_of(&log, "destroy:test_thing:base-leaf");
  let base = index_of(&log, "destroy:test_thing:base");
  assert!(leaf < base, "dependents must be destroyed before their dependencies: {:?}", log);
  assert!(state.all_resource_instances().is_empty());
}

#[tokio::test]
async fn creation_provisioners_run_after_create_and_close() {
  let provider = TestProvider::new();
  let provisioner = TestProvisioner::new();
  let engine = engine_with_provisioner(&provider, &provisioner);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "web",
        "provisioners": [
          { "name": "test-exec", "config": { "command": "bootstrap {{ self.id }}" } }
        ],
        "config": { "name": "web" } }
    ]
  }));

  let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  let (state, diags) = engine.apply(&config, &plan, &State::new(), BTreeMap::new()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let log = provisioner.take_log();
  assert_eq!(log.len(), 2, "{:?}", log);
  // The provisioner sees the created object, including its computed id.
  assert!(log[0].starts_with("provision:web:bootstrap t-"), "{:?}", log);
  assert_eq!(log[1], "close");

  let instances = state.all_resource_instances();
  assert_eq!(
    instances[0].1.current.as_ref().unwrap().status,
    caldera_state::ObjectStatus::Ready
  );
}

#[tokio::test]
async fn failed_provisioner_taints_the_new_object() {
  let provider = TestProvider::new();
  let provisioner = TestProvisioner::new();
  let engine = engine_with_provisioner(&provider, &provisioner);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "web",
        "provisioners": [
          { "name": "test-exec", "config": { "command": "boom", "fail": true } }
        ],
        "config": { "name": "web" } }
    ]
  }));

  let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  let (state, diags) = engine.apply(&config, &plan, &State::new(), BTreeMap::new()).await;
  assert!(diags.iter().any(|d| d.summary == "Provisioning failed"), "{:?}", diags);

  let instances = state.all_resource_instances();
  assert_eq!(
    instances[0].1.current.as_ref().unwrap().status,
    caldera_state::ObjectStatus::Tainted
  );

  // A tainted object plans as a replacement on the next run.
  let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  assert_eq!(plan.changes[0].action, Action::DeleteThenCreate);
}

#[tokio::test]
async fn outputs_are_recorded_in_state_during_apply() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "a", "config": { "name": "a" } }
    ],
    "outputs": {
      "web_name": { "value": "{{ test_thing.a.name }}" }
    }
  }));

  let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  let (state, diags) = engine.apply(&config, &plan, &State::new(), BTreeMap::new()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let outputs = &state.modules[""].outputs;
  assert_eq!(outputs["web_name"].value, json!("a"));
}
