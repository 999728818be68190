//! Targeting, excluding and validation behavior.

use std::collections::BTreeSet;

use caldera_addrs::Targetable;
use caldera_config::Config;
use caldera_engine::{Engine, EngineConfig, PlanOpts};
use caldera_plan::Plan;
use caldera_provider::{Provider, ProviderFactories, SchemaCache, TestProvider};
use caldera_state::State;
use serde_json::json;

fn engine_for(provider: &TestProvider) -> Engine {
  let mut schemas = SchemaCache::default();
  schemas.insert("test", provider.schema());
  let mut factories = ProviderFactories::new();
  factories.insert("test".to_string(), provider.factory());
  Engine::new(EngineConfig::default(), factories, schemas)
}

fn config_from(value: serde_json::Value) -> Config {
  serde_json::from_value(value).expect("invalid test config")
}

fn planned_addrs(plan: &Plan) -> BTreeSet<String> {
  plan.changes.iter().map(|c| c.addr.to_string()).collect()
}

fn targets(addrs: &[&str]) -> Vec<Targetable> {
  addrs.iter().map(|a| Targetable::parse(a).unwrap()).collect()
}

/// A vpc with two instances and a load balancer hanging off one of them.
fn vpc_config() -> Config {
  config_from(json!({
    "resources": [
      { "type_name": "test_vpc", "name": "metoo", "config": { "name": "vpc-abc123" } },
      { "type_name": "test_instance", "name": "notme",
        "config": { "name": "i-bcd345", "tags": "{{ test_vpc.metoo.name }}" } },
      { "type_name": "test_instance", "name": "me",
        "config": { "name": "i-abc123", "tags": "{{ test_vpc.metoo.name }}" } },
      { "type_name": "test_elb", "name": "meneither",
        "config": { "name": "lb-1", "tags": "{{ test_instance.me.name }}" } }
    ]
  }))
}

fn vpc_provider() -> TestProvider {
  TestProvider::with_managed_types(&["test_vpc", "test_instance", "test_elb"])
}

#[tokio::test]
async fn excluding_an_instance_drops_its_dependents() {
  let provider = vpc_provider();
  let engine = engine_for(&provider);

  let opts = PlanOpts { excludes: targets(&["test_instance.me"]), ..Default::default() };
  let (plan, diags) = engine.plan(&vpc_config(), &State::new(), opts).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  // The excluded instance goes, and so does the load balancer that depends
  // on it; the vpc and the other instance survive.
  assert_eq!(
    planned_addrs(&plan),
    BTreeSet::from(["test_vpc.metoo".to_string(), "test_instance.notme".to_string()])
  );
}

#[tokio::test]
async fn targeting_retains_dependencies() {
  let provider = vpc_provider();
  let engine = engine_for(&provider);

  let opts = PlanOpts { targets: targets(&["test_elb.meneither"]), ..Default::default() };
  let (plan, diags) = engine.plan(&vpc_config(), &State::new(), opts).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  // The target plus its whole dependency chain, but not the unrelated
  // instance.
  assert_eq!(
    planned_addrs(&plan),
    BTreeSet::from([
      "test_vpc.metoo".to_string(),
      "test_instance.me".to_string(),
      "test_elb.meneither".to_string(),
    ])
  );
}

#[tokio::test]
async fn targeting_everything_changes_nothing() {
  let provider = vpc_provider();
  let engine = engine_for(&provider);

  let (baseline, diags) = engine.plan(&vpc_config(), &State::new(), PlanOpts::default()).await;
  assert!(!diags.has_errors(), "{:?}", diags);

  let opts = PlanOpts {
    targets: targets(&[
      "test_vpc.metoo",
      "test_instance.notme",
      "test_instance.me",
      "test_elb.meneither",
    ]),
    ..Default::default()
  };
  let (full, diags) = engine.plan(&vpc_config(), &State::new(), opts).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  assert_eq!(planned_addrs(&full), planned_addrs(&baseline));

  let opts = PlanOpts { excludes: Vec::new(), ..Default::default() };
  let (unexcluded, diags) = engine.plan(&vpc_config(), &State::new(), opts).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  assert_eq!(planned_addrs(&unexcluded), planned_addrs(&baseline));
}

#[tokio::test]
async fn targets_and_excludes_are_mutually_exclusive() {
  let provider = vpc_provider();
  let engine = engine_for(&provider);

  let opts = PlanOpts {
    targets: targets(&["test_vpc.metoo"]),
    excludes: targets(&["test_instance.me"]),
    ..Default::default()
  };
  let (plan, diags) = engine.plan(&vpc_config(), &State::new(), opts).await;
  assert!(plan.errored);
  assert!(diags.iter().any(|d| d.summary == "Invalid combination of arguments"));
}

#[tokio::test]
async fn outputs_survive_only_with_their_full_dependency_set() {
  let provider = vpc_provider();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_vpc", "name": "metoo", "config": { "name": "vpc-abc123" } },
      { "type_name": "test_instance", "name": "me",
        "config": { "name": "i-abc123", "tags": "{{ test_vpc.metoo.name }}" } }
    ],
    "outputs": {
      "vpc_name": { "value": "{{ test_vpc.metoo.name }}" },
      "instance_name": { "value": "{{ test_instance.me.name }}" }
    }
  }));

  // Excluding the instance keeps the vpc output but drops the instance
  // output; planning still succeeds.
  let opts = PlanOpts { excludes: targets(&["test_instance.me"]), ..Default::default() };
  let (plan, diags) = engine.plan(&config, &State::new(), opts).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  assert_eq!(planned_addrs(&plan), BTreeSet::from(["test_vpc.metoo".to_string()]));
}

#[tokio::test]
async fn duplicate_provider_instances_are_reported() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "variables": { "a": { "default": "west" } },
    "providers": [
      { "provider_type": "test", "alias": "{{ \"west\" }}" },
      { "provider_type": "test", "alias": "{{ var.a }}" }
    ],
    "resources": [
      { "type_name": "test_thing", "name": "x", "config": { "name": "x" } }
    ]
  }));

  let (_, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  let diag = diags
    .iter()
    .find(|d| d.summary == "Duplicate provider instance")
    .expect("duplicate alias must be detected");
  assert!(diag.detail.contains("provider.test.west"));
}

#[tokio::test]
async fn sensitive_alias_expressions_are_rejected() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "variables": { "secret": { "default": "hush", "sensitive": true } },
    "providers": [
      { "provider_type": "test", "alias": "{{ var.secret }}" }
    ],
    "resources": [
      { "type_name": "test_thing", "name": "x", "config": { "name": "x" } }
    ]
  }));

  let (_, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
  let diag = diags
    .iter()
    .find(|d| d.summary == "Invalid provider alias expression")
    .expect("sensitive alias must be rejected");
  assert!(diag.detail.contains("sensitive"));
}

#[tokio::test]
async fn validate_reports_provider_side_config_problems() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  // "name" is required by the test provider's schema but missing here.
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "x", "config": { "tags": "t" } }
    ]
  }));

  let diags = engine.validate(&config).await;
  assert!(diags.has_errors());
  assert!(
    diags.iter().any(|d| d.summary == "Invalid resource configuration" && d.detail.contains("name")),
    "{:?}",
    diags
  );
}

#[tokio::test]
async fn validate_accepts_a_clean_config() {
  let provider = TestProvider::new();
  let engine = engine_for(&provider);
  let config = config_from(json!({
    "resources": [
      { "type_name": "test_thing", "name": "x", "config": { "name": "x" } }
    ]
  }));

  let diags = engine.validate(&config).await;
  assert!(!diags.has_errors(), "{:?}", diags);
}
