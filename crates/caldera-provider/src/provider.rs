use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use caldera_addrs::ResourceMode;
use serde_json::Value;
use thiserror::Error;

use crate::ProviderSchema;

#[derive(Debug, Error)]
pub enum ProviderError {
  #[error("resource type {0} is not supported by this provider")]
  UnsupportedResourceType(String),
  #[error("invalid configuration: {0}")]
  InvalidConfig(String),
  #[error("cannot upgrade state from schema version {from} to {to}: {reason}")]
  UpgradeFailed { from: u64, to: u64, reason: String },
  #[error("{0}")]
  Operation(String),
}

/// Refresh an object (or import one by id when `import_id` is set).
#[derive(Debug, Clone)]
pub struct ReadRequest {
  pub type_name: String,
  pub mode: ResourceMode,
  /// The prior object value, absent when importing.
  pub prior: Option<Value>,
  pub import_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReadResponse {
  /// The refreshed value, or `None` when the object no longer exists.
  pub value: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct PlanChangeRequest {
  pub type_name: String,
  pub mode: ResourceMode,
  pub prior: Option<Value>,
  /// The desired configuration value; `None` plans a destroy.
  pub config: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct PlanChangeResponse {
  /// The planned new value; `None` when planning a destroy.
  pub planned: Option<Value>,
  /// Attribute names whose change cannot be applied in place.
  pub requires_replace: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApplyChangeRequest {
  pub type_name: String,
  pub mode: ResourceMode,
  pub prior: Option<Value>,
  /// The planned value to realize; `None` destroys the object.
  pub planned: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ApplyChangeResponse {
  /// The final value, or `None` after a destroy.
  pub new_value: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct UpgradeStateRequest {
  pub type_name: String,
  /// For a move, the type the state was recorded under.
  pub prev_type_name: String,
  pub value: Value,
  pub from_version: u64,
}

#[derive(Debug, Clone)]
pub struct UpgradeStateResponse {
  pub value: Value,
}

/// A live provider instance.
///
/// Calls are async because the real implementations talk to out-of-process
/// plugins; the engine routes every call through its walk-wide concurrency
/// limiter. A provider must tolerate `close` being the last call and nothing
/// arriving afterwards.
#[async_trait]
pub trait Provider: Send + Sync {
  fn schema(&self) -> ProviderSchema;

  async fn configure(&self, config: Value) -> Result<(), ProviderError>;

  async fn read(&self, req: ReadRequest) -> Result<ReadResponse, ProviderError>;

  async fn plan_change(&self, req: PlanChangeRequest) -> Result<PlanChangeResponse, ProviderError>;

  async fn apply_change(
    &self,
    req: ApplyChangeRequest,
  ) -> Result<ApplyChangeResponse, ProviderError>;

  /// Rewrite an object recorded at an older schema version into the current
  /// version. Never called when the recorded version is newer than current;
  /// the engine rejects that case before reaching the provider.
  async fn upgrade_state(
    &self,
    req: UpgradeStateRequest,
  ) -> Result<UpgradeStateResponse, ProviderError>;

  /// Rewrite an object recorded under a renamed resource type.
  async fn move_state(
    &self,
    req: UpgradeStateRequest,
  ) -> Result<UpgradeStateResponse, ProviderError>;

  async fn validate_resource_config(
    &self,
    type_name: &str,
    mode: ResourceMode,
    config: &Value,
  ) -> Result<(), ProviderError>;

  async fn close(&self) -> Result<(), ProviderError>;
}

/// Constructs a fresh provider instance for one provider type.
pub type ProviderFactory = Arc<dyn Fn() -> Arc<dyn Provider> + Send + Sync>;

/// Registry of factories keyed by provider type name.
pub type ProviderFactories = BTreeMap<String, ProviderFactory>;
