use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use caldera_addrs::ResourceMode;
use serde_json::{Value, json};

use crate::{
  ApplyChangeRequest, ApplyChangeResponse, AttrSchema, PlanChangeRequest, PlanChangeResponse,
  Provider, ProviderError, ProviderFactory, ProviderSchema, ReadRequest, ReadResponse, Schema,
  UpgradeStateRequest, UpgradeStateResponse,
};

/// Deterministic in-memory provider for the built-in `test` provider type.
///
/// Every managed resource type shares one attribute set: `name` (required),
/// `location` (forces replacement), `tags` (optional) and `id` (computed).
/// The provider records each operation in a shared log so tests can assert
/// on execution order. Resource configs containing a truthy `boom` attribute
/// panic inside `plan_change`, which exercises the walker's panic recovery.
#[derive(Clone)]
pub struct TestProvider {
  managed_types: Vec<String>,
  log: Arc<Mutex<Vec<String>>>,
  configured: Arc<Mutex<Option<Value>>>,
}

/// Schema version served for every managed type.
const CURRENT_VERSION: u64 = 1;

impl TestProvider {
  pub fn new() -> Self {
    Self::with_managed_types(&["test_thing"])
  }

  pub fn with_managed_types(types: &[&str]) -> Self {
    Self {
      managed_types: types.iter().map(|t| t.to_string()).collect(),
      log: Arc::new(Mutex::new(Vec::new())),
      configured: Arc::new(Mutex::new(None)),
    }
  }

  /// Handle on the shared operation log. Clones of this provider (e.g. the
  /// instances a factory hands out) append to the same log.
  pub fn log_handle(&self) -> Arc<Mutex<Vec<String>>> {
    self.log.clone()
  }

  pub fn take_log(&self) -> Vec<String> {
    self.log.lock().unwrap().clone()
  }

  /// A factory producing instances that share this provider's log.
  pub fn factory(&self) -> ProviderFactory {
    let template = self.clone();
    Arc::new(move || Arc::new(template.clone()) as Arc<dyn Provider>)
  }

  fn record(&self, entry: String) {
    self.log.lock().unwrap().push(entry);
  }

  fn managed_schema() -> Schema {
    let mut attributes = BTreeMap::new();
    attributes.insert("name".to_string(), AttrSchema { required: true, ..Default::default() });
    attributes.insert("location".to_string(), AttrSchema { force_new: true, ..Default::default() });
    attributes.insert("tags".to_string(), AttrSchema::default());
    attributes.insert("boom".to_string(), AttrSchema::default());
    attributes.insert("id".to_string(), AttrSchema { computed: true, ..Default::default() });
    Schema { version: CURRENT_VERSION, attributes }
  }

  fn data_schema() -> Schema {
    let mut attributes = BTreeMap::new();
    attributes.insert("name".to_string(), AttrSchema { required: true, ..Default::default() });
    attributes.insert("value".to_string(), AttrSchema { computed: true, ..Default::default() });
    Schema { version: 0, attributes }
  }

  fn ephemeral_schema() -> Schema {
    let mut attributes = BTreeMap::new();
    attributes.insert("name".to_string(), AttrSchema { required: true, ..Default::default() });
    attributes.insert("token".to_string(), AttrSchema { computed: true, ..Default::default() });
    Schema { version: 0, attributes }
  }

  fn check_type(&self, mode: ResourceMode, type_name: &str) -> Result<(), ProviderError> {
    let known = match mode {
      ResourceMode::Managed => self.managed_types.iter().any(|t| t == type_name),
      ResourceMode::Data => type_name == "test_lookup",
      ResourceMode::Ephemeral => type_name == "test_token",
    };
    if known {
      Ok(())
    } else {
      Err(ProviderError::UnsupportedResourceType(type_name.to_string()))
    }
  }

  fn display_name(value: Option<&Value>) -> String {
    value
      .and_then(|v| v.get("name"))
      .and_then(|n| n.as_str())
      .unwrap_or("?")
      .to_string()
  }
}

impl Default for TestProvider {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Provider for TestProvider {
  fn schema(&self) -> ProviderSchema {
    let mut schema = ProviderSchema {
      provider: Schema {
        version: 0,
        attributes: BTreeMap::from([(
          "region".to_string(),
          AttrSchema { ..Default::default() },
        )]),
      },
      resource_types: BTreeMap::new(),
    };
    for type_name in &self.managed_types {
      schema = schema.with_resource_type(ResourceMode::Managed, type_name, Self::managed_schema());
    }
    schema
      .with_resource_type(ResourceMode::Data, "test_lookup", Self::data_schema())
      .with_resource_type(ResourceMode::Ephemeral, "test_token", Self::ephemeral_schema())
  }

  async fn configure(&self, config: Value) -> Result<(), ProviderError> {
    if config.get("fail").and_then(Value::as_bool) == Some(true) {
      return Err(ProviderError::InvalidConfig("configure failed as requested".to_string()));
    }
    self.record("configure".to_string());
    *self.configured.lock().unwrap() = Some(config);
    Ok(())
  }

  async fn read(&self, req: ReadRequest) -> Result<ReadResponse, ProviderError> {
    self.check_type(req.mode, &req.type_name)?;
    if let Some(id) = &req.import_id {
      self.record(format!("import:{}:{}", req.type_name, id));
      return Ok(ReadResponse {
        value: Some(json!({ "id": id, "name": id })),
      });
    }
    match req.mode {
      ResourceMode::Data => {
        let name = Self::display_name(req.prior.as_ref());
        self.record(format!("read-data:{}:{}", req.type_name, name));
        let mut value = req.prior.unwrap_or_else(|| json!({}));
        if let Some(obj) = value.as_object_mut() {
          obj.insert("value".to_string(), json!(format!("data-{}", name)));
        }
        Ok(ReadResponse { value: Some(value) })
      }
      ResourceMode::Ephemeral => {
        let name = Self::display_name(req.prior.as_ref());
        self.record(format!("open:{}:{}", req.type_name, name));
        let mut value = req.prior.unwrap_or_else(|| json!({}));
        if let Some(obj) = value.as_object_mut() {
          obj.insert("token".to_string(), json!(format!("token-{}", name)));
        }
        Ok(ReadResponse { value: Some(value) })
      }
      ResourceMode::Managed => {
        self.record(format!("read:{}:{}", req.type_name, Self::display_name(req.prior.as_ref())));
        Ok(ReadResponse { value: req.prior })
      }
    }
  }

  async fn plan_change(&self, req: PlanChangeRequest) -> Result<PlanChangeResponse, ProviderError> {
    self.check_type(req.mode, &req.type_name)?;
    let Some(config) = req.config else {
      return Ok(PlanChangeResponse { planned: None, requires_replace: Vec::new() });
    };

    if config.get("boom").and_then(Value::as_bool) == Some(true) {
      panic!("test provider asked to panic while planning {}", req.type_name);
    }

    let mut planned = config.clone();
    if let Some(obj) = planned.as_object_mut() {
      let prior_id = req.prior.as_ref().and_then(|p| p.get("id")).cloned();
      obj.insert("id".to_string(), prior_id.unwrap_or(Value::Null));
    }

    let mut requires_replace = Vec::new();
    if let Some(prior) = &req.prior {
      for attr in Self::managed_schema().force_new_attrs() {
        if prior.get(attr) != config.get(attr) && config.get(attr).is_some() {
          requires_replace.push(attr.to_string());
        }
      }
    }

    Ok(PlanChangeResponse { planned: Some(planned), requires_replace })
  }

  async fn apply_change(
    &self,
    req: ApplyChangeRequest,
  ) -> Result<ApplyChangeResponse, ProviderError> {
    self.check_type(req.mode, &req.type_name)?;
    match req.planned {
      None => {
        let name = Self::display_name(req.prior.as_ref());
        self.record(format!("destroy:{}:{}", req.type_name, name));
        Ok(ApplyChangeResponse { new_value: None })
      }
      Some(mut planned) => {
        let creating = req.prior.is_none();
        if let Some(obj) = planned.as_object_mut() {
          if obj.get("id").map(Value::is_null).unwrap_or(true) {
            let id = uuid::Uuid::new_v4().simple().to_string();
            obj.insert("id".to_string(), json!(format!("t-{}", &id[..8])));
          }
        }
        let name = Self::display_name(Some(&planned));
        if creating {
          self.record(format!("create:{}:{}", req.type_name, name));
        } else {
          self.record(format!("update:{}:{}", req.type_name, name));
        }
        Ok(ApplyChangeResponse { new_value: Some(planned) })
      }
    }
  }

  async fn upgrade_state(
    &self,
    req: UpgradeStateRequest,
  ) -> Result<UpgradeStateResponse, ProviderError> {
    if req.from_version > CURRENT_VERSION {
      return Err(ProviderError::UpgradeFailed {
        from: req.from_version,
        to: CURRENT_VERSION,
        reason: "state is newer than this provider".to_string(),
      });
    }
    self.record(format!("upgrade:{}:{}", req.type_name, req.from_version));
    let mut value = req.value;
    if req.from_version == 0 {
      // Version 0 called the display attribute "nick".
      if let Some(obj) = value.as_object_mut() {
        if let Some(nick) = obj.remove("nick") {
          obj.insert("name".to_string(), nick);
        }
      }
    }
    Ok(UpgradeStateResponse { value })
  }

  async fn move_state(
    &self,
    req: UpgradeStateRequest,
  ) -> Result<UpgradeStateResponse, ProviderError> {
    self.record(format!("move:{}:{}", req.prev_type_name, req.type_name));
    Ok(UpgradeStateResponse { value: req.value })
  }

  async fn validate_resource_config(
    &self,
    type_name: &str,
    mode: ResourceMode,
    config: &Value,
  ) -> Result<(), ProviderError> {
    self.check_type(mode, type_name)?;
    let schema = match mode {
      ResourceMode::Managed => Self::managed_schema(),
      ResourceMode::Data => Self::data_schema(),
      ResourceMode::Ephemeral => Self::ephemeral_schema(),
    };
    let problems = schema.conformance_problems(config);
    if problems.is_empty() {
      Ok(())
    } else {
      Err(ProviderError::InvalidConfig(problems.join("; ")))
    }
  }

  async fn close(&self) -> Result<(), ProviderError> {
    self.record("close".to_string());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn plan_flags_force_new_changes() {
    let provider = TestProvider::new();
    let resp = provider
      .plan_change(PlanChangeRequest {
        type_name: "test_thing".to_string(),
        mode: ResourceMode::Managed,
        prior: Some(json!({"name": "a", "location": "east", "id": "t-1"})),
        config: Some(json!({"name": "a", "location": "west"})),
      })
      .await
      .unwrap();
    assert_eq!(resp.requires_replace, vec!["location"]);
    // In-place updates keep the prior id.
    assert_eq!(resp.planned.unwrap()["id"], json!("t-1"));
  }

  #[tokio::test]
  async fn apply_fills_computed_id_on_create() {
    let provider = TestProvider::new();
    let resp = provider
      .apply_change(ApplyChangeRequest {
        type_name: "test_thing".to_string(),
        mode: ResourceMode::Managed,
        prior: None,
        planned: Some(json!({"name": "a", "id": null})),
      })
      .await
      .unwrap();
    let id = resp.new_value.unwrap()["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("t-"));
    assert_eq!(provider.take_log(), vec!["create:test_thing:a"]);
  }

  #[tokio::test]
  async fn upgrade_renames_legacy_attribute() {
    let provider = TestProvider::new();
    let resp = provider
      .upgrade_state(UpgradeStateRequest {
        type_name: "test_thing".to_string(),
        prev_type_name: "test_thing".to_string(),
        value: json!({"nick": "old", "id": "t-1"}),
        from_version: 0,
      })
      .await
      .unwrap();
    assert_eq!(resp.value, json!({"name": "old", "id": "t-1"}));
  }

  #[tokio::test]
  async fn factory_instances_share_the_log() {
    let provider = TestProvider::new();
    let factory = provider.factory();
    let instance = factory();
    instance.configure(json!({})).await.unwrap();
    assert_eq!(provider.take_log(), vec!["configure"]);
  }
}
