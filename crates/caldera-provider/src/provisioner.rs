use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::Schema;

#[derive(Debug, Error)]
pub enum ProvisionerError {
  #[error("invalid provisioner configuration: {0}")]
  InvalidConfig(String),
  #[error("provisioning failed: {0}")]
  Failed(String),
}

/// One provisioning request: the rendered provisioner configuration plus the
/// value of the instance being provisioned (exposed to templates as `self`).
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
  pub config: Value,
  pub instance_value: Value,
}

/// A live provisioner instance. Like providers, provisioners are
/// out-of-process collaborators in the full system; the engine caches one
/// instance per provisioner type and closes it after its last possible user.
#[async_trait]
pub trait Provisioner: Send + Sync {
  fn schema(&self) -> Schema;

  async fn provision(&self, req: ProvisionRequest) -> Result<(), ProvisionerError>;

  async fn close(&self) -> Result<(), ProvisionerError>;
}

pub type ProvisionerFactory = Arc<dyn Fn() -> Arc<dyn Provisioner> + Send + Sync>;

/// Registry of provisioner factories keyed by provisioner type name.
pub type ProvisionerFactories = BTreeMap<String, ProvisionerFactory>;

/// In-memory provisioner used by the CLI's built-in `test-exec` provisioner
/// and the engine tests. Records each run in a shared log; a config carrying
/// a truthy `fail` attribute makes the run fail.
#[derive(Clone, Default)]
pub struct TestProvisioner {
  log: Arc<Mutex<Vec<String>>>,
}

impl TestProvisioner {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn take_log(&self) -> Vec<String> {
    self.log.lock().unwrap().clone()
  }

  pub fn factory(&self) -> ProvisionerFactory {
    let template = self.clone();
    Arc::new(move || Arc::new(template.clone()) as Arc<dyn Provisioner>)
  }
}

#[async_trait]
impl Provisioner for TestProvisioner {
  fn schema(&self) -> Schema {
    let mut attributes = BTreeMap::new();
    attributes.insert(
      "command".to_string(),
      crate::AttrSchema { required: true, ..Default::default() },
    );
    attributes.insert("fail".to_string(), crate::AttrSchema::default());
    Schema { version: 0, attributes }
  }

  async fn provision(&self, req: ProvisionRequest) -> Result<(), ProvisionerError> {
    if req.config.get("fail").and_then(Value::as_bool) == Some(true) {
      return Err(ProvisionerError::Failed("provisioner asked to fail".to_string()));
    }
    let command = req
      .config
      .get("command")
      .and_then(Value::as_str)
      .ok_or_else(|| ProvisionerError::InvalidConfig("missing command".to_string()))?;
    let target = req
      .instance_value
      .get("name")
      .and_then(Value::as_str)
      .unwrap_or("?");
    self.log.lock().unwrap().push(format!("provision:{}:{}", target, command));
    Ok(())
  }

  async fn close(&self) -> Result<(), ProvisionerError> {
    self.log.lock().unwrap().push("close".to_string());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[tokio::test]
  async fn provision_records_the_run() {
    let provisioner = TestProvisioner::new();
    provisioner
      .provision(ProvisionRequest {
        config: json!({"command": "echo hi"}),
        instance_value: json!({"name": "web"}),
      })
      .await
      .unwrap();
    assert_eq!(provisioner.take_log(), vec!["provision:web:echo hi"]);
  }

  #[tokio::test]
  async fn provision_can_fail_on_request() {
    let provisioner = TestProvisioner::new();
    let err = provisioner
      .provision(ProvisionRequest {
        config: json!({"command": "echo", "fail": true}),
        instance_value: json!({}),
      })
      .await
      .unwrap_err();
    assert!(matches!(err, ProvisionerError::Failed(_)));
  }
}
