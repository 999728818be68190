use std::collections::BTreeMap;

use caldera_addrs::{ModulePath, Resource, ResourceMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One module's configuration. The root [`Config`] owns the whole tree;
/// nested modules are inlined on their [`ModuleCall`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub variables: BTreeMap<String, VariableConfig>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub providers: Vec<ProviderBlock>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub resources: Vec<ResourceConfig>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub outputs: BTreeMap<String, OutputConfig>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub module_calls: Vec<ModuleCall>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub removed: Vec<RemovedBlock>,
}

impl Config {
  /// The nested module configuration at `path`, if every step exists.
  pub fn descendant(&self, path: &ModulePath) -> Option<&Config> {
    let mut current = self;
    for step in path.steps() {
      current = &current.module_calls.iter().find(|c| c.name == *step)?.config;
    }
    Some(current)
  }

  pub fn module_call(&self, name: &str) -> Option<&ModuleCall> {
    self.module_calls.iter().find(|c| c.name == name)
  }

  pub fn resource(&self, resource: &Resource) -> Option<&ResourceConfig> {
    self
      .resources
      .iter()
      .find(|r| r.mode == resource.mode && r.type_name == resource.type_name && r.name == resource.name)
  }

  /// All static module paths in the tree, root first.
  pub fn all_module_paths(&self) -> Vec<ModulePath> {
    let mut out = Vec::new();
    fn walk(config: &Config, path: ModulePath, out: &mut Vec<ModulePath>) {
      out.push(path.clone());
      for call in &config.module_calls {
        walk(&call.config, path.child(call.name.clone()), out);
      }
    }
    walk(self, ModulePath::root(), &mut out);
    out
  }
}

/// An input variable declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub default: Option<Value>,
  #[serde(default)]
  pub sensitive: bool,
}

/// A provider configuration block. `alias` and `for_each` are expression
/// sources; a block may use at most one of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderBlock {
  pub provider_type: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub alias: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub for_each: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub config: BTreeMap<String, Value>,
}

/// How a resource selects its provider instance. Absent, the default
/// instance of the resource type's implied provider is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRef {
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub provider_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub alias: Option<String>,
  /// Expression selecting the provider's `for_each` key.
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub key: Option<String>,
}

/// When a provisioner runs relative to the instance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionWhen {
  #[default]
  Create,
  Destroy,
}

/// A provisioner attached to a resource block; `config` values may contain
/// templates, with `self` bound to the instance value being provisioned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
  pub name: String,
  #[serde(default)]
  pub when: ProvisionWhen,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub config: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
  #[serde(default)]
  pub create_before_destroy: bool,
  #[serde(default)]
  pub prevent_destroy: bool,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub ignore_changes: Vec<String>,
}

/// One resource block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
  #[serde(default)]
  pub mode: ResourceMode,
  pub type_name: String,
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub count: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub for_each: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub provider: Option<ProviderRef>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<String>,
  #[serde(default)]
  pub lifecycle: Lifecycle,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub provisioners: Vec<ProvisionerConfig>,
  /// The resource type this block was renamed from by a refactor. State
  /// found under the old type is moved through the provider before use.
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub moved_from: Option<String>,
  /// Attribute values; strings may contain `{{ ... }}` templates.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub config: BTreeMap<String, Value>,
}

impl ResourceConfig {
  pub fn resource(&self) -> Resource {
    Resource { mode: self.mode, type_name: self.type_name.clone(), name: self.name.clone() }
  }
}

/// An output declaration; `value` is a template source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
  pub value: String,
  #[serde(default)]
  pub sensitive: bool,
}

/// A call to a nested module, with its configuration inlined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleCall {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub count: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub for_each: Option<String>,
  /// Values for the child module's input variables; strings may contain
  /// templates evaluated in the calling module's scope.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub variables: BTreeMap<String, Value>,
  #[serde(default)]
  pub config: Config,
}

/// Records that a resource was removed from configuration and whether its
/// remaining state objects should be destroyed or merely forgotten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedBlock {
  /// Target address of the removed resource (or module).
  pub from: String,
  /// When false, orphaned objects are forgotten: removed from state without
  /// destroying the real-world object.
  #[serde(default = "default_true")]
  pub destroy: bool,
}

fn default_true() -> bool {
  true
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn minimal_config_parses() {
    let config: Config = serde_json::from_value(json!({
      "resources": [
        { "type_name": "test_thing", "name": "web", "config": { "name": "web-1" } }
      ]
    }))
    .unwrap();
    assert_eq!(config.resources.len(), 1);
    assert_eq!(config.resources[0].mode, ResourceMode::Managed);
    assert!(config.resources[0].lifecycle.ignore_changes.is_empty());
  }

  #[test]
  fn descendant_resolves_nested_modules() {
    let config: Config = serde_json::from_value(json!({
      "module_calls": [{
        "name": "net",
        "config": {
          "module_calls": [{ "name": "subnet", "config": {} }]
        }
      }]
    }))
    .unwrap();
    let path = ModulePath::root().child("net").child("subnet");
    assert!(config.descendant(&path).is_some());
    assert!(config.descendant(&ModulePath::root().child("missing")).is_none());
    assert_eq!(config.all_module_paths().len(), 3);
  }

  #[test]
  fn removed_block_defaults_to_destroy() {
    let block: RemovedBlock = serde_json::from_value(json!({ "from": "test_thing.old" })).unwrap();
    assert!(block.destroy);
  }
}
