use std::collections::BTreeMap;

use caldera_addrs::ResourceMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema of one attribute within a resource or provider block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrSchema {
  #[serde(default)]
  pub required: bool,
  /// Set by the provider; absent from configuration.
  #[serde(default)]
  pub computed: bool,
  #[serde(default)]
  pub sensitive: bool,
  /// A change to this attribute cannot be applied in place and forces the
  /// object to be replaced.
  #[serde(default)]
  pub force_new: bool,
}

/// Schema of one object type: its version plus per-attribute flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
  #[serde(default)]
  pub version: u64,
  #[serde(default)]
  pub attributes: BTreeMap<String, AttrSchema>,
}

impl Schema {
  /// Check a value against the schema: it must be an object, carry every
  /// required attribute, and carry no attribute the schema doesn't know.
  /// Returns the list of problems.
  pub fn conformance_problems(&self, value: &Value) -> Vec<String> {
    let mut problems = Vec::new();
    let Some(object) = value.as_object() else {
      return vec!["value is not an object".to_string()];
    };
    for (name, attr) in &self.attributes {
      if attr.required && !object.contains_key(name) {
        problems.push(format!("required attribute {:?} is missing", name));
      }
    }
    for name in object.keys() {
      if !self.attributes.contains_key(name) {
        problems.push(format!("unsupported attribute {:?}", name));
      }
    }
    problems
  }

  pub fn conforms(&self, value: &Value) -> bool {
    self.conformance_problems(value).is_empty()
  }

  /// Attributes whose change forces replacement.
  pub fn force_new_attrs(&self) -> impl Iterator<Item = &str> {
    self.attributes.iter().filter(|(_, a)| a.force_new).map(|(n, _)| n.as_str())
  }
}

/// All schemas one provider type serves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSchema {
  #[serde(default)]
  pub provider: Schema,
  /// Resource type schemas keyed by mode and type name.
  #[serde(default)]
  pub resource_types: BTreeMap<ResourceMode, BTreeMap<String, Schema>>,
}

impl ProviderSchema {
  pub fn resource_type(&self, mode: ResourceMode, type_name: &str) -> Option<&Schema> {
    self.resource_types.get(&mode)?.get(type_name)
  }

  pub fn with_resource_type(
    mut self,
    mode: ResourceMode,
    type_name: impl Into<String>,
    schema: Schema,
  ) -> Self {
    self.resource_types.entry(mode).or_default().insert(type_name.into(), schema);
    self
  }
}

/// Pre-loaded schema lookup consulted by the schema-attach transformer.
///
/// The cache never triggers schema loading itself: it must be fully
/// populated before graph construction begins.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
  providers: BTreeMap<String, ProviderSchema>,
  provisioners: BTreeMap<String, Schema>,
}

impl SchemaCache {
  pub fn new(providers: BTreeMap<String, ProviderSchema>) -> Self {
    Self { providers, provisioners: BTreeMap::new() }
  }

  pub fn insert(&mut self, provider_type: impl Into<String>, schema: ProviderSchema) {
    self.providers.insert(provider_type.into(), schema);
  }

  pub fn insert_provisioner(&mut self, name: impl Into<String>, schema: Schema) {
    self.provisioners.insert(name.into(), schema);
  }

  pub fn provisioner_schema(&self, name: &str) -> Option<&Schema> {
    self.provisioners.get(name)
  }

  pub fn provider_config_schema(&self, provider_type: &str) -> Option<&Schema> {
    self.providers.get(provider_type).map(|p| &p.provider)
  }

  pub fn resource_type_schema(
    &self,
    provider_type: &str,
    mode: ResourceMode,
    type_name: &str,
  ) -> Option<&Schema> {
    self.providers.get(provider_type)?.resource_type(mode, type_name)
  }

  pub fn has_provider(&self, provider_type: &str) -> bool {
    self.providers.contains_key(provider_type)
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn schema() -> Schema {
    let mut attributes = BTreeMap::new();
    attributes.insert("name".to_string(), AttrSchema { required: true, ..Default::default() });
    attributes.insert("id".to_string(), AttrSchema { computed: true, ..Default::default() });
    attributes
      .insert("location".to_string(), AttrSchema { force_new: true, ..Default::default() });
    Schema { version: 1, attributes }
  }

  #[test]
  fn conformance_checks_required_and_unknown() {
    let schema = schema();
    assert!(schema.conforms(&json!({"name": "a", "id": "x"})));
    assert!(!schema.conforms(&json!({"id": "x"})));
    assert!(!schema.conforms(&json!({"name": "a", "bogus": 1})));
    assert!(!schema.conforms(&json!("not an object")));
  }

  #[test]
  fn force_new_attrs_listed() {
    let schema = schema();
    let force_new: Vec<&str> = schema.force_new_attrs().collect();
    assert_eq!(force_new, vec!["location"]);
  }

  #[test]
  fn cache_lookup_by_mode_and_type() {
    let provider =
      ProviderSchema::default().with_resource_type(ResourceMode::Managed, "test_thing", schema());
    let mut cache = SchemaCache::default();
    cache.insert("test", provider);
    assert!(cache.resource_type_schema("test", ResourceMode::Managed, "test_thing").is_some());
    assert!(cache.resource_type_schema("test", ResourceMode::Data, "test_thing").is_none());
    assert!(cache.resource_type_schema("other", ResourceMode::Managed, "test_thing").is_none());
  }
}
