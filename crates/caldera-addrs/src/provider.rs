use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{InstanceKey, ModuleInstance, ModulePath};

/// A provider configuration block's address: the module it is declared in,
/// the provider type, and the optional static alias.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsProviderConfig {
  pub module: ModulePath,
  pub provider_type: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub alias: Option<String>,
}

impl AbsProviderConfig {
  pub fn default_for(provider_type: impl Into<String>) -> Self {
    Self { module: ModulePath::root(), provider_type: provider_type.into(), alias: None }
  }
}

impl fmt::Display for AbsProviderConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.module.is_root() {
      write!(f, "{}.", self.module)?;
    }
    write!(f, "provider.{}", self.provider_type)?;
    if let Some(alias) = &self.alias {
      write!(f, ".{}", alias)?;
    }
    Ok(())
  }
}

/// One concrete provider instance: `(module instance, provider type, optional
/// alias, optional for_each key)`. Every resource instance is bound to exactly
/// one of these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsProviderInstance {
  pub module: ModuleInstance,
  pub provider_type: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub alias: Option<String>,
  #[serde(default)]
  pub key: InstanceKey,
}

impl AbsProviderInstance {
  /// The default (unaliased, unkeyed) instance of a provider type in a
  /// given module instance.
  pub fn default_for(module: ModuleInstance, provider_type: impl Into<String>) -> Self {
    Self { module, provider_type: provider_type.into(), alias: None, key: InstanceKey::NoKey }
  }

  /// The configuration block this instance came from.
  pub fn config_addr(&self) -> AbsProviderConfig {
    AbsProviderConfig {
      module: self.module.module_path(),
      provider_type: self.provider_type.clone(),
      alias: self.alias.clone(),
    }
  }
}

impl fmt::Display for AbsProviderInstance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.module.is_root() {
      write!(f, "{}.", self.module)?;
    }
    write!(f, "provider.{}", self.provider_type)?;
    if let Some(alias) = &self.alias {
      write!(f, ".{}", alias)?;
    }
    write!(f, "{}", self.key.index_suffix())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn provider_instance_display() {
    let default = AbsProviderInstance::default_for(ModuleInstance::root(), "test");
    assert_eq!(default.to_string(), "provider.test");

    let aliased = AbsProviderInstance {
      module: ModuleInstance::root(),
      provider_type: "test".into(),
      alias: Some("west".into()),
      key: InstanceKey::Str("a".into()),
    };
    assert_eq!(aliased.to_string(), "provider.test.west[\"a\"]");
    assert_eq!(aliased.config_addr().to_string(), "provider.test.west");
  }
}
