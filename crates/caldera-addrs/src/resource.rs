use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{InstanceKey, ModuleInstance, ModulePath};

/// How a resource participates in the lifecycle.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMode {
  /// A real-world object created, updated and destroyed by a provider.
  #[default]
  Managed,
  /// Read-only: refreshed from the provider, never created or destroyed.
  Data,
  /// Only ever "opened" for the duration of a single run; never persisted.
  Ephemeral,
}

impl ResourceMode {
  /// Address prefix for the mode: empty for managed resources.
  pub fn prefix(&self) -> &'static str {
    match self {
      Self::Managed => "",
      Self::Data => "data.",
      Self::Ephemeral => "ephemeral.",
    }
  }
}

/// A resource block's name within one module: `<mode prefix><type>.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resource {
  pub mode: ResourceMode,
  pub type_name: String,
  pub name: String,
}

impl Resource {
  pub fn managed(type_name: impl Into<String>, name: impl Into<String>) -> Self {
    Self { mode: ResourceMode::Managed, type_name: type_name.into(), name: name.into() }
  }

  /// The provider type implied by the resource type: the prefix before the
  /// first underscore, or the whole type name if there is none.
  pub fn implied_provider(&self) -> &str {
    self.type_name.split('_').next().unwrap_or(&self.type_name)
  }
}

impl fmt::Display for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}.{}", self.mode.prefix(), self.type_name, self.name)
  }
}

/// A resource qualified by the static module path it was configured in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigResource {
  pub module: ModulePath,
  pub resource: Resource,
}

impl fmt::Display for ConfigResource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.module.is_root() {
      write!(f, "{}", self.resource)
    } else {
      write!(f, "{}.{}", self.module, self.resource)
    }
  }
}

/// A resource qualified by a concrete module instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsResource {
  pub module: ModuleInstance,
  pub resource: Resource,
}

impl AbsResource {
  pub fn config_resource(&self) -> ConfigResource {
    ConfigResource { module: self.module.module_path(), resource: self.resource.clone() }
  }

  pub fn instance(&self, key: InstanceKey) -> AbsResourceInstance {
    AbsResourceInstance {
      module: self.module.clone(),
      resource: self.resource.clone(),
      key,
    }
  }
}

impl fmt::Display for AbsResource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.module.is_root() {
      write!(f, "{}", self.resource)
    } else {
      write!(f, "{}.{}", self.module, self.resource)
    }
  }
}

/// One concrete instance of a resource, after `count`/`for_each` expansion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsResourceInstance {
  pub module: ModuleInstance,
  pub resource: Resource,
  pub key: InstanceKey,
}

impl AbsResourceInstance {
  pub fn abs_resource(&self) -> AbsResource {
    AbsResource { module: self.module.clone(), resource: self.resource.clone() }
  }

  pub fn config_resource(&self) -> ConfigResource {
    self.abs_resource().config_resource()
  }

  pub fn is_ephemeral(&self) -> bool {
    self.resource.mode == ResourceMode::Ephemeral
  }
}

impl fmt::Display for AbsResourceInstance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.module.is_root() {
      write!(f, "{}{}", self.resource, self.key.index_suffix())
    } else {
      write!(f, "{}.{}{}", self.module, self.resource, self.key.index_suffix())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_forms() {
    let res = Resource::managed("test_thing", "web");
    let abs = AbsResource { module: ModuleInstance::root(), resource: res.clone() };
    assert_eq!(abs.to_string(), "test_thing.web");
    assert_eq!(abs.instance(InstanceKey::Int(0)).to_string(), "test_thing.web[0]");

    let data = Resource { mode: ResourceMode::Data, type_name: "test_lookup".into(), name: "x".into() };
    assert_eq!(data.to_string(), "data.test_lookup.x");

    let eph =
      Resource { mode: ResourceMode::Ephemeral, type_name: "test_token".into(), name: "t".into() };
    let inst = AbsResource { module: ModuleInstance::root(), resource: eph }
      .instance(InstanceKey::NoKey);
    assert_eq!(inst.to_string(), "ephemeral.test_token.t");
    assert!(inst.is_ephemeral());
  }

  #[test]
  fn implied_provider() {
    assert_eq!(Resource::managed("aws_instance", "a").implied_provider(), "aws");
    assert_eq!(Resource::managed("random", "b").implied_provider(), "random");
  }
}
