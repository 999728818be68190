use std::fmt;

use serde::{Deserialize, Serialize};

use crate::InstanceKey;

/// A static module path: the sequence of module call names leading from the
/// root module to a nested module, with no instance keys. The root module is
/// the empty path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModulePath(Vec<String>);

impl ModulePath {
  pub fn root() -> Self {
    Self::default()
  }

  pub fn is_root(&self) -> bool {
    self.0.is_empty()
  }

  pub fn child(&self, name: impl Into<String>) -> Self {
    let mut steps = self.0.clone();
    steps.push(name.into());
    Self(steps)
  }

  pub fn parent(&self) -> Option<Self> {
    if self.is_root() {
      return None;
    }
    Some(Self(self.0[..self.0.len() - 1].to_vec()))
  }

  pub fn steps(&self) -> &[String] {
    &self.0
  }
}

impl fmt::Display for ModulePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for step in &self.0 {
      if !first {
        f.write_str(".")?;
      }
      write!(f, "module.{}", step)?;
      first = false;
    }
    Ok(())
  }
}

/// One step of a [`ModuleInstance`] path: a module call name plus the
/// instance key of that call.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleInstanceStep {
  pub name: String,
  pub key: InstanceKey,
}

/// A concrete instance of a module: a static module path where every step
/// also carries the instance key selected by the call's `count`/`for_each`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleInstance(Vec<ModuleInstanceStep>);

impl ModuleInstance {
  pub fn root() -> Self {
    Self::default()
  }

  pub fn is_root(&self) -> bool {
    self.0.is_empty()
  }

  pub fn child(&self, name: impl Into<String>, key: InstanceKey) -> Self {
    let mut steps = self.0.clone();
    steps.push(ModuleInstanceStep { name: name.into(), key });
    Self(steps)
  }

  pub fn steps(&self) -> &[ModuleInstanceStep] {
    &self.0
  }

  /// The static module path of this instance, discarding instance keys.
  pub fn module_path(&self) -> ModulePath {
    let mut path = ModulePath::root();
    for step in &self.0 {
      path = path.child(step.name.clone());
    }
    path
  }

  /// Whether `other` is this instance or is nested somewhere inside it.
  pub fn contains(&self, other: &ModuleInstance) -> bool {
    other.0.len() >= self.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
  }

  /// Like [`ModuleInstance::contains`], but a step with [`InstanceKey::NoKey`]
  /// on the receiver matches any key on the corresponding step of `other`.
  /// This is the matching rule for user-written targets: `module.a` addresses
  /// every instance of `module.a`.
  pub fn contains_wildcard(&self, other: &ModuleInstance) -> bool {
    other.0.len() >= self.0.len()
      && self.0.iter().zip(other.0.iter()).all(|(a, b)| {
        a.name == b.name && (a.key == InstanceKey::NoKey || a.key == b.key)
      })
  }
}

impl fmt::Display for ModuleInstance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for step in &self.0 {
      if !first {
        f.write_str(".")?;
      }
      write!(f, "module.{}{}", step.name, step.key.index_suffix())?;
      first = false;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn module_instance_display() {
    let mi = ModuleInstance::root()
      .child("net", InstanceKey::Str("east".into()))
      .child("subnet", InstanceKey::Int(1));
    assert_eq!(mi.to_string(), "module.net[\"east\"].module.subnet[1]");
    assert_eq!(mi.module_path().to_string(), "module.net.module.subnet");
  }

  #[test]
  fn containment() {
    let parent = ModuleInstance::root().child("net", InstanceKey::Str("east".into()));
    let nested = parent.child("subnet", InstanceKey::Int(0));
    assert!(parent.contains(&nested));
    assert!(!nested.contains(&parent));
    assert!(ModuleInstance::root().contains(&parent));

    let unkeyed = ModuleInstance::root().child("net", InstanceKey::NoKey);
    assert!(!unkeyed.contains(&nested));
    assert!(unkeyed.contains_wildcard(&nested));
  }
}
