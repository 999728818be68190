use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The key distinguishing one instance of an expanded object from another.
///
/// `count` produces integer keys, `for_each` produces string keys, and an
/// unexpanded block has no key at all.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum InstanceKey {
  #[default]
  NoKey,
  Int(i64),
  Str(String),
}

impl InstanceKey {
  /// The bracketed index suffix used when rendering addresses: `[0]`,
  /// `["blue"]`, or nothing for [`InstanceKey::NoKey`].
  pub fn index_suffix(&self) -> String {
    match self {
      Self::NoKey => String::new(),
      Self::Int(n) => format!("[{}]", n),
      Self::Str(s) => format!("[{:?}]", s),
    }
  }

  /// A compact unambiguous form used as a map key in serialized state:
  /// empty string for no key, bare digits for integers, and a quoted string
  /// for `for_each` keys.
  pub fn key_part(&self) -> String {
    match self {
      Self::NoKey => String::new(),
      Self::Int(n) => n.to_string(),
      Self::Str(s) => format!("{:?}", s),
    }
  }

  pub fn parse_key_part(s: &str) -> Result<Self, String> {
    if s.is_empty() {
      return Ok(Self::NoKey);
    }
    if s.starts_with('"') {
      let inner: String =
        serde_json::from_str(s).map_err(|e| format!("invalid string instance key {}: {}", s, e))?;
      return Ok(Self::Str(inner));
    }
    s.parse::<i64>()
      .map(Self::Int)
      .map_err(|_| format!("invalid instance key {:?}", s))
  }
}

impl fmt::Display for InstanceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.index_suffix())
  }
}

impl Serialize for InstanceKey {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.key_part())
  }
}

impl<'de> Deserialize<'de> for InstanceKey {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Self::parse_key_part(&s).map_err(D::Error::custom)
  }
}

/// Identifies a deposed object: a resource instance's previous "current"
/// object retained while create-before-destroy keeps it alive pending its
/// replacement's creation.
///
/// Keys are 8 lowercase hex characters. Uniqueness is not a natural
/// consequence of the short keyspace, so callers must check generated keys
/// against the keys already in use (see `find_unused_deposed_key` in
/// caldera-state).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeposedKey(String);

impl DeposedKey {
  /// Generate a pseudo-random key.
  pub fn new_random() -> Self {
    let id = uuid::Uuid::new_v4().simple().to_string();
    Self(id[..8].to_string())
  }

  pub fn parse(s: &str) -> Result<Self, String> {
    if s.len() == 8 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
      Ok(Self(s.to_string()))
    } else {
      Err(format!("invalid deposed key {:?}: must be 8 lowercase hex characters", s))
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for DeposedKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn key_part_round_trips() {
    for key in [
      InstanceKey::NoKey,
      InstanceKey::Int(0),
      InstanceKey::Int(-3),
      InstanceKey::Str("blue".into()),
      InstanceKey::Str("odd \"name\"".into()),
    ] {
      let part = key.key_part();
      assert_eq!(InstanceKey::parse_key_part(&part).unwrap(), key);
    }
  }

  #[test]
  fn index_suffix_rendering() {
    assert_eq!(InstanceKey::NoKey.index_suffix(), "");
    assert_eq!(InstanceKey::Int(2).index_suffix(), "[2]");
    assert_eq!(InstanceKey::Str("a".into()).index_suffix(), "[\"a\"]");
  }

  #[test]
  fn deposed_keys_are_short_hex() {
    let key = DeposedKey::new_random();
    assert_eq!(key.as_str().len(), 8);
    assert!(DeposedKey::parse(key.as_str()).is_ok());
    assert!(DeposedKey::parse("XYZ").is_err());
    assert!(DeposedKey::parse("ABCDEF01").is_err());
  }
}
