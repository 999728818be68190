use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  AbsResource, AbsResourceInstance, InstanceKey, ModuleInstance, Resource, ResourceMode,
};

/// An address a user can pass to `--target` or `--exclude`.
///
/// Containment generalizes from instance to resource to module: a module
/// target contains every resource under it, a resource target contains each
/// of its instances, and an instance target contains only itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Targetable {
  Module(ModuleInstance),
  Resource(AbsResource),
  ResourceInstance(AbsResourceInstance),
}

impl Targetable {
  /// Whether this target contains `other`. Module steps without an instance
  /// key act as wildcards, so `module.a` contains resources in every
  /// instance of `module.a`.
  pub fn contains(&self, other: &Targetable) -> bool {
    match (self, other) {
      (Self::Module(m), Self::Module(o)) => m.contains_wildcard(o),
      (Self::Module(m), Self::Resource(r)) => m.contains_wildcard(&r.module),
      (Self::Module(m), Self::ResourceInstance(r)) => m.contains_wildcard(&r.module),
      (Self::Resource(a), Self::Resource(b)) => {
        a.resource == b.resource && module_matches(&a.module, &b.module)
      }
      (Self::Resource(a), Self::ResourceInstance(b)) => {
        a.resource == b.resource && module_matches(&a.module, &b.module)
      }
      (Self::ResourceInstance(a), Self::ResourceInstance(b)) => {
        a.resource == b.resource && a.key == b.key && module_matches(&a.module, &b.module)
      }
      _ => false,
    }
  }

  pub fn module_instance(&self) -> &ModuleInstance {
    match self {
      Self::Module(m) => m,
      Self::Resource(r) => &r.module,
      Self::ResourceInstance(r) => &r.module,
    }
  }
}

fn module_matches(pattern: &ModuleInstance, actual: &ModuleInstance) -> bool {
  pattern.steps().len() == actual.steps().len() && pattern.contains_wildcard(actual)
}

impl fmt::Display for Targetable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Module(m) => write!(f, "{}", m),
      Self::Resource(r) => write!(f, "{}", r),
      Self::ResourceInstance(r) => write!(f, "{}", r),
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetParseError {
  #[error("empty target address")]
  Empty,
  #[error("invalid target address {addr:?}: {problem}")]
  Invalid { addr: String, problem: String },
}

impl Targetable {
  /// Parse a target address in the canonical syntax, e.g.
  /// `test_thing.web`, `test_thing.web[0]`, `module.net["east"]`,
  /// `module.net.data.test_lookup.x`.
  pub fn parse(addr: &str) -> Result<Self, TargetParseError> {
    let invalid = |problem: &str| TargetParseError::Invalid {
      addr: addr.to_string(),
      problem: problem.to_string(),
    };

    if addr.trim().is_empty() {
      return Err(TargetParseError::Empty);
    }

    let segments = split_segments(addr).map_err(|p| invalid(&p))?;
    let mut segments = segments.into_iter().peekable();

    let mut module = ModuleInstance::root();
    while segments.peek().map(|s| s.name.as_str()) == Some("module") {
      let marker = segments.next().unwrap();
      if marker.key != InstanceKey::NoKey {
        return Err(invalid("the \"module\" keyword must not carry an index"));
      }
      let step = segments.next().ok_or_else(|| invalid("missing module name after \"module\""))?;
      module = module.child(step.name, step.key);
    }

    let Some(first) = segments.next() else {
      return Ok(Self::Module(module));
    };

    let (mode, type_seg) = match first.name.as_str() {
      "data" => {
        let seg = segments.next().ok_or_else(|| invalid("missing resource type after \"data\""))?;
        (ResourceMode::Data, seg)
      }
      "ephemeral" => {
        let seg =
          segments.next().ok_or_else(|| invalid("missing resource type after \"ephemeral\""))?;
        (ResourceMode::Ephemeral, seg)
      }
      _ => (ResourceMode::Managed, first),
    };
    if type_seg.key != InstanceKey::NoKey {
      return Err(invalid("resource type must not carry an index"));
    }

    let name_seg = segments.next().ok_or_else(|| invalid("missing resource name"))?;
    if segments.next().is_some() {
      return Err(invalid("unexpected trailing address segments"));
    }

    let resource = Resource { mode, type_name: type_seg.name, name: name_seg.name };
    let abs = AbsResource { module, resource };
    match name_seg.key {
      InstanceKey::NoKey => Ok(Self::Resource(abs)),
      key => Ok(Self::ResourceInstance(abs.instance(key))),
    }
  }
}

struct Segment {
  name: String,
  key: InstanceKey,
}

/// Split on `.` outside of brackets and quotes, then parse any `[...]` index
/// on each segment.
fn split_segments(addr: &str) -> Result<Vec<Segment>, String> {
  let mut raw = Vec::new();
  let mut current = String::new();
  let mut depth = 0usize;
  let mut in_string = false;
  let mut escaped = false;
  for c in addr.chars() {
    if in_string {
      current.push(c);
      if escaped {
        escaped = false;
      } else if c == '\\' {
        escaped = true;
      } else if c == '"' {
        in_string = false;
      }
      continue;
    }
    match c {
      '"' => {
        in_string = true;
        current.push(c);
      }
      '[' => {
        depth += 1;
        current.push(c);
      }
      ']' => {
        depth = depth.checked_sub(1).ok_or("unbalanced \"]\"")?;
        current.push(c);
      }
      '.' if depth == 0 => {
        raw.push(std::mem::take(&mut current));
      }
      _ => current.push(c),
    }
  }
  if in_string || depth != 0 {
    return Err("unbalanced brackets or quotes".to_string());
  }
  raw.push(current);

  raw
    .into_iter()
    .map(|seg| {
      if seg.is_empty() {
        return Err("empty address segment".to_string());
      }
      match seg.find('[') {
        None => Ok(Segment { name: seg, key: InstanceKey::NoKey }),
        Some(open) => {
          if !seg.ends_with(']') {
            return Err(format!("malformed index in segment {:?}", seg));
          }
          let name = seg[..open].to_string();
          let inner = &seg[open + 1..seg.len() - 1];
          let key = InstanceKey::parse_key_part(inner)?;
          if key == InstanceKey::NoKey {
            return Err(format!("empty index in segment {:?}", seg));
          }
          Ok(Segment { name, key })
        }
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(addr: &str) -> Targetable {
    Targetable::parse(addr).unwrap()
  }

  #[test]
  fn parse_round_trips() {
    for addr in [
      "test_thing.web",
      "test_thing.web[0]",
      "test_thing.web[\"blue\"]",
      "data.test_lookup.x",
      "ephemeral.test_token.t",
      "module.net[\"east\"]",
      "module.net.module.subnet[1]",
      "module.net[\"east\"].test_thing.web[2]",
    ] {
      assert_eq!(parse(addr).to_string(), addr, "round trip for {}", addr);
    }
  }

  #[test]
  fn parse_rejects_malformed() {
    assert!(Targetable::parse("").is_err());
    assert!(Targetable::parse("test_thing").is_err());
    assert!(Targetable::parse("test_thing.web.extra").is_err());
    assert!(Targetable::parse("test_thing.web[").is_err());
    assert!(Targetable::parse("module[0].a").is_err());
  }

  #[test]
  fn containment_generalizes() {
    let module = parse("module.net");
    let resource = parse("module.net[\"east\"].test_thing.web");
    let instance = parse("module.net[\"east\"].test_thing.web[0]");

    assert!(module.contains(&resource));
    assert!(module.contains(&instance));
    assert!(resource.contains(&instance));
    assert!(resource.contains(&resource));
    assert!(!instance.contains(&resource));
    assert!(instance.contains(&instance));

    let other = parse("module.net[\"east\"].test_thing.db");
    assert!(!resource.contains(&other));
  }

  #[test]
  fn unkeyed_resource_target_matches_any_module_key() {
    let unkeyed = parse("module.net.test_thing.web");
    let keyed = parse("module.net[\"east\"].test_thing.web[1]");
    assert!(unkeyed.contains(&keyed));

    let deeper = parse("module.net[\"east\"].module.subnet[0].test_thing.web[1]");
    assert!(!unkeyed.contains(&deeper));
  }
}
