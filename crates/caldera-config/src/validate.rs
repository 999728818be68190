use std::collections::BTreeSet;

use caldera_diags::{Diagnostic, Diagnostics};

use crate::Config;

impl Config {
  /// Structural checks that need no expression evaluation: duplicate block
  /// names, impossible argument combinations, and unresolvable `depends_on`
  /// targets. Returns all problems found.
  pub fn check(&self) -> Diagnostics {
    let mut diags = Diagnostics::new();
    self.check_module(&mut diags, "");
    diags
  }

  fn check_module(&self, diags: &mut Diagnostics, path: &str) {
    let subject = |name: &str| {
      if path.is_empty() {
        name.to_string()
      } else {
        format!("{}.{}", path, name)
      }
    };

    let mut seen_resources = BTreeSet::new();
    for resource in &self.resources {
      let addr = resource.resource().to_string();
      if !seen_resources.insert(addr.clone()) {
        diags.push(
          Diagnostic::error(
            "Duplicate resource block",
            format!("A resource block named {} was already declared in this module.", addr),
          )
          .with_subject(subject(&addr)),
        );
      }
      if resource.count.is_some() && resource.for_each.is_some() {
        diags.push(
          Diagnostic::error(
            "Invalid combination of count and for_each",
            "A resource block may use count or for_each, but not both.",
          )
          .with_subject(subject(&addr)),
        );
      }
      for dep in &resource.depends_on {
        if caldera_addrs::Targetable::parse(dep).is_err() {
          diags.push(
            Diagnostic::error(
              "Invalid depends_on target",
              format!("The depends_on entry {:?} is not a valid resource address.", dep),
            )
            .with_subject(subject(&addr)),
          );
        }
      }
    }

    let mut seen_providers = BTreeSet::new();
    for provider in &self.providers {
      let key = (provider.provider_type.clone(), provider.alias.clone());
      if !seen_providers.insert(key) {
        diags.push(
          Diagnostic::error(
            "Duplicate provider block",
            format!(
              "A provider block for {} with the same alias was already declared in this module.",
              provider.provider_type
            ),
          )
          .with_subject(subject(&format!("provider.{}", provider.provider_type))),
        );
      }
      if provider.alias.is_some() && provider.for_each.is_some() {
        diags.push(
          Diagnostic::error(
            "Invalid provider block",
            "A provider block may use alias or for_each, but not both.",
          )
          .with_subject(subject(&format!("provider.{}", provider.provider_type))),
        );
      }
    }

    let mut seen_calls = BTreeSet::new();
    for call in &self.module_calls {
      if !seen_calls.insert(call.name.clone()) {
        diags.push(
          Diagnostic::error(
            "Duplicate module call",
            format!("A module call named {:?} was already declared in this module.", call.name),
          )
          .with_subject(subject(&format!("module.{}", call.name))),
        );
      }
      if call.count.is_some() && call.for_each.is_some() {
        diags.push(
          Diagnostic::error(
            "Invalid combination of count and for_each",
            "A module call may use count or for_each, but not both.",
          )
          .with_subject(subject(&format!("module.{}", call.name))),
        );
      }
      let child_path = subject(&format!("module.{}", call.name));
      call.config.check_module(diags, &child_path);
    }

    for removed in &self.removed {
      if caldera_addrs::Targetable::parse(&removed.from).is_err() {
        diags.push(Diagnostic::error(
          "Invalid removed block",
          format!("The removed block address {:?} is not a valid address.", removed.from),
        ));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn duplicate_resources_are_reported() {
    let config: Config = serde_json::from_value(json!({
      "resources": [
        { "type_name": "test_thing", "name": "web" },
        { "type_name": "test_thing", "name": "web" }
      ]
    }))
    .unwrap();
    let diags = config.check();
    assert!(diags.has_errors());
    assert!(diags.iter().any(|d| d.summary == "Duplicate resource block"));
  }

  #[test]
  fn count_and_for_each_conflict() {
    let config: Config = serde_json::from_value(json!({
      "resources": [
        { "type_name": "test_thing", "name": "web", "count": "2", "for_each": "var.names" }
      ]
    }))
    .unwrap();
    assert!(config.check().has_errors());
  }

  #[test]
  fn nested_module_problems_carry_path_subject() {
    let config: Config = serde_json::from_value(json!({
      "module_calls": [{
        "name": "net",
        "config": {
          "providers": [
            { "provider_type": "test", "alias": "a", "for_each": "var.regions" }
          ]
        }
      }]
    }))
    .unwrap();
    let diags = config.check();
    assert!(diags.has_errors());
    let diag = diags.iter().find(|d| d.summary == "Invalid provider block").unwrap();
    assert_eq!(diag.subject.as_deref(), Some("module.net.provider.test"));
  }

  #[test]
  fn clean_config_passes() {
    let config: Config = serde_json::from_value(json!({
      "resources": [
        { "type_name": "test_thing", "name": "web", "depends_on": ["test_thing.db"] },
        { "type_name": "test_thing", "name": "db" }
      ]
    }))
    .unwrap();
    assert!(!config.check().has_errors());
  }
}
