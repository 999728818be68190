//! Expression and template evaluation.
//!
//! Configuration expressions (`count`, `for_each`, `alias`, attribute
//! values) are minijinja sources evaluated against a [`Scope`]. The engine
//! only calls the narrow helpers here; it implements no expression language
//! of its own. A string that is exactly one `{{ ... }}` block evaluates as a
//! typed expression; any other string renders as text.

use std::collections::{BTreeMap, BTreeSet};

use caldera_addrs::{InstanceKey, Resource, ResourceMode};
use caldera_diags::{Diagnostic, Diagnostics};
use minijinja::Environment;
use serde_json::{Value, json};

/// A reference found in an expression source, module-local.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ref {
  /// `var.<name>`
  Variable(String),
  /// `<type>.<name>`, `data.<type>.<name>` or `ephemeral.<type>.<name>`
  Resource(Resource),
  /// `module.<name>`: the call and the called module's outputs.
  Module(String),
  /// Internal ordering reference to the module call itself.
  ModuleCall(String),
}

/// Scan an expression source for references.
///
/// This is a lexical scan over dotted identifier chains, not a parse: it is
/// used to build dependency edges and to decide sensitivity, both of which
/// tolerate over-approximation. A managed resource reference is only
/// recognized when its type name contains an underscore, which keeps
/// template filters and locals out of the result.
pub fn refs_in(source: &str) -> Vec<Ref> {
  let mut refs = BTreeSet::new();
  for chain in ident_chains(source) {
    let parts: Vec<&str> = chain.split('.').collect();
    match parts.as_slice() {
      ["var", name, ..] => {
        refs.insert(Ref::Variable((*name).to_string()));
      }
      ["module", name, ..] => {
        refs.insert(Ref::Module((*name).to_string()));
      }
      ["data", type_name, name, ..] => {
        refs.insert(Ref::Resource(Resource {
          mode: ResourceMode::Data,
          type_name: (*type_name).to_string(),
          name: (*name).to_string(),
        }));
      }
      ["ephemeral", type_name, name, ..] => {
        refs.insert(Ref::Resource(Resource {
          mode: ResourceMode::Ephemeral,
          type_name: (*type_name).to_string(),
          name: (*name).to_string(),
        }));
      }
      ["each" | "count", ..] => {}
      [type_name, name, ..] if type_name.contains('_') => {
        refs.insert(Ref::Resource(Resource {
          mode: ResourceMode::Managed,
          type_name: (*type_name).to_string(),
          name: (*name).to_string(),
        }));
      }
      _ => {}
    }
  }
  refs.into_iter().collect()
}

fn ident_chains(source: &str) -> Vec<String> {
  let mut chains = Vec::new();
  let mut current = String::new();
  let mut chars = source.chars().peekable();
  while let Some(c) = chars.next() {
    if c.is_ascii_alphabetic() || c == '_' {
      current.push(c);
      while let Some(&next) = chars.peek() {
        if next.is_ascii_alphanumeric() || next == '_' {
          current.push(next);
          chars.next();
        } else if next == '.' {
          // Continue the chain only if another identifier follows the dot.
          let mut lookahead = chars.clone();
          lookahead.next();
          match lookahead.peek() {
            Some(c2) if c2.is_ascii_alphabetic() || *c2 == '_' => {
              current.push('.');
              chars.next();
            }
            _ => break,
          }
        } else {
          break;
        }
      }
      chains.push(std::mem::take(&mut current));
    }
  }
  chains
}

/// The values an expression can see: module variables, the current
/// repetition (`each.key`/`each.value`/`count.index`), and resolved upstream
/// values (resources, module outputs) keyed the way references are written.
#[derive(Debug, Clone, Default)]
pub struct Scope {
  pub vars: BTreeMap<String, Value>,
  pub sensitive_vars: BTreeSet<String>,
  pub each: Option<(InstanceKey, Value)>,
  pub extra: serde_json::Map<String, Value>,
}

impl Scope {
  fn context_value(&self) -> Value {
    let mut ctx = serde_json::Map::new();
    ctx.insert("var".to_string(), Value::Object(self.vars.clone().into_iter().collect()));
    if let Some((key, value)) = &self.each {
      match key {
        InstanceKey::Int(n) => {
          ctx.insert("count".to_string(), json!({ "index": n }));
        }
        InstanceKey::Str(s) => {
          ctx.insert("each".to_string(), json!({ "key": s, "value": value }));
        }
        InstanceKey::NoKey => {}
      }
    }
    for (k, v) in &self.extra {
      ctx.insert(k.clone(), v.clone());
    }
    Value::Object(ctx)
  }

  /// Whether any variable referenced by `source` is declared sensitive.
  pub fn references_sensitive(&self, source: &str) -> bool {
    refs_in(source).iter().any(|r| match r {
      Ref::Variable(name) => self.sensitive_vars.contains(name),
      _ => false,
    })
  }
}

/// Evaluate one source string. A bare `{{ expr }}` yields the expression's
/// typed value; anything else renders to a string.
pub fn eval_source(source: &str, scope: &Scope) -> Result<Value, minijinja::Error> {
  let env = Environment::new();
  let ctx = minijinja::Value::from_serialize(&scope.context_value());
  let trimmed = source.trim();
  if let Some(inner) = single_expression(trimmed) {
    let expr = env.compile_expression(inner)?;
    let value = expr.eval(&ctx)?;
    if value.is_undefined() {
      return Ok(Value::Null);
    }
    return Ok(serde_json::to_value(&value).unwrap_or(Value::Null));
  }
  env.render_str(source, &ctx).map(Value::String)
}

fn single_expression(source: &str) -> Option<&str> {
  let inner = source.strip_prefix("{{")?.strip_suffix("}}")?;
  if inner.contains("{{") || inner.contains("}}") {
    return None;
  }
  Some(inner.trim())
}

/// Recursively evaluate the template strings inside a configuration value.
pub fn eval_config_value(value: &Value, scope: &Scope) -> Result<Value, minijinja::Error> {
  match value {
    Value::String(s) if s.contains("{{") => eval_source(s, scope),
    Value::Array(items) => items
      .iter()
      .map(|v| eval_config_value(v, scope))
      .collect::<Result<Vec<_>, _>>()
      .map(Value::Array),
    Value::Object(map) => map
      .iter()
      .map(|(k, v)| Ok((k.clone(), eval_config_value(v, scope)?)))
      .collect::<Result<serde_json::Map<_, _>, _>>()
      .map(Value::Object),
    other => Ok(other.clone()),
  }
}

/// Whether every variable reference in the source can actually be resolved
/// in the scope; the lexical scanner decides what counts as a reference.
fn unknown_vars(source: &str, scope: &Scope) -> Vec<String> {
  refs_in(source)
    .into_iter()
    .filter_map(|r| match r {
      Ref::Variable(name) if !scope.vars.contains_key(&name) => Some(name),
      _ => None,
    })
    .collect()
}

/// Evaluate a `count` expression: a known, non-negative integer.
pub fn eval_count(source: &str, scope: &Scope, subject: &str) -> Result<u64, Diagnostics> {
  let unknown = unknown_vars(source, scope);
  if !unknown.is_empty() {
    return Err(
      Diagnostic::error(
        "Invalid count argument",
        format!(
          "The count value depends on {} which is not known at this point.",
          unknown.join(", ")
        ),
      )
      .with_subject(subject)
      .into(),
    );
  }
  let value = eval_source(source, scope).map_err(|e| {
    Diagnostics::from(
      Diagnostic::error("Invalid count argument", e.to_string()).with_subject(subject),
    )
  })?;
  // A bare literal like "3" renders as a string; accept it as a number too.
  let parsed = value.as_i64().or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()));
  match parsed {
    Some(n) if n >= 0 => Ok(n as u64),
    Some(n) => Err(
      Diagnostic::error(
        "Invalid count argument",
        format!("The count value must not be negative, but was {}.", n),
      )
      .with_subject(subject)
      .into(),
    ),
    None => Err(
      Diagnostic::error(
        "Invalid count argument",
        format!("The count expression must yield a whole number, not {}.", value),
      )
      .with_subject(subject)
      .into(),
    ),
  }
}

/// Evaluate a `for_each` expression into an ordered key/value map. An object
/// maps directly; a list of strings maps each element to itself.
pub fn eval_for_each(
  source: &str,
  scope: &Scope,
  subject: &str,
) -> Result<BTreeMap<String, Value>, Diagnostics> {
  let unknown = unknown_vars(source, scope);
  if !unknown.is_empty() {
    return Err(
      Diagnostic::error(
        "Invalid for_each argument",
        format!(
          "The for_each value depends on {} which is not known at this point.",
          unknown.join(", ")
        ),
      )
      .with_subject(subject)
      .into(),
    );
  }
  let value = eval_source(source, scope).map_err(|e| {
    Diagnostics::from(
      Diagnostic::error("Invalid for_each argument", e.to_string()).with_subject(subject),
    )
  })?;
  match value {
    Value::Object(map) => Ok(map.into_iter().collect()),
    Value::Array(items) => {
      let mut out = BTreeMap::new();
      for item in items {
        let Value::String(s) = item else {
          return Err(
            Diagnostic::error(
              "Invalid for_each argument",
              "A for_each list must contain only strings.",
            )
            .with_subject(subject)
            .into(),
          );
        };
        if out.insert(s.clone(), Value::String(s.clone())).is_some() {
          return Err(
            Diagnostic::error(
              "Invalid for_each argument",
              format!("The for_each list contains the key {:?} more than once.", s),
            )
            .with_subject(subject)
            .into(),
          );
        }
      }
      Ok(out)
    }
    Value::Null => Err(
      Diagnostic::error("Invalid for_each argument", "The for_each value must not be null.")
        .with_subject(subject)
        .into(),
    ),
    other => Err(
      Diagnostic::error(
        "Invalid for_each argument",
        format!("The for_each expression must yield a map or a list of strings, not {}.", other),
      )
      .with_subject(subject)
      .into(),
    ),
  }
}

/// Evaluate a provider `alias` expression: known, non-null, not derived from
/// a sensitive value, and a syntactically valid identifier. Each violation
/// is its own diagnostic.
pub fn eval_alias(source: &str, scope: &Scope, subject: &str) -> Result<String, Diagnostics> {
  let summary = "Invalid provider alias expression";
  let unknown = unknown_vars(source, scope);
  if !unknown.is_empty() {
    return Err(
      Diagnostic::error(
        summary,
        "The alias must be known during planning, but this expression depends on a value that is not known yet.",
      )
      .with_subject(subject)
      .into(),
    );
  }
  if scope.references_sensitive(source) {
    return Err(
      Diagnostic::error(
        summary,
        "The alias for a provider configuration cannot be derived from a sensitive value, because references to the provider instance would need to disclose the value.",
      )
      .with_subject(subject)
      .into(),
    );
  }
  let value = eval_source(source, scope)
    .map_err(|e| Diagnostics::from(Diagnostic::error(summary, e.to_string()).with_subject(subject)))?;
  if value.is_null() {
    return Err(
      Diagnostic::error(summary, "The alias for a provider configuration must not be null.")
        .with_subject(subject)
        .into(),
    );
  }
  let Some(alias) = value.as_str() else {
    return Err(
      Diagnostic::error(summary, format!("Unsuitable value for provider alias: {}.", value))
        .with_subject(subject)
        .into(),
    );
  };
  if !is_identifier(alias) {
    return Err(
      Diagnostic::error(
        summary,
        format!("The alias {:?} is not a valid identifier.", alias),
      )
      .with_subject(subject)
      .into(),
    );
  }
  Ok(alias.to_string())
}

fn is_identifier(s: &str) -> bool {
  let mut chars = s.chars();
  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
    _ => return false,
  }
  chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scope_with(vars: &[(&str, Value)]) -> Scope {
    Scope {
      vars: vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
      ..Default::default()
    }
  }

  #[test]
  fn refs_are_scanned_lexically() {
    let refs = refs_in("{{ var.region }}-{{ test_thing.web.id }} {{ data.test_lookup.x.value }}");
    assert!(refs.contains(&Ref::Variable("region".to_string())));
    assert!(refs.contains(&Ref::Resource(Resource::managed("test_thing", "web"))));
    assert!(refs.iter().any(|r| matches!(r, Ref::Resource(res) if res.mode == ResourceMode::Data)));
    // `each` and bare words are not references.
    assert!(refs_in("{{ each.key }} plain word").is_empty());
  }

  #[test]
  fn single_expression_yields_typed_values() {
    let scope = scope_with(&[("n", json!(3))]);
    assert_eq!(eval_source("{{ var.n }}", &scope).unwrap(), json!(3));
    assert_eq!(eval_source("n = {{ var.n }}", &scope).unwrap(), json!("n = 3"));
  }

  #[test]
  fn count_must_be_a_known_nonnegative_integer() {
    let scope = scope_with(&[("n", json!(2))]);
    assert_eq!(eval_count("{{ var.n }}", &scope, "x").unwrap(), 2);
    assert_eq!(eval_count("3", &scope, "x").unwrap(), 3);

    assert!(eval_count("{{ var.missing }}", &scope, "x").is_err());
    assert!(eval_count("{{ -1 }}", &scope, "x").is_err());
    assert!(eval_count("{{ \"many\" }}", &scope, "x").is_err());
  }

  #[test]
  fn for_each_accepts_maps_and_string_lists() {
    let scope = scope_with(&[("regions", json!({"east": 1, "west": 2}))]);
    let map = eval_for_each("{{ var.regions }}", &scope, "x").unwrap();
    assert_eq!(map.len(), 2);

    let scope = scope_with(&[("names", json!(["a", "b"]))]);
    let map = eval_for_each("{{ var.names }}", &scope, "x").unwrap();
    assert_eq!(map.get("a"), Some(&json!("a")));

    let scope = scope_with(&[("bad", json!([1]))]);
    assert!(eval_for_each("{{ var.bad }}", &scope, "x").is_err());
    let scope = scope_with(&[("nil", Value::Null)]);
    assert!(eval_for_each("{{ var.nil }}", &scope, "x").is_err());
  }

  #[test]
  fn alias_violations_have_distinct_messages() {
    let mut scope = scope_with(&[
      ("ok", json!("west")),
      ("nil", Value::Null),
      ("num", json!(7)),
      ("secret", json!("hush")),
      ("odd", json!("not valid!")),
    ]);
    scope.sensitive_vars.insert("secret".to_string());

    assert_eq!(eval_alias("{{ var.ok }}", &scope, "p").unwrap(), "west");

    let unknown = eval_alias("{{ var.missing }}", &scope, "p").unwrap_err();
    assert!(unknown.iter().next().unwrap().detail.contains("not known"));

    let nil = eval_alias("{{ var.nil }}", &scope, "p").unwrap_err();
    assert!(nil.iter().next().unwrap().detail.contains("must not be null"));

    let sensitive = eval_alias("{{ var.secret }}", &scope, "p").unwrap_err();
    assert!(sensitive.iter().next().unwrap().detail.contains("sensitive"));

    let numeric = eval_alias("{{ var.num }}", &scope, "p").unwrap_err();
    assert!(numeric.iter().next().unwrap().detail.contains("Unsuitable value"));

    let ident = eval_alias("{{ var.odd }}", &scope, "p").unwrap_err();
    assert!(ident.iter().next().unwrap().detail.contains("identifier"));
  }

  #[test]
  fn config_values_evaluate_recursively() {
    let scope = scope_with(&[("name", json!("web"))]);
    let value = json!({
      "name": "{{ var.name }}",
      "tags": ["{{ var.name }}-a", "static"],
      "size": 3
    });
    let resolved = eval_config_value(&value, &scope).unwrap();
    assert_eq!(resolved, json!({"name": "web", "tags": ["web-a", "static"], "size": 3}));
  }
}
