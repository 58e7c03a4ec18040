//! Values handling with deep merge and template-expression scrubbing

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{CoreError, Result};

/// A `{{ ... }}` region anywhere in a string
static TEMPLATE_EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{\{.*\}\}").expect("valid regex"));

/// Whether a string carries a double-brace templating expression
pub fn contains_template_expression(text: &str) -> bool {
    TEMPLATE_EXPRESSION.is_match(text)
}

/// Values container with deep merge capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Parse values from YAML; an empty document yields empty values
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::new());
        }
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        match value {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(_) => Ok(Self(value)),
            other => Err(CoreError::InvalidValues {
                message: format!("expected a mapping at the top level, found {}", kind_of(&other)),
            }),
        }
    }

    /// Serialize back to YAML text
    pub fn to_yaml(&self) -> Result<String> {
        if self.is_empty() {
            return Ok(String::new());
        }
        Ok(serde_yaml::to_string(&self.0)?)
    }

    /// Deep merge another Values into this one
    ///
    /// Rules:
    /// - Scalars: overlay replaces base
    /// - Objects: recursive merge
    /// - Arrays: overlay replaces base (not appended)
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let parts: Vec<&str> = path.split('.').collect();
        get_nested(&self.0, &parts)
    }

    /// Get a string value by dotted path
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(JsonValue::as_str)
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Replace every string leaf that carries a templating expression with `marker`
    ///
    /// Walks maps and lists alike. Returns how many leaves were replaced.
    pub fn scrub_template_expressions(&mut self, marker: &str) -> usize {
        scrub(&mut self.0, marker)
    }

    /// Scope values for a subchart
    ///
    /// The subchart sees `values.<name>.*` as its root, plus `global` as-is.
    pub fn scope_for_subchart(&self, subchart_name: &str) -> Values {
        let mut scoped = serde_json::Map::new();

        if let JsonValue::Object(parent_obj) = &self.0 {
            if let Some(global) = parent_obj.get("global") {
                scoped.insert("global".to_string(), global.clone());
            }

            if let Some(JsonValue::Object(subchart_obj)) = parent_obj.get(subchart_name) {
                for (k, v) in subchart_obj {
                    scoped.insert(k.clone(), v.clone());
                }
            }
        }

        Values(JsonValue::Object(scoped))
    }

    /// Subchart defaults overlaid with the parent's scoped values
    pub fn for_subchart(
        subchart_defaults: Values,
        parent_values: &Values,
        subchart_name: &str,
    ) -> Values {
        let mut result = subchart_defaults;
        let scoped = parent_values.scope_for_subchart(subchart_name);
        result.merge(&scoped);
        result
    }
}

fn scrub(value: &mut JsonValue, marker: &str) -> usize {
    match value {
        JsonValue::String(s) if contains_template_expression(s) => {
            *s = marker.to_string();
            1
        }
        JsonValue::Object(map) => map.values_mut().map(|v| scrub(v, marker)).sum(),
        JsonValue::Array(items) => items.iter_mut().map(|v| scrub(v, marker)).sum(),
        _ => 0,
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a bool",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a list",
        JsonValue::Object(_) => "a mapping",
    }
}

/// Deep merge two JSON values
fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Get a nested value by path
fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let Some((key, remaining)) = path.split_first() else {
        return Some(value);
    };

    match value {
        JsonValue::Object(map) => map.get(*key).and_then(|v| get_nested(v, remaining)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_yaml_empty() {
        assert!(Values::from_yaml("").unwrap().is_empty());
        assert!(Values::from_yaml("~").unwrap().is_empty());
    }

    #[test]
    fn test_from_yaml_rejects_scalar_root() {
        let err = Values::from_yaml("just a string").unwrap_err();
        assert!(matches!(err, CoreError::InvalidValues { .. }));
    }

    #[test]
    fn test_deep_merge() {
        let mut base = Values::from_yaml("image:\n  repo: nginx\n  tag: '1.0'\nports: [80]\n").unwrap();
        let overlay = Values::from_yaml("image:\n  tag: '2.0'\nports: [443]\n").unwrap();
        base.merge(&overlay);

        assert_eq!(base.get_str("image.repo"), Some("nginx"));
        assert_eq!(base.get_str("image.tag"), Some("2.0"));
        assert_eq!(base.get("ports"), Some(&json!([443])));
    }

    #[test]
    fn test_scrub_template_expressions() {
        let mut values = Values(json!({
            "plain": "hello",
            "templated": "{{ cluster.domain }}",
            "nested": {
                "inline": "prefix-{{ x }}-suffix",
                "number": 3,
            },
            "list": ["{{ a }}", "b", {"deep": "{{ b }}"}],
            "halfOpen": "{{ not closed",
        }));

        let replaced = values.scrub_template_expressions("MARK");

        assert_eq!(replaced, 4);
        assert_eq!(values.get_str("plain"), Some("hello"));
        assert_eq!(values.get_str("templated"), Some("MARK"));
        assert_eq!(values.get_str("nested.inline"), Some("MARK"));
        assert_eq!(values.get("nested.number"), Some(&json!(3)));
        assert_eq!(values.get("list"), Some(&json!(["MARK", "b", {"deep": "MARK"}])));
        assert_eq!(values.get_str("halfOpen"), Some("{{ not closed"));
    }

    #[test]
    fn test_multiline_expression_is_detected() {
        assert!(contains_template_expression("a: |\n  {{ x\n }}\n"));
        assert!(!contains_template_expression("}} before {{"));
    }

    #[test]
    fn test_scope_for_subchart() {
        let parent = Values(json!({
            "global": {"registry": "docker.io"},
            "redis": {"replicas": 3},
            "other": true,
        }));

        let scoped = Values::for_subchart(
            Values(json!({"replicas": 1, "port": 6379})),
            &parent,
            "redis",
        );

        assert_eq!(scoped.get("replicas"), Some(&json!(3)));
        assert_eq!(scoped.get("port"), Some(&json!(6379)));
        assert_eq!(scoped.get_str("global.registry"), Some("docker.io"));
        assert!(scoped.get("other").is_none());
    }

    #[test]
    fn test_to_yaml_round_trip() {
        let values = Values::from_yaml("replicas: 2\nname: web\n").unwrap();
        let text = values.to_yaml().unwrap();
        assert_eq!(Values::from_yaml(&text).unwrap(), values);
        assert_eq!(Values::new().to_yaml().unwrap(), "");
    }
}
