//! Templating-expression preservation across label injection
//!
//! Values may carry `{{ ... }}` expressions meant for a later templating pass.
//! Before rendering, such leaves are replaced by [`PLACEHOLDER_MARKER`]. After
//! label injection the marker is swapped back for the ConfigMap template
//! expression that produced it, found through a key made of the last five
//! non-whitespace characters preceding the expression.
//!
//! Keys are short, so two ConfigMap expressions preceded by the same five
//! characters collide and the later one wins.

use once_cell::sync::Lazy;
use regex::Regex;
use rudder_core::{Chart, Values};
use std::collections::HashMap;

use crate::error::Result;

/// Token standing in for a scrubbed value while rendering and labeling
///
/// A plain word, so it stays unquoted both inline and in block scalars.
pub const PLACEHOLDER_MARKER: &str = "rudderPlaceholderZ-preserved";

/// Inert text emitted when a marker has no matching expression
pub const UNRESOLVED_PLACEHOLDER: &str = "unresolved-placeholder";

const KEY_WIDTH: usize = 5;

static INDENT_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"indent\s*\(?\s*(\d+)").expect("valid regex"));

/// Replace every expression-bearing leaf of a values document with the marker
///
/// Text without such leaves is returned unchanged.
pub fn scrub_values(raw: &str) -> Result<String> {
    let mut values = Values::from_yaml(raw)?;
    if values.scrub_template_expressions(PLACEHOLDER_MARKER) == 0 {
        return Ok(raw.to_string());
    }
    Ok(values.to_yaml()?)
}

/// Last five non-whitespace characters of `text`
///
/// Only the tail of `text` is read.
fn lookup_key(text: &str) -> Option<String> {
    let mut tail: Vec<char> = text
        .chars()
        .rev()
        .filter(|c| !c.is_whitespace())
        .take(KEY_WIDTH)
        .collect();
    if tail.len() < KEY_WIDTH {
        return None;
    }
    tail.reverse();
    Some(tail.into_iter().collect())
}

/// Width of an `indent N` / `indent(N)` directive in an expression
fn indent_width(expression: &str) -> Option<usize> {
    INDENT_DIRECTIVE
        .captures(expression)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Expressions found in ConfigMap templates, keyed by their preceding text
#[derive(Debug, Clone, Default)]
pub struct ExpressionMap {
    entries: HashMap<String, String>,
}

impl ExpressionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan one template text for `{{ ... }}` regions
    pub fn from_text(text: &str) -> Self {
        let mut map = Self::new();
        map.scan(text);
        map
    }

    /// Scan the ConfigMap documents of a chart and all of its subcharts
    pub fn from_chart(chart: &Chart) -> Self {
        let mut map = Self::new();
        for source in config_map_sources(chart) {
            map.scan(source);
        }
        map
    }

    fn scan(&mut self, text: &str) {
        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            let Some(close) = rest[open..].find("}}").map(|i| open + i + 2) else {
                break;
            };
            if let Some(key) = lookup_key(&rest[..open]) {
                self.entries.insert(key, rest[open..close].to_string());
            }
            rest = &rest[close..];
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Swap every marker in `manifest` for its original expression
    ///
    /// Markers are handled left to right and each entry is used at most once.
    /// An expression carrying an indent directive drops up to that many spaces
    /// in front of the marker. Markers without an entry become
    /// [`UNRESOLVED_PLACEHOLDER`].
    pub fn restore(&mut self, manifest: &str) -> String {
        let mut out = String::with_capacity(manifest.len());
        let mut rest = manifest;

        while let Some(index) = rest.find(PLACEHOLDER_MARKER) {
            out.push_str(&rest[..index]);
            rest = &rest[index + PLACEHOLDER_MARKER.len()..];

            let expression = lookup_key(&out).and_then(|key| self.entries.remove(&key));
            match expression {
                Some(expression) => {
                    if let Some(width) = indent_width(&expression) {
                        let kept = out.trim_end_matches(' ').len().max(out.len().saturating_sub(width));
                        out.truncate(kept);
                    }
                    out.push_str(&expression);
                }
                None => {
                    tracing::warn!("no expression found for value placeholder, using inert value");
                    out.push_str(UNRESOLVED_PLACEHOLDER);
                }
            }
        }

        out.push_str(rest);
        out
    }
}

/// ConfigMap documents of every template in the chart tree
fn config_map_sources(chart: &Chart) -> Vec<&str> {
    let mut sources = Vec::new();
    for chart in chart.charts() {
        for template in chart.templates.iter().filter(|t| t.data.contains("ConfigMap")) {
            if template.data.contains("---\n") {
                sources.extend(
                    template
                        .data
                        .split("---\n")
                        .filter(|part| part.contains("ConfigMap")),
                );
            } else {
                sources.push(template.data.as_str());
            }
        }
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::ChartMetadata;

    #[test]
    fn test_lookup_key_ignores_whitespace() {
        assert_eq!(lookup_key("data:\n  app.conf: |\n    ").as_deref(), Some("onf:|"));
        assert_eq!(lookup_key(" a b\n"), None);
    }

    #[test]
    fn test_indent_width() {
        assert_eq!(indent_width("{{ values.conf | indent(4) }}"), Some(4));
        assert_eq!(indent_width("{{ values.conf | nindent 8 }}"), Some(8));
        assert_eq!(indent_width("{{ values.conf }}"), None);
    }

    #[test]
    fn test_scrub_values() {
        let raw = "conf: \"{{ cluster.helper }}\"\nplain: text\nlist:\n  - \"{{ x }}\"\n";
        let scrubbed = scrub_values(raw).unwrap();
        let values = Values::from_yaml(&scrubbed).unwrap();
        assert_eq!(values.get_str("conf"), Some(PLACEHOLDER_MARKER));
        assert_eq!(values.get_str("plain"), Some("text"));
        assert!(!scrubbed.contains("{{"));

        let untouched = "# comment kept\nplain: text\n";
        assert_eq!(scrub_values(untouched).unwrap(), untouched);
    }

    #[test]
    fn test_from_chart_only_reads_config_maps() {
        let chart = Chart::new(ChartMetadata::new("web", "1.0.0"))
            .with_template(
                "templates/mixed.yaml",
                "kind: Secret\ndata:\n  token: {{ values.token }}\n---\nkind: ConfigMap\ndata:\n  key: {{ values.key }}\n",
            )
            .with_template("templates/svc.yaml", "kind: Service\nport: {{ values.port }}\n");

        let map = ExpressionMap::from_chart(&chart);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(":key:"), Some("{{ values.key }}"));
    }

    #[test]
    fn test_restore_consumes_entries_and_compensates_indent() {
        let mut map = ExpressionMap::from_text(
            "data:\n  app.conf: |\n{{ values.conf | indent(4) }}\n  other: {{ values.other }}\n",
        );
        assert_eq!(map.len(), 2);

        let labeled = format!(
            "data:\n  app.conf: |\n    {PLACEHOLDER_MARKER}\n  other: {PLACEHOLDER_MARKER}\n  again: |\n    {PLACEHOLDER_MARKER}\n"
        );
        let restored = map.restore(&labeled);

        assert_eq!(
            restored,
            format!(
                "data:\n  app.conf: |\n{{{{ values.conf | indent(4) }}}}\n  other: {{{{ values.other }}}}\n  again: |\n    {UNRESOLVED_PLACEHOLDER}\n"
            )
        );
        assert!(map.is_empty());
    }

    #[test]
    fn test_same_key_keeps_later_expression() {
        let mut map = ExpressionMap::from_text(
            "data:\n  a.conf: {{ values.first }}\n---\ndata:\n  b.conf: {{ values.second }}\n",
        );
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("conf:"), Some("{{ values.second }}"));

        let restored = map.restore(&format!(
            "data:\n  a.conf: {PLACEHOLDER_MARKER}\n  b.conf: {PLACEHOLDER_MARKER}\n"
        ));
        assert_eq!(
            restored,
            format!("data:\n  a.conf: {{{{ values.second }}}}\n  b.conf: {UNRESOLVED_PLACEHOLDER}\n")
        );
    }

    #[test]
    fn test_lookup_key_reads_only_the_tail() {
        let long = format!("{}data:\n  key: ", "x: y\n".repeat(10_000));
        assert_eq!(lookup_key(&long).as_deref(), Some(":key:"));
    }

    #[test]
    fn test_restore_without_markers_is_identity() {
        let mut map = ExpressionMap::new();
        assert_eq!(map.restore("kind: Service\n"), "kind: Service\n");
    }
}
