//! Template resolution for chain step parameters.
//!
//! Step request parameters may contain placeholder strings of the forms
//! `{{.trigger_data.<path>}}`, `{{.step_N.response.<path>}}` and
//! `{{.step_N.request.<path>}}`. Resolution walks the JSON tree of the
//! parameter document; a string leaf that consists of exactly one
//! placeholder is replaced by the referenced value with its type intact
//! (object, array, number, bool, string, null). Placeholders that do not
//! resolve are left as literal strings.

use serde_json::{Map, Value};

/// Lookup context for placeholder paths: the run's trigger data plus the
/// request/response documents of every step executed so far.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    root: Map<String, Value>,
}

impl TemplateContext {
    pub fn new(trigger_data: Value) -> Self {
        let mut root = Map::new();
        root.insert("trigger_data".to_string(), trigger_data);
        Self { root }
    }

    /// Record a completed step so later steps can reference
    /// `step_N.request` and `step_N.response`.
    pub fn record_step(&mut self, step_order: i32, request: Value, response: Value) {
        let mut entry = Map::new();
        entry.insert("request".to_string(), request);
        entry.insert("response".to_string(), response);
        self.root
            .insert(format!("step_{step_order}"), Value::Object(entry));
    }

    /// Follow a dotted path from the context root. Numeric segments index
    /// into arrays.
    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.root.get(first)?;

        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Resolve all placeholders in `template` against `ctx`, recursing through
/// objects and arrays. Returns a new document; unresolved placeholders are
/// preserved verbatim.
pub fn resolve(template: &Value, ctx: &TemplateContext) -> Value {
    match template {
        Value::String(s) => match placeholder_path(s) {
            Some(path) => ctx
                .lookup(path)
                .cloned()
                .unwrap_or_else(|| template.clone()),
            None => template.clone(),
        },
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, ctx)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, ctx)).collect()),
        other => other.clone(),
    }
}

/// If the whole string is a single `{{.path}}` placeholder, return the path.
fn placeholder_path(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{.")?.strip_suffix("}}")?;
    let path = inner.trim();
    if path.is_empty() || path.contains('{') || path.contains('}') {
        return None;
    }
    Some(path)
}
