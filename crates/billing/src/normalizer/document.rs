//! Path lookups over semi-structured JSON
//!
//! A path is a dotted list of segments. A segment that parses as an integer
//! indexes into an array; any other segment is an object key. Lookups never
//! fail: a missing or mistyped step yields `None`.

use serde_json::{Map, Value};

/// Borrowed view over one JSON node
#[derive(Debug, Clone, Copy)]
pub struct Document<'a> {
    root: &'a Value,
}

impl<'a> Document<'a> {
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    pub fn value(&self) -> &'a Value {
        self.root
    }

    /// Resolve one dotted path
    pub fn get(&self, path: &str) -> Option<&'a Value> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(self.root, |node, segment| match node {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }

    /// First path whose value is present and not null/empty
    pub fn first_of(&self, paths: &[&str]) -> Option<&'a Value> {
        paths
            .iter()
            .filter_map(|path| self.get(path))
            .find(|value| !is_blank(value))
    }

    /// First path that resolves to a non-empty string (numbers are rendered)
    pub fn first_str(&self, paths: &[&str]) -> Option<String> {
        paths.iter().filter_map(|path| self.get(path)).find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    /// First path that resolves to a non-empty object
    pub fn first_object(&self, paths: &[&str]) -> Option<&'a Map<String, Value>> {
        paths
            .iter()
            .filter_map(|path| self.get(path))
            .find_map(non_empty_object)
    }

    /// Nested document at the first path holding a non-empty object
    pub fn child(&self, paths: &[&str]) -> Option<Document<'a>> {
        paths
            .iter()
            .filter_map(|path| self.get(path))
            .find(|value| non_empty_object(value).is_some())
            .map(Document::new)
    }

    /// Array at `path`, or an empty slice
    pub fn array(&self, path: &str) -> &'a [Value] {
        match self.get(path) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        }
    }
}

/// `Some(map)` when the value is an object with at least one key
pub fn non_empty_object(value: &Value) -> Option<&Map<String, Value>> {
    match value {
        Value::Object(map) if !map.is_empty() => Some(map),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
