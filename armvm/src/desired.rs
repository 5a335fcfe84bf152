//! Desired-state provider.
//!
//! The engine never parses configuration itself. It reads attribute values
//! through [`DesiredState`] and receives the set of changed attribute paths
//! as a [`ChangeSet`]. [`ConfigSnapshot`] is the in-memory provider used by
//! the binary and the tests.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Attributes whose value is a string map rather than a nested block.
const MAP_ATTRIBUTES: &[&str] = &["tags"];

/// Read access to a desired configuration, addressed by dotted attribute path.
pub trait DesiredState: Send + Sync {
    /// Value of `path`, `None` when unset. An explicit `false` or `0` is `Some`.
    fn get(&self, path: &str) -> Option<&Value>;

    /// Paths that differ from the last observed state.
    fn changed_paths(&self) -> BTreeSet<String>;

    /// True when `path` is set to something other than its zero value.
    fn has_value(&self, path: &str) -> bool {
        self.get(path).is_some_and(|v| !is_zero(v))
    }

    /// True when `path` or any attribute beneath it has a value.
    fn has_block(&self, path: &str) -> bool {
        self.has_value(path)
    }

    fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Non-empty string value of `path`.
    fn get_non_empty_str(&self, path: &str) -> Option<&str> {
        self.get_str(path).filter(|s| !s.is_empty())
    }

    fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    /// String list at `path`, skipping non-string entries.
    fn get_str_list(&self, path: &str) -> Vec<String> {
        match self.get(path) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// True for null, `false`, `0`, `""` and empty lists or maps.
pub fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// What the remote reports for an attribute the configuration leaves unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Unset {
    Bool(bool),
    Number(f64),
    Str(&'static str),
    /// Filled in remotely; any observed value stands for the unset attribute.
    Computed,
    /// Sent on create and never read back.
    WriteOnly,
}

impl Unset {
    /// True when `value` is what the remote reports for the unset attribute.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Bool(b) => value.as_bool() == Some(b),
            Self::Number(n) => value.as_f64() == Some(n),
            Self::Str(s) => value.as_str() == Some(s),
            Self::Computed | Self::WriteOnly => true,
        }
    }
}

/// Numbers compare by value, so `-1` and `-1.0` are the same.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Normalize a changed path: list indices are dropped, `os_disk.0.caching`
/// becomes `os_disk.caching`.
pub fn normalize_path(path: &str) -> String {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .filter(|segment| segment.parse::<usize>().is_err())
        .collect::<Vec<_>>()
        .join(".")
}

/// True if `a` equals `b` or one is a dotted prefix of the other.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    fn is_prefix(prefix: &str, path: &str) -> bool {
        path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'.'
    }
    a == b || is_prefix(a, b) || is_prefix(b, a)
}

/// Attribute paths changed in this pass. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet(BTreeSet<String>);

impl ChangeSet {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            paths
                .into_iter()
                .map(|p| normalize_path(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }

    /// Changes reported by a provider.
    pub fn from_provider(desired: &dyn DesiredState) -> Self {
        Self::new(desired.changed_paths())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    /// True if any changed path overlaps `path`.
    pub fn touches(&self, path: &str) -> bool {
        self.0.iter().any(|changed| paths_overlap(changed, path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// A flat key-value configuration snapshot plus its changed paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSnapshot {
    values: BTreeMap<String, Value>,
    changed: BTreeSet<String>,
}

impl ConfigSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten a nested JSON object into dotted paths. Nested objects become
    /// `block.attribute` entries; lists, empty blocks and map attributes such
    /// as `tags` are kept whole.
    pub fn from_value(value: &Value) -> Self {
        let mut values = BTreeMap::new();
        if let Value::Object(map) = value {
            flatten_into(&mut values, "", map);
        }
        Self {
            values,
            changed: BTreeSet::new(),
        }
    }

    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set(path, value);
        self
    }

    pub fn without(mut self, path: &str) -> Self {
        self.values.remove(path);
        self
    }

    pub fn with_changes<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.changed = paths.into_iter().map(|p| p.as_ref().to_string()).collect();
        self
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        self.values.insert(path.to_string(), value.into());
    }

    /// Paths whose value differs between `before` and this snapshot. Unset
    /// and zero values compare equal, as does an unset attribute whose
    /// observed value is its remote default in `defaults`.
    pub fn changes_since(
        &self,
        before: &BTreeMap<String, Value>,
        defaults: &[(&str, Unset)],
    ) -> ChangeSet {
        let unset = |path: &str| {
            defaults
                .iter()
                .find(|(p, _)| *p == path)
                .map(|(_, unset)| *unset)
        };

        let mut changed = BTreeSet::new();
        for (path, value) in &self.values {
            let default = unset(path);
            if default == Some(Unset::WriteOnly) {
                continue;
            }
            let same = match before.get(path) {
                Some(observed) => same_value(observed, value),
                None => is_zero(value) || default.is_some_and(|d| d.matches(value)),
            };
            if !same {
                changed.insert(path.clone());
            }
        }
        for (path, observed) in before {
            if self.values.contains_key(path) || is_zero(observed) {
                continue;
            }
            if !unset(path).is_some_and(|d| d.matches(observed)) {
                changed.insert(path.clone());
            }
        }
        ChangeSet::new(changed)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

impl DesiredState for ConfigSnapshot {
    fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path).filter(|v| !v.is_null())
    }

    fn changed_paths(&self) -> BTreeSet<String> {
        self.changed.clone()
    }

    fn has_block(&self, path: &str) -> bool {
        let prefix = format!("{path}.");
        self.has_value(path)
            || self
                .values
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .any(|(_, v)| !is_zero(v))
    }
}

/// Nested objects other than map attributes are flattened further.
fn is_block(path: &str, inner: &Map<String, Value>) -> bool {
    !inner.is_empty() && !MAP_ATTRIBUTES.contains(&path)
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: &str, map: &Map<String, Value>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            // an empty block is still a declared block
            Value::Object(inner) if is_block(&path, inner) => flatten_into(out, &path, inner),
            other => {
                out.insert(path, other.clone());
            }
        }
    }
}
