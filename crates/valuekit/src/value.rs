//! The attribute value model.
//!
//! Values are JSON-like trees with one extra leaf: [`Value::Unknown`], a
//! placeholder for something that will only be known after apply. Unknowns
//! may appear at any depth.

use crate::error::{Error, Result};
use crate::path::{Path, PathStep};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// JSON key used to encode an unknown value
pub const UNKNOWN_SENTINEL: &str = "$unknown";

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    /// Known only after apply
    Unknown,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Self>),
    Object(BTreeMap<String, Self>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn list(items: impl IntoIterator<Item = Self>) -> Self {
        Self::List(items.into_iter().collect())
    }

    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    #[must_use]
    pub const fn empty_object() -> Self {
        Self::Object(BTreeMap::new())
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// True if no unknown appears anywhere in the value
    #[must_use]
    pub fn is_wholly_known(&self) -> bool {
        match self {
            Self::Unknown => false,
            Self::List(items) => items.iter().all(Self::is_wholly_known),
            Self::Object(attrs) => attrs.values().all(Self::is_wholly_known),
            _ => true,
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Unknown => "unknown",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Object(_) => "object",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_object(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Object(attrs) => Some(attrs),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a top-level attribute
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&Self> {
        self.as_object().and_then(|attrs| attrs.get(name))
    }

    /// Look up the value at `path`.
    ///
    /// Any path below an unknown resolves to that unknown. Returns `None`
    /// when the path does not exist.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&Self> {
        let mut current = self;
        for step in path.steps() {
            current = match (current, step) {
                (Self::Unknown, _) => return Some(current),
                (Self::Object(attrs), PathStep::Key(k)) => attrs.get(k)?,
                (Self::List(items), PathStep::Index(i)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Replace the value at `path`, creating the final object key if needed.
    /// A null on the way is promoted to an empty object.
    ///
    /// # Errors
    ///
    /// Returns an error if an intermediate step does not match the value's
    /// shape or a list index is out of range.
    pub fn set(&mut self, path: &Path, value: Self) -> Result<()> {
        let mut current = self;
        for step in path.steps() {
            if current.is_null() && matches!(step, PathStep::Key(_)) {
                *current = Self::empty_object();
            }
            current = match (current, step) {
                (Self::Object(attrs), PathStep::Key(k)) => attrs.entry(k.clone()).or_default(),
                (Self::List(items), PathStep::Index(i)) => {
                    let len = items.len();
                    items
                        .get_mut(*i)
                        .ok_or(Error::IndexOutOfRange { index: *i, len })?
                }
                (other, step) => {
                    return Err(Error::PathMismatch {
                        step: step.to_string(),
                        found: other.type_name(),
                    });
                }
            };
        }
        *current = value;
        Ok(())
    }

    /// Every path at which an unknown appears, outermost first
    #[must_use]
    pub fn unknown_paths(&self) -> Vec<Path> {
        let mut out = Vec::new();
        self.collect_unknowns(&Path::root(), &mut out);
        out
    }

    fn collect_unknowns(&self, at: &Path, out: &mut Vec<Path>) {
        match self {
            Self::Unknown => out.push(at.clone()),
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_unknowns(&at.clone().index(i), out);
                }
            }
            Self::Object(attrs) => {
                for (k, v) in attrs {
                    v.collect_unknowns(&at.clone().key(k.as_str()), out);
                }
            }
            _ => {}
        }
    }

    /// Replace every unknown with null
    #[must_use]
    pub fn null_unknowns(self) -> Self {
        match self {
            Self::Unknown => Self::Null,
            Self::List(items) => Self::List(items.into_iter().map(Self::null_unknowns).collect()),
            Self::Object(attrs) => Self::Object(
                attrs
                    .into_iter()
                    .map(|(k, v)| (k, v.null_unknowns()))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Fill unknowns in `self` with whatever `other` has at the same place.
    /// Used to merge a planned value with the freshly evaluated config.
    #[must_use]
    pub fn fill_unknowns_from(self, other: &Self) -> Self {
        match (self, other) {
            (Self::Unknown, o) => o.clone(),
            (Self::Object(mut attrs), Self::Object(theirs)) => {
                for (k, v) in &mut attrs {
                    if let Some(o) = theirs.get(k) {
                        *v = std::mem::take(v).fill_unknowns_from(o);
                    }
                }
                Self::Object(attrs)
            }
            (Self::List(items), Self::List(theirs)) if items.len() == theirs.len() => Self::List(
                items
                    .into_iter()
                    .zip(theirs)
                    .map(|(v, o)| v.fill_unknowns_from(o))
                    .collect(),
            ),
            (mine, _) => mine,
        }
    }

    /// The outermost paths at which `self` and `other` differ.
    ///
    /// Objects are compared key by key with a missing key treated as null;
    /// lists of equal length element by element. Anything else that differs
    /// is reported at its own path.
    #[must_use]
    pub fn diff_paths(&self, other: &Self) -> Vec<Path> {
        let mut out = Vec::new();
        diff_into(self, other, &Path::root(), &mut out);
        out
    }

    /// Serialize to the JSON wire form, encoding unknowns with the sentinel
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null => J::Null,
            Self::Unknown => {
                let mut m = serde_json::Map::new();
                m.insert(UNKNOWN_SENTINEL.to_string(), J::Bool(true));
                J::Object(m)
            }
            Self::Bool(b) => J::Bool(*b),
            Self::Number(n) => number_to_json(*n),
            Self::String(s) => J::String(s.clone()),
            Self::List(items) => J::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(attrs) => J::Object(
                attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Parse the JSON wire form
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as J;
        match json {
            J::Null => Self::Null,
            J::Bool(b) => Self::Bool(*b),
            J::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            J::String(s) => Self::String(s.clone()),
            J::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            J::Object(m) if is_unknown_sentinel(m) => Self::Unknown,
            J::Object(m) => Self::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

fn is_unknown_sentinel(m: &serde_json::Map<String, serde_json::Value>) -> bool {
    m.len() == 1 && m.get(UNKNOWN_SENTINEL) == Some(&serde_json::Value::Bool(true))
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

fn diff_into(a: &Value, b: &Value, at: &Path, out: &mut Vec<Path>) {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            let keys: std::collections::BTreeSet<&String> = x.keys().chain(y.keys()).collect();
            for k in keys {
                let l = x.get(k).unwrap_or(&Value::Null);
                let r = y.get(k).unwrap_or(&Value::Null);
                diff_into(l, r, &at.clone().key(k.as_str()), out);
            }
        }
        (Value::List(x), Value::List(y)) if x.len() == y.len() => {
            for (i, (l, r)) in x.iter().zip(y).enumerate() {
                diff_into(l, r, &at.clone().index(i), out);
            }
        }
        _ if a != b => out.push(at.clone()),
        _ => {}
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(|json| Self::from_json(&json))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Unknown => write!(f, "(known after apply)"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{}", number_to_json(*n)),
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Object(attrs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in attrs.iter().enumerate() {
                    write!(f, "{}{k} = {v}", if i > 0 { ", " } else { " " })?;
                }
                write!(f, "{}}}", if attrs.is_empty() { "" } else { " " })
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::object([
            ("id", Value::Unknown),
            ("name", Value::from("a")),
            (
                "tags",
                Value::object([("env", Value::from("prod")), ("owner", Value::Unknown)]),
            ),
            ("ports", Value::list([Value::from(80), Value::from(443)])),
        ])
    }

    #[test]
    fn test_wholly_known() {
        assert!(!sample().is_wholly_known());
        assert!(Value::from("x").is_wholly_known());
        assert!(Value::Null.is_wholly_known());
        assert!(sample().null_unknowns().is_wholly_known());
    }

    #[test]
    fn test_unknown_paths() {
        let paths: Vec<String> = sample()
            .unknown_paths()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(paths, vec!["id", "tags.owner"]);
    }

    #[test]
    fn test_get_below_unknown_is_unknown() {
        let v = sample();
        let path: Path = "id.deep[0]".parse().unwrap();
        assert_eq!(v.get(&path), Some(&Value::Unknown));
        assert_eq!(v.get(&"missing".parse().unwrap()), None);
        assert_eq!(
            v.get(&"ports[1]".parse().unwrap()),
            Some(&Value::from(443))
        );
    }

    #[test]
    fn test_set_creates_leaf_and_promotes_null() {
        let mut v = Value::Null;
        v.set(&"a.b".parse().unwrap(), Value::from(true)).unwrap();
        assert_eq!(v.get(&"a.b".parse().unwrap()), Some(&Value::Bool(true)));

        let mut list = Value::list([Value::from(1)]);
        assert!(matches!(
            list.set(&"[3]".parse().unwrap(), Value::Null),
            Err(Error::IndexOutOfRange { index: 3, len: 1 })
        ));
        assert!(matches!(
            Value::from("s").set(&"x".parse().unwrap(), Value::Null),
            Err(Error::PathMismatch { .. })
        ));
    }

    #[test]
    fn test_diff_paths_reports_outermost_change() {
        let a = Value::object([
            ("same", Value::from(1)),
            ("changed", Value::from("x")),
            ("list", Value::list([Value::from(1)])),
        ]);
        let b = Value::object([
            ("same", Value::from(1)),
            ("changed", Value::from("y")),
            ("list", Value::list([Value::from(1), Value::from(2)])),
            ("added", Value::from(true)),
        ]);
        let diffs: Vec<String> = a.diff_paths(&b).iter().map(ToString::to_string).collect();
        assert_eq!(diffs, vec!["added", "changed", "list"]);
        assert!(a.diff_paths(&a).is_empty());
    }

    #[test]
    fn test_fill_unknowns_from() {
        let planned = sample();
        let config = Value::object([
            ("id", Value::from("i-1")),
            ("tags", Value::object([("owner", Value::from("me"))])),
        ]);
        let merged = planned.fill_unknowns_from(&config);
        assert_eq!(merged.attr("id"), Some(&Value::from("i-1")));
        assert_eq!(
            merged.get(&"tags.owner".parse().unwrap()),
            Some(&Value::from("me"))
        );
    }

    #[test]
    fn test_json_unknown_sentinel() {
        let json = sample().to_json();
        assert_eq!(json["id"], serde_json::json!({ "$unknown": true }));
        assert_eq!(json["ports"], serde_json::json!([80, 443]));
        assert_eq!(Value::from_json(&json), sample());

        // an object that merely contains the key is still an object
        let other = serde_json::json!({ "$unknown": true, "x": 1 });
        assert!(matches!(Value::from_json(&other), Value::Object(_)));
    }

    #[test]
    fn test_display() {
        let v = Value::object([("a", Value::from("x")), ("b", Value::Unknown)]);
        assert_eq!(v.to_string(), r#"{ a = "x", b = (known after apply) }"#);
        assert_eq!(Value::empty_object().to_string(), "{}");
        assert_eq!(Value::from(1.5).to_string(), "1.5");
    }
}
