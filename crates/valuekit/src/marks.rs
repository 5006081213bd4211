//! Sensitivity marks.
//!
//! A [`PathSet`] records which parts of a value are sensitive. A mark on a
//! path covers everything below it, so the set is kept free of marks that
//! another mark already covers.

use crate::path::Path;
use crate::value::Value;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// A canonical set of attribute paths
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct PathSet(BTreeSet<Path>);

impl PathSet {
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// A set marking the whole value
    #[must_use]
    pub fn whole() -> Self {
        Self::from_iter([Path::root()])
    }

    /// Add a path. Returns false if it was already covered.
    pub fn insert(&mut self, path: Path) -> bool {
        if self.covers(&path) {
            return false;
        }
        self.0.retain(|existing| !existing.starts_with(&path));
        self.0.insert(path)
    }

    pub fn extend_from(&mut self, other: &Self) {
        for path in &other.0 {
            self.insert(path.clone());
        }
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.extend_from(other);
        out
    }

    /// True if `path` or one of its ancestors is marked
    #[must_use]
    pub fn covers(&self, path: &Path) -> bool {
        self.0.iter().any(|mark| path.starts_with(mark))
    }

    /// True if the whole value is marked
    #[must_use]
    pub fn is_whole(&self) -> bool {
        self.0.contains(&Path::root())
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.0.contains(path)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.0.iter()
    }

    /// The marks relative to `at`, as seen by whoever reads the value there
    #[must_use]
    pub fn project(&self, at: &Path) -> Self {
        if self.covers(at) {
            return Self::whole();
        }
        self.0
            .iter()
            .filter_map(|mark| mark.strip_prefix(at))
            .collect()
    }

    /// Re-root every mark under `prefix`
    #[must_use]
    pub fn embed(&self, prefix: &Path) -> Self {
        self.0.iter().map(|mark| prefix.join(mark)).collect()
    }

    /// Drop marks whose path no longer exists in `value`
    pub fn retain_present(&mut self, value: &Value) {
        self.0.retain(|mark| value.get(mark).is_some());
    }
}

impl FromIterator<Path> for PathSet {
    fn from_iter<I: IntoIterator<Item = Path>>(iter: I) -> Self {
        let mut set = Self::new();
        for path in iter {
            set.insert(path);
        }
        set
    }
}

impl<'a> IntoIterator for &'a PathSet {
    type Item = &'a Path;
    type IntoIter = std::collections::btree_set::Iter<'a, Path>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for PathSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Path>::deserialize(deserializer).map(Self::from_iter)
    }
}

/// A value together with its sensitivity marks
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarkedValue {
    pub value: Value,
    pub marks: PathSet,
}

impl MarkedValue {
    #[must_use]
    pub const fn new(value: Value, marks: PathSet) -> Self {
        Self { value, marks }
    }

    #[must_use]
    pub const fn unmarked(value: Value) -> Self {
        Self::new(value, PathSet::new())
    }

    /// A value that is sensitive as a whole
    #[must_use]
    pub fn sensitive(value: Value) -> Self {
        Self::new(value, PathSet::whole())
    }

    #[must_use]
    pub fn is_sensitive(&self) -> bool {
        self.marks.is_whole()
    }

    /// The value at `path` with its marks projected. Missing paths read as
    /// null.
    #[must_use]
    pub fn get(&self, path: &Path) -> Self {
        Self {
            value: self.value.get(path).cloned().unwrap_or_default(),
            marks: self.marks.project(path),
        }
    }

    /// Add marks, keeping the set canonical
    #[must_use]
    pub fn with_marks(mut self, marks: &PathSet) -> Self {
        self.marks.extend_from(marks);
        self
    }

    #[must_use]
    pub fn into_parts(self) -> (Value, PathSet) {
        (self.value, self.marks)
    }
}

impl From<Value> for MarkedValue {
    fn from(value: Value) -> Self {
        Self::unmarked(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    #[test]
    fn test_insert_keeps_set_canonical() {
        let mut set = PathSet::new();
        assert!(set.insert(p("a.b")));
        assert!(set.insert(p("a.c")));
        assert!(!set.insert(p("a.b")));
        assert!(!set.insert(p("a.b.deep")));
        assert_eq!(set.len(), 2);

        // a covering mark replaces what it covers
        assert!(set.insert(p("a")));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![&p("a")]);
    }

    #[test]
    fn test_project_and_embed() {
        let set: PathSet = [p("secret"), p("nested.password")].into_iter().collect();
        assert!(set.project(&p("secret.inner")).is_whole());
        assert_eq!(
            set.project(&p("nested")).iter().collect::<Vec<_>>(),
            vec![&p("password")]
        );
        assert!(set.project(&p("public")).is_empty());

        let embedded = set.project(&p("nested")).embed(&p("other"));
        assert!(embedded.contains(&p("other.password")));
    }

    #[test]
    fn test_retain_present() {
        let mut set: PathSet = [p("a"), p("gone")].into_iter().collect();
        set.retain_present(&Value::object([("a", Value::from(1))]));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&p("a")));
    }

    #[test]
    fn test_marked_get() {
        let marked = MarkedValue::new(
            Value::object([("pw", Value::from("hunter2")), ("user", Value::from("me"))]),
            [p("pw")].into_iter().collect(),
        );
        assert!(marked.get(&p("pw")).is_sensitive());
        assert!(!marked.get(&p("user")).is_sensitive());
        assert_eq!(marked.get(&p("missing")).value, Value::Null);
    }

    #[test]
    fn test_pathset_serde() {
        let set: PathSet = [p("b"), p("a")].into_iter().collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
        let back: PathSet = serde_json::from_str(r#"["a","a.x","b"]"#).unwrap();
        assert_eq!(back, set);
    }
}
