//! Attribute paths.
//!
//! A [`Path`] addresses a location inside a [`Value`](crate::Value): a
//! sequence of object keys and list indices. The textual form is the one
//! used in configuration: `tags["Name"]`, `list[0].id`, `nested.attr`.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// One step of a [`Path`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathStep {
    /// Object attribute or map key
    Key(String),
    /// List element
    Index(usize),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) if is_identifier(k) => write!(f, ".{k}"),
            Self::Key(k) => write!(f, "[{k:?}]"),
            Self::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A location inside a value. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Path(Vec<PathStep>);

impl Path {
    /// The root path
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from steps
    #[must_use]
    pub const fn from_steps(steps: Vec<PathStep>) -> Self {
        Self(steps)
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extend with an attribute step
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(PathStep::Key(key.into()));
        self
    }

    /// Extend with an index step
    #[must_use]
    pub fn index(mut self, index: usize) -> Self {
        self.0.push(PathStep::Index(index));
        self
    }

    pub fn push(&mut self, step: PathStep) {
        self.0.push(step);
    }

    /// Concatenate `other` onto this path
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        let mut steps = self.0.clone();
        steps.extend(other.0.iter().cloned());
        Self(steps)
    }

    /// True if `prefix` is this path or one of its ancestors
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// The remainder of this path below `prefix`
    #[must_use]
    pub fn strip_prefix(&self, prefix: &Self) -> Option<Self> {
        self.0
            .strip_prefix(prefix.0.as_slice())
            .map(|rest| Self(rest.to_vec()))
    }

    /// The first step, if any
    #[must_use]
    pub fn first(&self) -> Option<&PathStep> {
        self.0.first()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            match step {
                PathStep::Key(k) if i == 0 && is_identifier(k) => write!(f, "{k}")?,
                other => write!(f, "{other}")?,
            }
        }
        Ok(())
    }
}

impl FromIterator<PathStep> for Path {
    fn from_iter<I: IntoIterator<Item = PathStep>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ============================================================================
// Parsing
// ============================================================================

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::PathSyntax {
            input: self.input.to_string(),
            offset: self.pos,
            message: message.into(),
        }
    }

    fn expect(&mut self, want: char) -> Result<()> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            _ => Err(self.error(format!("expected '{want}'"))),
        }
    }

    fn identifier(&mut self) -> Result<String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            self.bump();
        }
        if start == self.pos {
            return Err(self.error("expected attribute name"));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn quoted(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn bracket(&mut self) -> Result<PathStep> {
        self.expect('[')?;
        let step = if self.peek() == Some('"') {
            PathStep::Key(self.quoted()?)
        } else {
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
            let digits = &self.input[start..self.pos];
            let index = digits
                .parse::<usize>()
                .map_err(|_| self.error("expected list index or quoted key"))?;
            PathStep::Index(index)
        };
        self.expect(']')?;
        Ok(step)
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut cursor = Cursor::new(s.trim());
        let mut steps = Vec::new();
        while let Some(c) = cursor.peek() {
            let step = match c {
                '[' => cursor.bracket()?,
                '.' if !steps.is_empty() => {
                    cursor.bump();
                    PathStep::Key(cursor.identifier()?)
                }
                _ if steps.is_empty() => PathStep::Key(cursor.identifier()?),
                _ => return Err(cursor.error("expected '.' or '['")),
            };
            steps.push(step);
        }
        Ok(Self(steps))
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path: Path = r#"test_map["string"]"#.parse().unwrap();
        assert_eq!(
            path.steps(),
            &[
                PathStep::Key("test_map".into()),
                PathStep::Key("string".into())
            ]
        );
        assert_eq!(path.to_string(), r#"test_map.string"#);

        let path: Path = "list[2].id".parse().unwrap();
        assert_eq!(path, Path::root().key("list").index(2).key("id"));
        assert_eq!(path.to_string(), "list[2].id");
    }

    #[test]
    fn test_non_identifier_keys_are_quoted() {
        let path = Path::root().key("tags").key("Name With Space");
        assert_eq!(path.to_string(), r#"tags["Name With Space"]"#);
        assert_eq!(path.to_string().parse::<Path>().unwrap(), path);
    }

    #[test]
    fn test_empty_is_root() {
        assert!("".parse::<Path>().unwrap().is_root());
        assert_eq!(Path::root().to_string(), "");
    }

    #[test]
    fn test_parse_errors() {
        assert!(".leading".parse::<Path>().is_err());
        assert!("a[".parse::<Path>().is_err());
        assert!("a[x]".parse::<Path>().is_err());
        assert!(r#"a["open"#.parse::<Path>().is_err());
        assert!("a b".parse::<Path>().is_err());
    }

    #[test]
    fn test_prefix_operations() {
        let full = Path::root().key("a").key("b").index(0);
        let prefix = Path::root().key("a");
        assert!(full.starts_with(&prefix));
        assert!(full.starts_with(&Path::root()));
        assert!(!prefix.starts_with(&full));
        assert_eq!(
            full.strip_prefix(&prefix),
            Some(Path::root().key("b").index(0))
        );
        assert_eq!(prefix.join(&Path::root().key("c")).to_string(), "a.c");
    }

    #[test]
    fn test_serde_as_string() {
        let path = Path::root().key("x").index(1);
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, r#""x[1]""#);
        let back: Path = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
