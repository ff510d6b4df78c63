use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

const FORBIDDEN_KEY_CHARS: &[char] = &['.', '#', '$', '[', ']'];

/// Slash-separated location of a node in the remote tree.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse `"a/b/c"`. Leading and trailing slashes are ignored; empty
    /// inner segments and characters the store does not accept in keys are
    /// rejected.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(CoreError::InvalidPath(format!("empty segment in `{s}`")));
            }
            if segment.contains(FORBIDDEN_KEY_CHARS) {
                return Err(CoreError::InvalidPath(format!(
                    "segment `{segment}` contains a forbidden character"
                )));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(
            segment
                .as_ref()
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        Self { segments }
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self {
            segments: rest.to_vec(),
        })
    }

    /// Last segment; `None` for the root.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Strict ancestry: a path is not its own ancestor.
    pub fn is_ancestor_of(&self, other: &StorePath) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// True when one path equals or contains the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }

    /// Path of `other` relative to `self`, if `self` is an ancestor or equal.
    pub fn relative(&self, other: &StorePath) -> Option<StorePath> {
        if self == other || self.is_ancestor_of(other) {
            Some(Self {
                segments: other.segments[self.segments.len()..].to_vec(),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePath({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let path = StorePath::parse("/owners/u1/lists/").unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path.to_string(), "owners/u1/lists");
        assert_eq!(path.key(), Some("lists"));
    }

    #[test]
    fn parse_rejects_bad_segments() {
        assert!(StorePath::parse("a//b").is_err());
        assert!(StorePath::parse("a/b.c").is_err());
        assert!(StorePath::parse("a/$b").is_err());
    }

    #[test]
    fn child_and_parent() {
        let lists = StorePath::parse("lists").unwrap();
        let record = lists.child("l1");
        assert_eq!(record.to_string(), "lists/l1");
        assert_eq!(record.parent(), Some(lists.clone()));
        assert_eq!(lists.child("l1/users").to_string(), "lists/l1/users");
        assert!(StorePath::root().parent().is_none());
    }

    #[test]
    fn ancestry_is_strict() {
        let a = StorePath::parse("lists/l1").unwrap();
        let b = StorePath::parse("lists/l1/title").unwrap();
        let c = StorePath::parse("lists/l10").unwrap();
        assert!(a.is_ancestor_of(&b));
        assert!(!a.is_ancestor_of(&a));
        assert!(!a.is_ancestor_of(&c));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(StorePath::root().is_ancestor_of(&a));
    }

    #[test]
    fn relative_paths() {
        let a = StorePath::parse("lists/l1").unwrap();
        let b = StorePath::parse("lists/l1/users/u1").unwrap();
        assert_eq!(a.relative(&b).unwrap().to_string(), "users/u1");
        assert!(b.relative(&a).is_none());
        assert!(a.relative(&a).unwrap().is_root());
    }
}
