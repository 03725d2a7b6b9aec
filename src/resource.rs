//! Resource Paths
//!
//! Hierarchical capability identifiers. A path provides every path below it:
//! `/gem` provides `/gem/list`. Ordering follows the hierarchy, so two paths on
//! different branches have no order at all.

use crate::error::PathError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

const SEPARATOR: char = '/';

/// Result of comparing two resource paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOrdering {
    /// `self` is a strict descendant of `other`
    Less,
    Equal,
    /// `self` is a strict ancestor of `other`
    Greater,
    Incomparable,
}

/// Hierarchical resource identifier rooted at `/`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// The root path `/`, which provides everything.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parse a path such as `/test/resource`.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let Some(rest) = text.strip_prefix(SEPARATOR) else {
            return Err(PathError::Format(
                text.to_string(),
                "must begin with '/'",
            ));
        };
        let rest = rest.strip_suffix(SEPARATOR).unwrap_or(rest);
        if rest.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for segment in rest.split(SEPARATOR) {
            if segment.is_empty() {
                return Err(PathError::Format(text.to_string(), "empty segment"));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Build a path from literal segments known to be well formed.
    pub(crate) fn from_static(segments: &[&'static str]) -> Self {
        debug_assert!(segments.iter().all(|s| !s.is_empty() && !s.contains(SEPARATOR)));
        Self {
            segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Append one segment. Separators inside `segment` are rejected.
    pub fn join(&self, segment: &str) -> Result<Self, PathError> {
        if segment.is_empty() || segment.contains(SEPARATOR) {
            return Err(PathError::Format(
                format!("{}/{}", self, segment),
                "segment must be non-empty and contain no '/'",
            ));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// `self ⊇ other`: self is an ancestor of, or equal to, `other`.
    pub fn is_ancestor_or_equal(&self, other: &ResourcePath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    pub fn is_descendant_or_equal(&self, other: &ResourcePath) -> bool {
        other.is_ancestor_or_equal(self)
    }

    /// Alias for [`is_ancestor_or_equal`](Self::is_ancestor_or_equal) in capability terms.
    pub fn provides(&self, other: &ResourcePath) -> bool {
        self.is_ancestor_or_equal(other)
    }

    /// True when either path contains the other.
    pub fn overlaps(&self, other: &ResourcePath) -> bool {
        self.is_ancestor_or_equal(other) || other.is_ancestor_or_equal(self)
    }

    pub fn compare(&self, other: &ResourcePath) -> PathOrdering {
        if self.segments == other.segments {
            PathOrdering::Equal
        } else if self.is_ancestor_or_equal(other) {
            PathOrdering::Greater
        } else if other.is_ancestor_or_equal(self) {
            PathOrdering::Less
        } else {
            PathOrdering::Incomparable
        }
    }

    /// Like [`compare`](Self::compare) but unrelated paths are an error.
    pub fn try_compare(&self, other: &ResourcePath) -> Result<Ordering, PathError> {
        self.partial_cmp(other)
            .ok_or_else(|| PathError::Incomparable(self.to_string(), other.to_string()))
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            PathOrdering::Less => Some(Ordering::Less),
            PathOrdering::Equal => Some(Ordering::Equal),
            PathOrdering::Greater => Some(Ordering::Greater),
            PathOrdering::Incomparable => None,
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "{}", SEPARATOR);
        }
        for segment in &self.segments {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}

impl FromStr for ResourcePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
