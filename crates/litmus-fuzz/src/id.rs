//! Dot-delimited identifiers for machines, compilers, architectures, and
//! backends.
//!
//! An ID is an ordered sequence of non-empty lowercase tags, written
//! `gcc.8.x86`.  The empty ID is legal and serves as a wildcard in several
//! places (for instance, machine filtering).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The separator between tags in an ID's string form.
pub const SEP: char = '.';

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    #[error("tag is empty")]
    EmptyTag,
    #[error("tag {0:?} contains the separator")]
    TagHasSep(String),
}

/// A validated, dot-delimited identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id {
    tags: Vec<String>,
}

impl Id {
    /// Builds an ID from an iterable of tags, validating each.
    ///
    /// Tags are trimmed and lowercased.  A single empty tag normalises to
    /// the empty ID.
    pub fn new<I, T>(tags: I) -> Result<Self, IdError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let raw: Vec<_> = tags.into_iter().collect();
        if let [only] = raw.as_slice()
            && only.as_ref().is_empty()
        {
            return Ok(Self::default());
        }
        let tags = raw
            .iter()
            .map(|t| validate_tag(t.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { tags })
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Appends `other` onto this ID, yielding a new ID.
    pub fn join(&self, other: &Id) -> Id {
        if self.is_empty() {
            return other.clone();
        }
        let mut tags = self.tags.clone();
        tags.extend(other.tags.iter().cloned());
        Id { tags }
    }

    /// Whether `prefix`'s tags are a leading subsequence of this ID's.
    pub fn has_prefix(&self, prefix: &Id) -> bool {
        self.tags.len() >= prefix.tags.len() && self.tags[..prefix.tags.len()] == prefix.tags[..]
    }

    /// Matches this ID against a glob ID whose final tag may be `*`.
    ///
    /// A glob without a `*` matches by equality; the empty glob matches
    /// everything.
    pub fn matches_glob(&self, glob: &Id) -> bool {
        if glob.is_empty() {
            return true;
        }
        match glob.tags.split_last() {
            Some((last, rest)) if last == "*" => {
                self.tags.len() >= rest.len() && self.tags[..rest.len()] == rest[..]
            }
            _ => self == glob,
        }
    }
}

fn validate_tag(tag: &str) -> Result<String, IdError> {
    let tag = tag.trim().to_lowercase();
    if tag.is_empty() {
        return Err(IdError::EmptyTag);
    }
    if tag.contains(SEP) {
        return Err(IdError::TagHasSep(tag));
    }
    Ok(tag)
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::new(s.split(SEP))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tags.join(&SEP.to_string()))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Shorthand for building an ID from a literal known to be valid.
///
/// Panics on invalid input, so only use this with trusted strings (tests,
/// built-in defaults).
pub fn id(s: &str) -> Id {
    s.parse().unwrap_or_else(|e| panic!("bad literal id {s:?}: {e}"))
}
