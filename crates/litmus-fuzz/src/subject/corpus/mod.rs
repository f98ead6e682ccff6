//! Corpora: name-keyed subject collections with deterministic iteration.

pub mod builder;

use std::collections::{BTreeMap, btree_map};

use serde::{Deserialize, Serialize};

use crate::subject::{NamedSubject, Subject};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CorpusError {
    #[error("corpus is empty or missing")]
    None,
    #[error("corpus too small: got {got}, need {want}")]
    Small { got: usize, want: usize },
    #[error("subject {0:?} already in corpus")]
    DuplicateAdd(String),
}

/// A corpus of subjects, keyed by name.
///
/// Iteration is always in name order, which is what makes downstream
/// analyses deterministic for a given request set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Corpus(BTreeMap<String, Subject>);

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subject, failing if the name is already taken.
    pub fn add(&mut self, name: impl Into<String>, subject: Subject) -> Result<(), CorpusError> {
        let name = name.into();
        if self.0.contains_key(&name) {
            return Err(CorpusError::DuplicateAdd(name));
        }
        self.0.insert(name, subject);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Subject> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Subject> {
        self.0.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Subject names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Subject> {
        self.0.iter()
    }

    /// Errors unless the corpus has at least `want` subjects.
    pub fn check_size(&self, want: usize) -> Result<(), CorpusError> {
        if self.is_empty() {
            return Err(CorpusError::None);
        }
        if self.len() < want {
            return Err(CorpusError::Small {
                got: self.len(),
                want,
            });
        }
        Ok(())
    }
}

impl IntoIterator for Corpus {
    type Item = (String, Subject);
    type IntoIter = btree_map::IntoIter<String, Subject>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Corpus {
    type Item = (&'a String, &'a Subject);
    type IntoIter = btree_map::Iter<'a, String, Subject>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(String, Subject)> for Corpus {
    fn from_iter<T: IntoIterator<Item = (String, Subject)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromIterator<NamedSubject> for Corpus {
    fn from_iter<T: IntoIterator<Item = NamedSubject>>(iter: T) -> Self {
        iter.into_iter().map(|ns| (ns.name, ns.subject)).collect()
    }
}
