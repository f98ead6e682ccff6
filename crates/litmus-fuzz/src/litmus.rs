//! Litmus test records and their statistics.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{id::Id, sync::Context};

/// A litmus test on disk, with any statistics dumped for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Litmus {
    /// Slashed path to the litmus file.
    pub path: PathBuf,
    /// Architecture of the test (`c` for C litmus tests).
    #[serde(default, skip_serializing_if = "Id::is_empty")]
    pub arch: Id,
    #[serde(default, skip_serializing_if = "Statset::is_empty")]
    pub stats: Statset,
}

impl Litmus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.stats.threads = threads;
        self
    }

    pub fn has_path(&self) -> bool {
        !self.path.as_os_str().is_empty()
    }
}

/// Statistics over one litmus test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statset {
    /// Number of threads in the test.
    #[serde(default)]
    pub threads: usize,
    /// Number of return statements.
    #[serde(default)]
    pub returns: u64,
    /// Counts of atomic expressions, keyed by type name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub atomics: BTreeMap<String, u64>,
    /// Counts of memory orders used by those atomics.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mem_orders: BTreeMap<String, u64>,
}

impl Statset {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The ability to dump statistics for a litmus file into a statset.
pub trait StatDumper {
    fn dump_stats(
        &self,
        ctx: &Context,
        stats: &mut Statset,
        path: &std::path::Path,
    ) -> Result<(), StatError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StatError {
    #[error("stat dump failed: {0}")]
    Driver(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
