//! Test subjects: one logical test case plus everything derived from it over
//! a single plan.

pub mod corpus;
pub mod normaliser;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    id::Id, litmus::Statset, mutation::HitMap, obs::Obs, recipe::Recipe, status::Status,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubjectError {
    #[error("duplicate compile result for compiler {0:?}")]
    DuplicateCompile(String),
    #[error("duplicate recipe for arch {0:?}")]
    DuplicateRecipe(String),
    #[error("duplicate run result for compiler {0:?}")]
    DuplicateRun(String),
    #[error("no compile result for compiler {0:?}")]
    MissingCompile(String),
    #[error("no recipe for arch {0:?}")]
    MissingRecipe(String),
    #[error("no run result for compiler {0:?}")]
    MissingRun(String),
    #[error("subject has no usable litmus file")]
    NoBestLitmus,
}

/// Where a subject's current testable file lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    #[default]
    Orig,
    Fuzz,
}

/// The fuzzing record of a subject, if it has been fuzzed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fuzz {
    /// Path of the fuzzed litmus file.
    pub litmus: PathBuf,
    /// Path of the fuzzer's trace output.
    #[serde(default, skip_serializing_if = "is_empty_path")]
    pub trace: PathBuf,
    #[serde(default, skip_serializing_if = "Statset::is_empty")]
    pub stats: Statset,
}

fn is_empty_path(p: &Path) -> bool {
    p.as_os_str().is_empty()
}

/// The files a compile produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileFileset {
    #[serde(default, skip_serializing_if = "is_empty_path")]
    pub bin: PathBuf,
    #[serde(default, skip_serializing_if = "is_empty_path")]
    pub log: PathBuf,
}

/// The outcome of one compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResult {
    pub status: Status,
    #[serde(default)]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "fileset_is_empty")]
    pub files: CompileFileset,
}

fn fileset_is_empty(f: &CompileFileset) -> bool {
    is_empty_path(&f.bin) && is_empty_path(&f.log)
}

/// The outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: Status,
    #[serde(default)]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obs: Option<Obs>,
    /// Mutant hit counts scanned from the run's stderr.
    #[serde(default, skip_serializing_if = "HitMap::is_empty")]
    pub mutant_hits: HitMap,
}

/// A single test subject.
///
/// The `recipes`, `compiles` and `runs` maps are append-only: inserting a
/// duplicate key fails, keeping results from distinct workers from silently
/// clobbering each other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// Path of the original, unmodified litmus file.
    pub orig_litmus: PathBuf,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Statset::is_empty")]
    pub stats: Statset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuzz: Option<Fuzz>,
    /// Recipes keyed by the string form of their architecture ID.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recipes: BTreeMap<String, Recipe>,
    /// Compile results keyed by the string form of their compiler ID.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub compiles: BTreeMap<String, CompileResult>,
    /// Run results keyed by the string form of their compiler ID.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runs: BTreeMap<String, RunResult>,
}

impl Subject {
    pub fn new(orig_litmus: impl Into<PathBuf>) -> Self {
        Self {
            orig_litmus: orig_litmus.into(),
            ..Self::default()
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.stats.threads = threads;
        self
    }

    /// The best litmus file to feed into further stages: the fuzz output if
    /// present, else the original.
    pub fn best_litmus(&self) -> Result<&Path, SubjectError> {
        match &self.fuzz {
            Some(fuzz) if !is_empty_path(&fuzz.litmus) => Ok(&fuzz.litmus),
            _ if !is_empty_path(&self.orig_litmus) => Ok(&self.orig_litmus),
            _ => Err(SubjectError::NoBestLitmus),
        }
    }

    pub fn recipe_for(&self, arch: &Id) -> Result<&Recipe, SubjectError> {
        let key = arch.to_string();
        self.recipes
            .get(&key)
            .ok_or(SubjectError::MissingRecipe(key))
    }

    pub fn compile_for(&self, cid: &Id) -> Result<&CompileResult, SubjectError> {
        let key = cid.to_string();
        self.compiles
            .get(&key)
            .ok_or(SubjectError::MissingCompile(key))
    }

    pub fn run_for(&self, cid: &Id) -> Result<&RunResult, SubjectError> {
        let key = cid.to_string();
        self.runs.get(&key).ok_or(SubjectError::MissingRun(key))
    }

    pub fn add_recipe(&mut self, arch: &Id, recipe: Recipe) -> Result<(), SubjectError> {
        let key = arch.to_string();
        if self.recipes.contains_key(&key) {
            return Err(SubjectError::DuplicateRecipe(key));
        }
        self.recipes.insert(key, recipe);
        Ok(())
    }

    pub fn add_compile(&mut self, cid: &Id, result: CompileResult) -> Result<(), SubjectError> {
        let key = cid.to_string();
        if self.compiles.contains_key(&key) {
            return Err(SubjectError::DuplicateCompile(key));
        }
        self.compiles.insert(key, result);
        Ok(())
    }

    /// Adds a run result; there must already be a compile result for `cid`.
    pub fn add_run(&mut self, cid: &Id, result: RunResult) -> Result<(), SubjectError> {
        let key = cid.to_string();
        if !self.compiles.contains_key(&key) {
            return Err(SubjectError::MissingCompile(key));
        }
        if self.runs.contains_key(&key) {
            return Err(SubjectError::DuplicateRun(key));
        }
        self.runs.insert(key, result);
        Ok(())
    }
}

/// A subject together with its corpus name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedSubject {
    pub name: String,
    #[serde(flatten)]
    pub subject: Subject,
}
