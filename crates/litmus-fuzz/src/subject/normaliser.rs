//! Path normalisation for archival and transport.
//!
//! A normaliser rewrites a subject's files onto a canonical tree rooted at
//! the subject's name, recording the mapping from each normalised path back
//! to the original.  The mapping must be injective: two distinct originals
//! may never land on the same normalised path.

use std::{collections::BTreeMap, path::{Path, PathBuf}};

use crate::subject::{Subject, corpus::Corpus};

pub const FILE_ORIG_LITMUS: &str = "orig.litmus";
pub const FILE_FUZZ_LITMUS: &str = "fuzz.litmus";
pub const FILE_FUZZ_TRACE: &str = "fuzz.trace";
pub const FILE_BIN: &str = "a.out";
pub const FILE_COMPILE_LOG: &str = "compile.log";
pub const DIR_COMPILES: &str = "compiles";
pub const DIR_RECIPES: &str = "recipes";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormaliseError {
    #[error("path {0:?} already mapped by normaliser")]
    Collision(PathBuf),
}

/// What part of a subject a mapping belongs to.
///
/// Downstream consumers use this to move only subsets of the files (for
/// instance, transporting sources but not binaries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    OrigLitmus,
    Fuzz,
    Compile,
    Recipe,
}

/// One record in the normaliser's mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The original path the normalised one replaces.
    pub original: PathBuf,
    pub kind: Kind,
}

/// Rewrites subject paths under a root, accumulating the mapping table.
#[derive(Debug, Default)]
pub struct Normaliser {
    root: PathBuf,
    /// Maps normalised paths to their originals; keyed this way round so
    /// collisions surface on insert.
    pub mappings: BTreeMap<PathBuf, Entry>,
}

impl Normaliser {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mappings: BTreeMap::new(),
        }
    }

    /// The mappings of one kind, as (normalised, original) pairs.
    pub fn mappings_of_kind(&self, kind: Kind) -> BTreeMap<&Path, &Path> {
        self.mappings
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(n, e)| (n.as_path(), e.original.as_path()))
            .collect()
    }

    /// Normalises every subject in `corpus`, rooting each subject's tree at
    /// its name.  All mappings accumulate into this normaliser.
    pub fn corpus(&mut self, corpus: &Corpus) -> Result<Corpus, NormaliseError> {
        corpus
            .iter()
            .map(|(name, subject)| {
                let mut sub = Normaliser {
                    root: self.root.join(name),
                    mappings: std::mem::take(&mut self.mappings),
                };
                let result = sub.subject(subject);
                self.mappings = sub.mappings;
                Ok((name.clone(), result?))
            })
            .collect()
    }

    /// Normalises one subject's paths, returning the rewritten subject.
    ///
    /// Runs need no normalisation: they carry no files of their own.
    pub fn subject(&mut self, subject: &Subject) -> Result<Subject, NormaliseError> {
        let mut s = subject.clone();
        s.orig_litmus =
            self.replace(&subject.orig_litmus, Kind::OrigLitmus, &[FILE_ORIG_LITMUS])?;
        if let Some(fuzz) = &mut s.fuzz {
            fuzz.litmus = self.replace(&fuzz.litmus, Kind::Fuzz, &[FILE_FUZZ_LITMUS])?;
            fuzz.trace = self.replace(&fuzz.trace, Kind::Fuzz, &[FILE_FUZZ_TRACE])?;
        }
        for (cid, compile) in &mut s.compiles {
            compile.files.bin = self.replace(
                &compile.files.bin,
                Kind::Compile,
                &[DIR_COMPILES, cid, FILE_BIN],
            )?;
            compile.files.log = self.replace(
                &compile.files.log,
                Kind::Compile,
                &[DIR_COMPILES, cid, FILE_COMPILE_LOG],
            )?;
        }
        for (arch, recipe) in &mut s.recipes {
            let new_dir = self.root.join(DIR_RECIPES).join(arch);
            for file in &recipe.files {
                self.add(recipe.dir.join(file), new_dir.join(file), Kind::Recipe)?;
            }
            recipe.dir = new_dir;
        }
        Ok(s)
    }

    /// Maps `original` onto root-joined `segments`, returning the new path.
    /// Empty originals pass through untouched, with no mapping added.
    fn replace(
        &mut self,
        original: &Path,
        kind: Kind,
        segments: &[&str],
    ) -> Result<PathBuf, NormaliseError> {
        if original.as_os_str().is_empty() {
            return Ok(PathBuf::new());
        }
        let mut normalised = self.root.clone();
        normalised.extend(segments);
        self.add(original.to_owned(), normalised.clone(), kind)?;
        Ok(normalised)
    }

    fn add(
        &mut self,
        original: PathBuf,
        normalised: PathBuf,
        kind: Kind,
    ) -> Result<(), NormaliseError> {
        if self.mappings.contains_key(&normalised) {
            return Err(NormaliseError::Collision(normalised));
        }
        self.mappings.insert(normalised, Entry { original, kind });
        Ok(())
    }
}
