//! The memory-model backend contract: capabilities, lift jobs, and
//! observation parsing.

use std::{io::BufRead, path::PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    id::Id,
    litmus::Litmus,
    obs::Obs,
    recipe::Recipe,
    service::{DriverError, RunInfo},
    sync::Context,
};

bitflags! {
    /// What a backend is able to do.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Capability: u8 {
        /// Can translate litmus tests into recipes.
        const LIFT_LITMUS = 1 << 0;
        /// Can run litmus tests itself, without compilation.
        const RUN_STANDALONE = 1 << 1;
        /// Lifted recipes can produce executables.
        const PRODUCE_EXE = 1 << 2;
        /// Lifted recipes can produce objects.
        const PRODUCE_OBJ = 1 << 3;
    }
}

/// The backend chosen for a machine, as recorded in its plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    /// Style of backend (`herd`, `litmus7`, `rmem`).
    pub style: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunInfo>,
}

/// The kind of input a lift job consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    #[default]
    Litmus,
}

/// The kind of artifact a lift job should produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Let the backend pick its preferred target.
    #[default]
    Default,
    ExeRecipe,
    ObjRecipe,
    Standalone,
}

#[derive(Debug, thiserror::Error)]
pub enum LiftError {
    #[error("bad lift input source")]
    BadSource,
    #[error("bad lift output target")]
    BadTarget,
    #[error("input litmus file path blank")]
    InLitmusBlank,
    #[error("output directory path blank")]
    OutDirBlank,
    #[error("backend does not support this lifting")]
    NotSupported,
    #[error("lift driver: {0}")]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A request to lift one test into a recipe for one architecture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiftJob {
    pub arch: Id,
    pub input: LiftInput,
    pub output: LiftOutput,
}

impl LiftJob {
    pub fn check(&self) -> Result<(), LiftError> {
        self.input.check()?;
        self.output.check()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiftInput {
    #[serde(default)]
    pub source: Source,
    pub litmus: Litmus,
}

impl LiftInput {
    pub fn litmus(litmus: Litmus) -> Self {
        Self {
            source: Source::Litmus,
            litmus,
        }
    }

    pub fn check(&self) -> Result<(), LiftError> {
        match self.source {
            Source::Litmus if !self.litmus.has_path() => Err(LiftError::InLitmusBlank),
            Source::Litmus => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiftOutput {
    /// Directory the lifter writes its files into.
    pub dir: PathBuf,
    #[serde(default)]
    pub target: Target,
}

impl LiftOutput {
    pub fn check(&self) -> Result<(), LiftError> {
        if self.dir.as_os_str().is_empty() {
            return Err(LiftError::OutDirBlank);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("could not parse observation: {0}")]
pub struct ObsParseError(pub String);

/// The abstract backend interface.
pub trait Backend {
    fn capabilities(&self) -> Capability;

    /// The litmus architectures this backend accepts.
    fn litmus_arches(&self) -> Vec<Id>;

    /// Translates the job's test into a recipe rooted at the job's output
    /// directory.
    fn lift(&self, ctx: &Context, job: &LiftJob) -> Result<Recipe, LiftError>;

    /// Parses the observation text a run wrote to stdout.
    fn parse_obs(&self, r: &mut dyn BufRead) -> Result<Obs, ObsParseError>;
}
