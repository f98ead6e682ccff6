//! Tunable quantities for the director and its stages.
//!
//! Every set follows the same override discipline: a non-zero field in the
//! incoming set replaces the corresponding field here, and zero fields are
//! left alone.  Overriding a set with itself, or with a zeroed set, is a
//! no-op.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A per-job timeout.  The zero timeout means "no timeout".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timeout(pub Duration);

impl Timeout {
    pub fn new(d: Duration) -> Self {
        Self(d)
    }

    pub fn is_active(self) -> bool {
        !self.0.is_zero()
    }

    /// The timeout as a duration, if active.
    pub fn duration(self) -> Option<Duration> {
        self.is_active().then_some(self.0)
    }

    fn override_with(&mut self, new: Timeout) {
        if new.is_active() {
            *self = new;
        }
    }
}

fn override_usize(old: &mut usize, new: usize) {
    if new != 0 {
        *old = new;
    }
}

/// Quantities for one half of the machine stage (batch compiler or runner).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSet {
    /// Per-job timeout.
    #[serde(default)]
    pub timeout: Timeout,
    /// Number of parallel workers.
    #[serde(default)]
    pub nworkers: usize,
}

impl BatchSet {
    pub fn override_with(&mut self, new: &BatchSet) {
        self.timeout.override_with(new.timeout);
        override_usize(&mut self.nworkers, new.nworkers);
    }
}

/// Quantities for the machine-local stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachNodeSet {
    #[serde(default)]
    pub compiler: BatchSet,
    #[serde(default)]
    pub runner: BatchSet,
}

impl MachNodeSet {
    pub fn override_with(&mut self, new: &MachNodeSet) {
        self.compiler.override_with(&new.compiler);
        self.runner.override_with(&new.runner);
    }
}

/// Quantities for the fuzz stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzSet {
    /// Number of fuzzed variants made from each subject per cycle.
    #[serde(default)]
    pub subject_cycles: usize,
    /// Required minimum size of the post-fuzz corpus, if non-zero.
    #[serde(default)]
    pub corpus_size: usize,
    #[serde(default)]
    pub nworkers: usize,
}

impl FuzzSet {
    pub fn override_with(&mut self, new: &FuzzSet) {
        override_usize(&mut self.subject_cycles, new.subject_cycles);
        override_usize(&mut self.corpus_size, new.corpus_size);
        override_usize(&mut self.nworkers, new.nworkers);
    }
}

/// Quantities for the planner stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSet {
    #[serde(default)]
    pub nworkers: usize,
}

impl PlanSet {
    pub fn override_with(&mut self, new: &PlanSet) {
        override_usize(&mut self.nworkers, new.nworkers);
    }
}

/// Quantities for the analyser stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSet {
    #[serde(default)]
    pub nworkers: usize,
}

impl AnalysisSet {
    pub fn override_with(&mut self, new: &AnalysisSet) {
        override_usize(&mut self.nworkers, new.nworkers);
    }
}

/// The quantities applying to each machine's pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSet {
    #[serde(default)]
    pub fuzz: FuzzSet,
    #[serde(default)]
    pub mach: MachNodeSet,
}

impl MachineSet {
    pub fn override_with(&mut self, new: &MachineSet) {
        self.fuzz.override_with(&new.fuzz);
        self.mach.override_with(&new.mach);
    }
}

/// The root quantity set held by the director.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSet {
    #[serde(default)]
    pub machine: MachineSet,
    #[serde(default)]
    pub plan: PlanSet,
    #[serde(default)]
    pub analysis: AnalysisSet,
    /// Number of cycles each machine loop runs; zero means "run forever".
    #[serde(default)]
    pub cycles: usize,
}

impl RootSet {
    pub fn override_with(&mut self, new: &RootSet) {
        self.machine.override_with(&new.machine);
        self.plan.override_with(&new.plan);
        self.analysis.override_with(&new.analysis);
        override_usize(&mut self.cycles, new.cycles);
    }
}
