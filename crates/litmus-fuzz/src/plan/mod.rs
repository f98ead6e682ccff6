//! Test plans: the sole artifact passed between pipeline stages.

pub mod analysis;
pub mod stage;

use std::{
    io::{Read, Write},
    path::Path,
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{
    id::Id,
    machine::NamedMachine,
    mutation,
    service::{backend, compiler::InstanceMap},
    subject::corpus::{Corpus, CorpusError},
};
use stage::{Record, Stage};

/// The schema version this build reads and writes.
///
/// Plans with any other version are rejected outright; the plan format makes
/// no compatibility promises.
pub const CURRENT_VERSION: u32 = 3;

/// Extension used for plan files on disk.
pub const FILE_EXT: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan version mismatch: got {got}, want {want}")]
    VersionMismatch { got: u32, want: u32 },
    #[error("plan is missing stage {0}")]
    MissingStage(Stage),
    #[error("plan already has stage {0}")]
    DuplicateStage(Stage),
    #[error("plan has no backend")]
    NoBackend,
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("plan de/serialisation: {0}")]
    Json(#[from] serde_json::Error),
}

/// Header data for a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,
    /// When the plan was first created.
    pub created: DateTime<Utc>,
    /// Seed for every stochastic choice made over this plan.
    pub seed: u64,
    /// Stage records, in invocation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Record>,
}

impl Metadata {
    /// A fresh metadata block with the given seed, stamped now.
    pub fn new(seed: u64) -> Self {
        Self {
            version: CURRENT_VERSION,
            created: Utc::now(),
            seed,
            stages: Vec::new(),
        }
    }

    /// A metadata block seeded from OS entropy.
    pub fn with_random_seed() -> Self {
        Self::new(rand::random())
    }

    pub fn check_version(&self) -> Result<(), PlanError> {
        if self.version != CURRENT_VERSION {
            return Err(PlanError::VersionMismatch {
                got: self.version,
                want: CURRENT_VERSION,
            });
        }
        Ok(())
    }

    pub fn has_stage(&self, stage: Stage) -> bool {
        self.stages.iter().any(|r| r.stage == stage)
    }

    pub fn ensure_stage(&self, stage: Stage) -> Result<(), PlanError> {
        if self.has_stage(stage) {
            Ok(())
        } else {
            Err(PlanError::MissingStage(stage))
        }
    }

    /// Appends a record for `stage`.
    ///
    /// Fails if the stage is already recorded, or its prerequisite is not.
    pub fn confirm_stage(
        &mut self,
        stage: Stage,
        completed_on: DateTime<Utc>,
        duration: Duration,
    ) -> Result<(), PlanError> {
        if self.has_stage(stage) {
            return Err(PlanError::DuplicateStage(stage));
        }
        if let Some(pre) = stage.prerequisite() {
            self.ensure_stage(pre)?;
        }
        self.stages.push(Record {
            stage,
            completed_on,
            duration,
        });
        Ok(())
    }
}

/// A full test plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub metadata: Metadata,
    pub machine: NamedMachine,
    /// The memory-model backend chosen for this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<backend::Spec>,
    #[serde(default, skip_serializing_if = "InstanceMap::is_empty")]
    pub compilers: InstanceMap,
    #[serde(default, skip_serializing_if = "Corpus::is_empty")]
    pub corpus: Corpus,
    #[serde(default, skip_serializing_if = "mutation_config_is_default")]
    pub mutation: mutation::Config,
}

fn mutation_config_is_default(c: &mutation::Config) -> bool {
    *c == mutation::Config::default()
}

impl Plan {
    /// Checks the plan invariants every stage relies on.
    pub fn check(&self) -> Result<(), PlanError> {
        self.metadata.check_version()?;
        if self.corpus.is_empty() {
            return Err(CorpusError::None.into());
        }
        Ok(())
    }

    /// As [`Plan::check`], but also requires a backend to be planned.
    pub fn check_with_backend(&self) -> Result<&backend::Spec, PlanError> {
        self.check()?;
        self.backend.as_ref().ok_or(PlanError::NoBackend)
    }

    /// The sorted, deduplicated set of architectures across all compilers.
    pub fn arches(&self) -> Vec<Id> {
        use itertools::Itertools;
        self.compilers
            .values()
            .map(|c| c.compiler.arch.clone())
            .sorted()
            .dedup()
            .collect()
    }

    /// A reproducible RNG for this plan.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.metadata.seed)
    }

    /// Number of compiler-subject pairings in the plan.
    pub fn num_compilations(&self) -> usize {
        self.compilers.len() * self.corpus.len()
    }

    pub fn write(&self, w: impl Write) -> Result<(), PlanError> {
        serde_json::to_writer_pretty(w, self)?;
        Ok(())
    }

    pub fn read(r: impl Read) -> Result<Plan, PlanError> {
        let plan: Plan = serde_json::from_reader(r)?;
        plan.metadata.check_version()?;
        Ok(plan)
    }

    /// Writes the plan to `path` atomically (write-to-temp, then rename), so
    /// a cancellation mid-write can never leave a torn plan file.
    pub fn write_file(&self, path: &Path) -> Result<(), PlanError> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = match dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new()?,
        };
        self.write(&mut tmp)?;
        tmp.persist(path).map_err(|e| PlanError::Io(e.error))?;
        Ok(())
    }

    pub fn read_file(path: &Path) -> Result<Plan, PlanError> {
        Self::read(std::fs::File::open(path)?)
    }
}

#[cfg(test)]
pub mod mock {
    //! A mock plan shared by analysis and stage tests.

    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::{
        id::id,
        machine::{Machine, NamedMachine},
        obs::{Flag, Obs},
        service::compiler::{Compiler, Instance},
        status::Status,
        subject::{CompileFileset, CompileResult, RunResult, Subject},
    };

    fn compile(status: Status, log: &str) -> CompileResult {
        CompileResult {
            status,
            duration: Duration::from_millis(200),
            files: CompileFileset {
                bin: "a.out".into(),
                log: log.into(),
            },
        }
    }

    fn run(status: Status, obs: Option<Obs>) -> RunResult {
        RunResult {
            status,
            duration: Duration::from_millis(350),
            obs,
            mutant_hits: Default::default(),
        }
    }

    fn subject(compile_status: Status, run_status: Option<(Status, Option<Obs>)>) -> Subject {
        let cid = id("gcc");
        let mut s = Subject::new("foo.litmus");
        s.add_compile(&cid, compile(compile_status, "")).unwrap();
        if let Some((status, obs)) = run_status {
            s.add_run(&cid, run(status, obs)).unwrap();
        }
        s
    }

    /// A plan with one subject in each of four classification buckets.
    pub fn plan() -> Plan {
        let flagged_obs = Obs {
            flags: Flag::UNSAT,
            states: Vec::new(),
        };
        let mut corpus = Corpus::new();
        corpus
            .add("foo", subject(Status::Ok, Some((Status::Ok, None))))
            .unwrap();
        corpus
            .add("bar", subject(Status::CompileFail, None))
            .unwrap();
        corpus
            .add(
                "baz",
                subject(Status::Ok, Some((Status::Flagged, Some(flagged_obs)))),
            )
            .unwrap();
        corpus
            .add("barbaz", subject(Status::Ok, Some((Status::RunTimeout, None))))
            .unwrap();

        let mut metadata = Metadata {
            version: CURRENT_VERSION,
            created: Utc.with_ymd_and_hms(2021, 5, 26, 12, 0, 0).unwrap(),
            seed: 8675309,
            stages: Vec::new(),
        };
        metadata
            .confirm_stage(Stage::Plan, metadata.created, Duration::from_secs(1))
            .unwrap();

        Plan {
            metadata,
            machine: NamedMachine {
                id: id("localhost"),
                machine: Machine {
                    cores: 4,
                    ssh: None,
                },
            },
            backend: Some(backend::Spec {
                style: id("herd"),
                run: None,
            }),
            compilers: [(
                id("gcc"),
                Instance {
                    compiler: Compiler {
                        style: id("gcc"),
                        arch: id("x86"),
                        ..Compiler::default()
                    },
                    ..Instance::default()
                },
            )]
            .into(),
            corpus,
            mutation: mutation::Config::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::id;

    #[test]
    fn json_round_trip() {
        let plan = mock::plan();
        let mut buf = Vec::new();
        plan.write(&mut buf).unwrap();
        let back = Plan::read(buf.as_slice()).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn read_rejects_version_mismatch() {
        let mut plan = mock::plan();
        plan.metadata.version = CURRENT_VERSION + 1;
        let mut buf = Vec::new();
        plan.write(&mut buf).unwrap();
        assert!(matches!(
            Plan::read(buf.as_slice()),
            Err(PlanError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn check_requires_corpus_and_backend() {
        let mut plan = mock::plan();
        assert!(plan.check_with_backend().is_ok());
        plan.backend = None;
        assert!(matches!(
            plan.check_with_backend(),
            Err(PlanError::NoBackend)
        ));
        plan.corpus = Corpus::new();
        assert!(matches!(
            plan.check(),
            Err(PlanError::Corpus(CorpusError::None))
        ));
    }

    #[test]
    fn confirm_stage_appends_in_order() {
        let mut md = Metadata::new(1);
        md.confirm_stage(Stage::Plan, Utc::now(), Duration::ZERO)
            .unwrap();
        md.confirm_stage(Stage::Perturb, Utc::now(), Duration::ZERO)
            .unwrap();
        assert_eq!(
            md.stages.iter().map(|r| r.stage).collect::<Vec<_>>(),
            vec![Stage::Plan, Stage::Perturb]
        );
    }

    #[test]
    fn confirm_stage_rejects_duplicates_and_gaps() {
        let mut md = Metadata::new(1);
        md.confirm_stage(Stage::Plan, Utc::now(), Duration::ZERO)
            .unwrap();
        assert!(matches!(
            md.confirm_stage(Stage::Plan, Utc::now(), Duration::ZERO),
            Err(PlanError::DuplicateStage(Stage::Plan))
        ));
        assert!(matches!(
            md.confirm_stage(Stage::Fuzz, Utc::now(), Duration::ZERO),
            Err(PlanError::MissingStage(Stage::Perturb))
        ));
    }

    #[test]
    fn arches_deduplicate() {
        let plan = mock::plan();
        assert_eq!(plan.arches(), vec![id("x86")]);
    }

    #[test]
    fn atomic_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let plan = mock::plan();
        plan.write_file(&path).unwrap();
        assert_eq!(Plan::read_file(&path).unwrap(), plan);
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        use rand::Rng;
        let plan = mock::plan();
        let a: u64 = plan.rng().random();
        let b: u64 = plan.rng().random();
        assert_eq!(a, b);
    }
}
