//! The fuzz stage: expands each subject into several mutated variants.

use std::{
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Instant,
};

use derive_new::new as New;

use crate::{
    litmus::StatDumper,
    observer::{BuildForward, Observers},
    plan::{Plan, stage::Stage},
    service::DriverError,
    stage::{ConfigError, StageError, StageRunner, confirm},
    subject::{
        Fuzz, NamedSubject, Source, Subject,
        corpus::builder::{self, Request},
    },
    sync::Context,
};

/// How many variants each subject fans out into when not configured.
pub const DEFAULT_SUBJECT_CYCLES: usize = 10;

/// A single-shot fuzzing driver.
pub trait SingleFuzzer: Send + Sync {
    fn fuzz(&self, ctx: &Context, job: &FuzzJob) -> Result<(), DriverError>;
}

/// One fuzzing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzJob {
    /// Seed for the fuzzer's own randomness.
    pub seed: u64,
    pub input: PathBuf,
    pub output_litmus: PathBuf,
    pub output_trace: PathBuf,
}

/// A fuzzer that makes no changes; test scaffolding.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopFuzzer;

impl SingleFuzzer for NopFuzzer {
    fn fuzz(&self, _ctx: &Context, _job: &FuzzJob) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Where the fuzz stage puts its outputs.
pub trait SubjectPather: Send + Sync {
    fn prepare(&self) -> std::io::Result<()>;
    fn subject_litmus(&self, name: &str) -> PathBuf;
    fn subject_trace(&self, name: &str) -> PathBuf;
}

/// The reversible `<subject>_<cycle>` naming of fuzzed variants.
#[derive(Debug, Clone, PartialEq, Eq, New)]
pub struct SubjectCycle {
    pub name: String,
    pub cycle: usize,
}

impl fmt::Display for SubjectCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.cycle)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("name {0:?} is not a subject-cycle name")]
pub struct BadSubjectCycle(String);

impl FromStr for SubjectCycle {
    type Err = BadSubjectCycle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, cycle) = s
            .rsplit_once('_')
            .ok_or_else(|| BadSubjectCycle(s.to_owned()))?;
        let cycle = cycle.parse().map_err(|_| BadSubjectCycle(s.to_owned()))?;
        Ok(Self {
            name: name.to_owned(),
            cycle,
        })
    }
}

/// The fuzz stage itself.
pub struct Fuzzer {
    driver: Arc<dyn SingleFuzzer>,
    dumper: Arc<dyn StatDumper + Send + Sync>,
    paths: Arc<dyn SubjectPather>,
    pub quantities: crate::quantity::FuzzSet,
    observers: Observers,
}

impl fmt::Debug for Fuzzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fuzzer")
            .field("quantities", &self.quantities)
            .finish_non_exhaustive()
    }
}

impl Fuzzer {
    pub fn new(
        driver: Option<Arc<dyn SingleFuzzer>>,
        dumper: Option<Arc<dyn StatDumper + Send + Sync>>,
        paths: Arc<dyn SubjectPather>,
        quantities: crate::quantity::FuzzSet,
        observers: Observers,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            driver: driver.ok_or(ConfigError::FuzzerNil)?,
            dumper: dumper.ok_or(ConfigError::StatDumperNil)?,
            paths,
            quantities,
            observers,
        })
    }

    fn subject_cycles(&self) -> usize {
        match self.quantities.subject_cycles {
            0 => DEFAULT_SUBJECT_CYCLES,
            n => n,
        }
    }

    /// Fuzzes one variant of one subject and submits it to the builder.
    fn fuzz_one(
        &self,
        ctx: &Context,
        name: &str,
        subject: &Subject,
        cycle: usize,
        seed_base: u64,
        tx: &crossbeam_channel::Sender<Request>,
    ) -> Result<(), StageError> {
        ctx.check()?;
        let variant = SubjectCycle::new(name.to_owned(), cycle).to_string();
        let input = subject.best_litmus()?.to_owned();
        let job = FuzzJob {
            seed: derive_seed(seed_base, &variant),
            input: input.clone(),
            output_litmus: self.paths.subject_litmus(&variant),
            output_trace: self.paths.subject_trace(&variant),
        };
        self.driver.fuzz(ctx, &job)?;

        let mut fuzz = Fuzz {
            litmus: job.output_litmus,
            trace: job.output_trace,
            stats: Default::default(),
        };
        self.dumper.dump_stats(ctx, &mut fuzz.stats, &fuzz.litmus)?;

        let fuzzed = Subject {
            orig_litmus: input,
            source: Source::Fuzz,
            stats: fuzz.stats.clone(),
            fuzz: Some(fuzz),
            ..Subject::default()
        };
        Request::add(NamedSubject {
            name: variant,
            subject: fuzzed,
        })
        .send_to(ctx, tx)
        .map_err(StageError::from)
    }
}

/// Mixes the plan seed with a variant name into a per-job fuzzer seed.
fn derive_seed(base: u64, name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    base.hash(&mut hasher);
    name.hash(&mut hasher);
    hasher.finish()
}

impl StageRunner for Fuzzer {
    fn stage(&self) -> Stage {
        Stage::Fuzz
    }

    fn run(&mut self, ctx: &Context, mut plan: Plan) -> Result<Plan, StageError> {
        let start = Instant::now();
        plan.check()?;
        plan.metadata.ensure_stage(Stage::Plan)?;
        self.paths.prepare()?;

        let cycles = self.subject_cycles();
        let nreqs = plan.corpus.len() * cycles;
        let seed_base = plan.metadata.seed;

        let observer = BuildForward(&self.observers);
        let fuzzed = builder::par_build(
            ctx,
            self.quantities.nworkers,
            &plan.corpus,
            builder::Config {
                init: Default::default(),
                name: Stage::Fuzz.to_string(),
                nreqs,
            },
            &observer,
            |ctx, name, subject, tx| {
                for cycle in 0..cycles {
                    self.fuzz_one(ctx, name, subject, cycle, seed_base, tx)?;
                }
                Ok::<_, StageError>(())
            },
        )?;

        fuzzed.check_size(self.quantities.corpus_size.max(1))?;
        plan.corpus = fuzzed;
        confirm(&mut plan, Stage::Fuzz, start)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        litmus::{StatError, Statset},
        plan::mock,
        quantity::FuzzSet,
        subject::corpus::CorpusError,
    };

    #[derive(Debug, Default)]
    struct MapPather;

    impl SubjectPather for MapPather {
        fn prepare(&self) -> std::io::Result<()> {
            Ok(())
        }

        fn subject_litmus(&self, name: &str) -> PathBuf {
            PathBuf::from(format!("fuzz/{name}.litmus"))
        }

        fn subject_trace(&self, name: &str) -> PathBuf {
            PathBuf::from(format!("fuzz/{name}.trace.txt"))
        }
    }

    struct CountingDumper;

    impl StatDumper for CountingDumper {
        fn dump_stats(
            &self,
            _ctx: &Context,
            stats: &mut Statset,
            _path: &std::path::Path,
        ) -> Result<(), StatError> {
            stats.threads = 1;
            Ok(())
        }
    }

    fn fuzzer(quantities: FuzzSet) -> Fuzzer {
        Fuzzer::new(
            Some(Arc::new(NopFuzzer)),
            Some(Arc::new(CountingDumper)),
            Arc::new(MapPather),
            quantities,
            Observers::default(),
        )
        .unwrap()
    }

    #[test]
    fn subject_cycle_name_round_trip() {
        let sc = SubjectCycle {
            name: "mp_test".into(),
            cycle: 7,
        };
        assert_eq!(sc.to_string(), "mp_test_7");
        assert_eq!(sc.to_string().parse::<SubjectCycle>().unwrap(), sc);
        assert!("nounderscore".parse::<SubjectCycle>().is_err());
        assert!("tail_x".parse::<SubjectCycle>().is_err());
    }

    #[test]
    fn nil_driver_is_rejected() {
        let err = Fuzzer::new(
            None,
            Some(Arc::new(CountingDumper)),
            Arc::new(MapPather),
            FuzzSet::default(),
            Observers::default(),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::FuzzerNil);
    }

    #[test]
    fn happy_path_expands_each_subject() {
        let mut stage = fuzzer(FuzzSet {
            subject_cycles: 1,
            nworkers: 3,
            ..FuzzSet::default()
        });
        let input = mock::plan();
        let out = stage.run(&Context::background(), input.clone()).unwrap();

        assert_eq!(out.corpus.len(), input.corpus.len());
        for (name, subject) in &out.corpus {
            let sc: SubjectCycle = name.parse().expect("output name should parse");
            let orig = input
                .corpus
                .get(&sc.name)
                .expect("output should trace back to an input subject");
            assert_eq!(subject.source, Source::Fuzz);
            // The fuzzed-from litmus is the input's best litmus.
            assert_eq!(subject.orig_litmus, orig.best_litmus().unwrap());
            let fuzz = subject.fuzz.as_ref().unwrap();
            assert_eq!(fuzz.litmus, PathBuf::from(format!("fuzz/{name}.litmus")));
        }
        assert!(out.metadata.has_stage(Stage::Fuzz));
    }

    #[test]
    fn small_corpus_fails() {
        let mut stage = fuzzer(FuzzSet {
            subject_cycles: 1,
            corpus_size: 255,
            ..FuzzSet::default()
        });
        let err = stage.run(&Context::background(), mock::plan()).unwrap_err();
        assert!(matches!(
            err,
            StageError::Corpus(CorpusError::Small { want: 255, .. })
        ));
    }

    #[test]
    fn missing_plan_stage_fails() {
        let mut stage = fuzzer(FuzzSet {
            subject_cycles: 1,
            ..FuzzSet::default()
        });
        let mut plan = mock::plan();
        plan.metadata.stages.clear();
        let err = stage.run(&Context::background(), plan).unwrap_err();
        assert!(matches!(
            err,
            StageError::Plan(crate::plan::PlanError::MissingStage(Stage::Plan))
        ));
    }

    #[test]
    fn bad_version_fails() {
        let mut stage = fuzzer(FuzzSet {
            subject_cycles: 1,
            ..FuzzSet::default()
        });
        let mut plan = mock::plan();
        plan.metadata.version = 0;
        let err = stage.run(&Context::background(), plan).unwrap_err();
        assert!(matches!(
            err,
            StageError::Plan(crate::plan::PlanError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn cancelled_context_returns_promptly() {
        let (canceller, ctx) = Context::cancellable();
        canceller.cancel();
        let mut stage = fuzzer(FuzzSet {
            subject_cycles: 1,
            ..FuzzSet::default()
        });
        let err = stage.run(&ctx, mock::plan()).unwrap_err();
        assert!(err.is_fatal());
    }
}
