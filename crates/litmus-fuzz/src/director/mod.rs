//! The director: one pipeline per machine, run for a configured number of
//! cycles.

pub mod pathset;

use std::{path::PathBuf, sync::Arc};

use tracing::info;

use crate::{
    id::Id,
    litmus::StatDumper,
    machine::{Machine, MachineMap, filter_machines},
    mutation,
    observer::{CycleId, Observers},
    plan::{
        analysis::filter::{FilterError, FilterSet},
        stage::Stage,
    },
    quantity::RootSet,
    service::compiler::Inspector,
    stage::{
        ConfigError, StageError, StageRunner,
        analyser::Analyser,
        fuzzer::{Fuzzer, SingleFuzzer},
        invoker::{Invoker, RunnerFactory},
        lifter::{Lifter, SingleLifter},
        perturber::Perturber,
        planner::{Planner, Source},
    },
    sync::{Context, SessionError},
};

use pathset::{Pathset, Scratch};

#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The external collaborators a director needs.
///
/// Fields are optional so the CLI can assemble them piecemeal; `check`
/// reports the first missing one.
#[derive(Clone, Default)]
pub struct Env {
    pub fuzzer: Option<Arc<dyn SingleFuzzer>>,
    pub stat_dumper: Option<Arc<dyn StatDumper + Send + Sync>>,
    pub lifter: Option<Arc<dyn SingleLifter>>,
    pub inspector: Option<Arc<dyn Inspector + Send + Sync>>,
    pub source: Option<Source>,
    pub runner_factory: Option<Arc<dyn RunnerFactory>>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("director::Env")
    }
}

impl Env {
    /// Resolves every collaborator, reporting the first missing one.
    fn into_checked(self) -> Result<CheckedEnv, ConfigError> {
        Ok(CheckedEnv {
            fuzzer: self.fuzzer.ok_or(ConfigError::FuzzerNil)?,
            stat_dumper: self.stat_dumper.ok_or(ConfigError::StatDumperNil)?,
            lifter: self.lifter.ok_or(ConfigError::LifterNil)?,
            inspector: self.inspector.ok_or(ConfigError::CInspectorNil)?,
            source: self.source.ok_or(ConfigError::PlannerSourceNil)?,
            runner_factory: self.runner_factory.ok_or(ConfigError::PlannerSourceNil)?,
        })
    }
}

/// An [`Env`] with every collaborator present.
#[derive(Clone)]
struct CheckedEnv {
    fuzzer: Arc<dyn SingleFuzzer>,
    stat_dumper: Arc<dyn StatDumper + Send + Sync>,
    lifter: Arc<dyn SingleLifter>,
    inspector: Arc<dyn Inspector + Send + Sync>,
    source: Source,
    runner_factory: Arc<dyn RunnerFactory>,
}

impl std::fmt::Debug for CheckedEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("director::CheckedEnv")
    }
}

/// Static configuration for a director.
#[derive(Debug, Default)]
pub struct Config {
    pub machines: MachineMap,
    /// Optional glob restricting which machines run.
    pub machine_filter: Id,
    pub out_dir: PathBuf,
    /// The litmus files seeding each cycle's corpus.
    pub input_files: Vec<PathBuf>,
    pub quantities: RootSet,
    /// Optional filter file for the analyser.
    pub filter_file: Option<PathBuf>,
    pub mutation: mutation::Config,
    /// Fail cycles whose analysis contains bad outcomes.
    pub error_on_bad_status: bool,
    /// Archive failing subjects under the output directory.
    pub save_failures: bool,
}

/// Drives per-machine pipelines in parallel cycles.
#[derive(Debug)]
pub struct Director {
    machines: MachineMap,
    env: CheckedEnv,
    paths: Pathset,
    quantities: RootSet,
    observers: Observers,
    filters: Arc<FilterSet>,
    mutation: mutation::Config,
    input_files: Vec<PathBuf>,
    error_on_bad_status: bool,
    save_failures: bool,
}

impl Director {
    pub fn new(config: Config, env: Env, observers: Observers) -> Result<Self, DirectorError> {
        let env = env.into_checked()?;
        if config.out_dir.as_os_str().is_empty() {
            return Err(ConfigError::NoOutDir.into());
        }
        let machines = filter_machines(config.machines, &config.machine_filter);
        if machines.is_empty() {
            return Err(ConfigError::NoMachines.into());
        }
        let filters = match &config.filter_file {
            Some(path) => FilterSet::load(path)?,
            None => FilterSet::empty(),
        };
        Ok(Self {
            machines,
            env,
            paths: Pathset::new(config.out_dir),
            quantities: config.quantities,
            observers,
            filters: Arc::new(filters),
            mutation: config.mutation,
            input_files: config.input_files,
            error_on_bad_status: config.error_on_bad_status,
            save_failures: config.save_failures,
        })
    }

    /// Runs every machine loop to completion.
    ///
    /// Loops are independent: one machine failing does not stop the others.
    /// Cancellation stops everything and reports `Cancelled`.
    pub fn run(&self, ctx: &Context) -> Result<(), DirectorError> {
        let results: Vec<(Id, Result<(), StageError>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .machines
                .iter()
                .map(|(id, machine)| {
                    let handle =
                        scope.spawn(move || self.machine_loop(ctx, id, machine));
                    (id.clone(), handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(id, h)| {
                    let res = h
                        .join()
                        .unwrap_or_else(|_| panic!("machine loop panicked"));
                    (id, res)
                })
                .collect()
        });

        if ctx.is_cancelled() {
            return Err(SessionError::Cancelled.into());
        }
        for (id, result) in results {
            if let Err(e) = result {
                info!(machine = %id, "machine loop ended with error");
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn machine_loop(&self, ctx: &Context, id: &Id, machine: &Machine) -> Result<(), StageError> {
        let scratch = Arc::new(self.paths.scratch(id));
        scratch.prepare()?;

        let planner = Planner::new(
            self.env.source.clone(),
            self.env.stat_dumper.clone(),
            self.input_files.clone(),
            self.mutation.clone(),
        );

        let cycles = self.quantities.cycles;
        let mut iter = 0;
        while cycles == 0 || iter < cycles {
            ctx.check()?;
            let cycle = CycleId {
                machine: id.clone(),
                iter,
            };
            self.observers.on_cycle_start(&cycle);
            match self.run_cycle(ctx, &cycle, id, machine, &scratch, &planner) {
                Ok(()) => self.observers.on_cycle_finish(&cycle),
                Err(e) => {
                    self.observers.on_cycle_error(&cycle, &e.to_string());
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
            iter += 1;
        }
        Ok(())
    }

    fn run_cycle(
        &self,
        ctx: &Context,
        cycle: &CycleId,
        id: &Id,
        machine: &Machine,
        scratch: &Arc<Scratch>,
        planner: &Planner,
    ) -> Result<(), StageError> {
        let mut plan = planner.plan(ctx, id, machine)?;
        plan.write_file(&scratch.plan_file(Stage::Plan))?;

        for mut runner in self.pipeline(scratch)? {
            let stage = runner.stage();
            self.observers.on_stage_start(cycle, stage);
            plan = runner.run(ctx, plan)?;
            plan.write_file(&scratch.plan_file(stage))?;
            self.observers.on_stage_finish(cycle, stage);
        }
        Ok(())
    }

    /// The ordered stage registry: one entry per pipeline stage, in the
    /// order [`Stage::PIPELINE`] declares.
    fn pipeline(&self, scratch: &Arc<Scratch>) -> Result<Vec<Box<dyn StageRunner>>, StageError> {
        let runners: Vec<Box<dyn StageRunner>> = vec![
            Box::new(Perturber::new(Some(self.env.inspector.clone()))?),
            Box::new(Fuzzer::new(
                Some(self.env.fuzzer.clone()),
                Some(self.env.stat_dumper.clone()),
                scratch.clone(),
                self.quantities.machine.fuzz,
                self.observers.clone(),
            )?),
            Box::new(Lifter::new(
                Some(self.env.lifter.clone()),
                scratch.clone(),
                self.quantities.machine.fuzz.nworkers,
                self.observers.clone(),
            )?),
            Box::new(Invoker::new(
                self.env.runner_factory.clone(),
                self.observers.clone(),
            )),
            Box::new(
                Analyser::new(self.observers.clone())
                    .with_quantities(self.quantities.analysis)
                    .with_filters(self.filters.clone())
                    .error_on_bad_status(self.error_on_bad_status)
                    .saving_to(self.save_failures.then(|| self.paths.saved())),
            ),
        ];
        debug_assert!(
            runners.iter().map(|r| r.stage()).eq(Stage::PIPELINE),
            "stage registry out of order"
        );
        Ok(runners)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use super::*;
    use crate::{
        id::id,
        obs::{Flag, Obs},
        observer::Observer,
        plan::Plan,
        quantity::{FuzzSet, MachineSet},
        service::backend::ObsParseError,
        stage::{
            fuzzer::NopFuzzer,
            invoker::{InvokeError, MachineRunner, Pipeset},
            lifter::SingleLifter,
            mach::{Mach, interpreter::tests::ScriptedDriver, node_observers, runner::{ObsParser, RunDriver}},
            planner::{BackendFinder, CompilerLister},
        },
    };

    struct FixedSource;

    impl CompilerLister for FixedSource {
        fn list_compilers(
            &self,
            _machine: &Id,
        ) -> Result<std::collections::BTreeMap<Id, crate::service::compiler::Compiler>, crate::service::DriverError>
        {
            Ok([(
                id("gcc"),
                crate::service::compiler::Compiler {
                    style: id("gcc"),
                    arch: id("x86"),
                    ..Default::default()
                },
            )]
            .into())
        }
    }

    impl BackendFinder for FixedSource {
        fn find_backend(
            &self,
            _machine: &Machine,
        ) -> Result<crate::service::backend::Spec, crate::service::DriverError> {
            Ok(crate::service::backend::Spec {
                style: id("herd"),
                run: None,
            })
        }
    }

    struct UnitInspector;

    impl Inspector for UnitInspector {
        fn default_opt_levels(
            &self,
            _c: &crate::service::compiler::Compiler,
        ) -> Result<std::collections::BTreeMap<String, crate::service::compiler::optlevel::Level>, crate::service::compiler::InspectError>
        {
            Ok([("2".to_owned(), Default::default())].into())
        }

        fn opt_levels(
            &self,
            c: &crate::service::compiler::Compiler,
        ) -> Result<std::collections::BTreeMap<String, crate::service::compiler::optlevel::Level>, crate::service::compiler::InspectError>
        {
            self.default_opt_levels(c)
        }

        fn default_marches(
            &self,
            _c: &crate::service::compiler::Compiler,
        ) -> Result<std::collections::BTreeSet<String>, crate::service::compiler::InspectError>
        {
            Ok(["native".to_owned()].into())
        }
    }

    struct UnitDumper;

    impl StatDumper for UnitDumper {
        fn dump_stats(
            &self,
            _ctx: &Context,
            stats: &mut crate::litmus::Statset,
            _path: &std::path::Path,
        ) -> Result<(), crate::litmus::StatError> {
            stats.threads = 2;
            Ok(())
        }
    }

    struct UnitLifter;

    impl SingleLifter for UnitLifter {
        fn lift(
            &self,
            _ctx: &Context,
            job: &crate::service::backend::LiftJob,
        ) -> Result<crate::recipe::Recipe, crate::service::backend::LiftError> {
            Ok(
                crate::recipe::Recipe::new(job.output.dir.clone(), crate::recipe::OutputKind::Executable)
                    .with_files(["main.c"])
                    .compile_all_c_to_exe(),
            )
        }
    }

    struct SatParser;

    impl ObsParser for SatParser {
        fn parse_obs(
            &self,
            r: &mut dyn std::io::BufRead,
        ) -> Result<Obs, ObsParseError> {
            let mut text = String::new();
            r.read_to_string(&mut text)
                .map_err(|e| ObsParseError(e.to_string()))?;
            if text.contains("sat") {
                Ok(Obs {
                    flags: Flag::SAT,
                    states: Vec::new(),
                })
            } else {
                Err(ObsParseError("no verdict".into()))
            }
        }
    }

    struct SatRunDriver;

    impl RunDriver for SatRunDriver {
        fn run_binary(
            &self,
            _ctx: &Context,
            _bin: &std::path::Path,
            _timeout: crate::quantity::Timeout,
            stdout: &mut dyn Write,
            _stderr: &mut dyn Write,
        ) -> Result<(), crate::service::DriverError> {
            stdout.write_all(b"sat\n").unwrap();
            Ok(())
        }
    }

    /// Runs the whole machine-local stage on a thread over real pipes,
    /// standing in for a spawned machine-node process.
    struct InProcessFactory {
        scratch: Arc<Scratch>,
    }

    struct InProcessRunner {
        scratch: Arc<Scratch>,
        handle: Option<std::thread::JoinHandle<Result<(), StageError>>>,
    }

    impl RunnerFactory for InProcessFactory {
        fn make_runner(&self, _plan: &Plan) -> Result<Box<dyn MachineRunner>, InvokeError> {
            Ok(Box::new(InProcessRunner {
                scratch: self.scratch.clone(),
                handle: None,
            }))
        }
    }

    impl MachineRunner for InProcessRunner {
        fn start(&mut self) -> Result<Pipeset, InvokeError> {
            let (stdin_r, stdin_w) = std::io::pipe()?;
            let (stdout_r, stdout_w) = std::io::pipe()?;
            let (stderr_r, stderr_w) = std::io::pipe()?;
            let scratch = self.scratch.clone();
            self.handle = Some(std::thread::spawn(move || {
                let (observers, forward) = node_observers(stderr_w);
                let mut mach = Mach::new(
                    Some(Arc::new(ScriptedDriver::default())),
                    scratch,
                    Arc::new(SatParser),
                    Arc::new(SatRunDriver),
                    Default::default(),
                    observers,
                )?;
                mach.run_node(&Context::background(), stdin_r, stdout_w, &forward)
            }));
            Ok(Pipeset {
                stdin: Box::new(stdin_w),
                stdout: Box::new(stdout_r),
                stderr: Box::new(stderr_r),
            })
        }

        fn wait(&mut self) -> Result<(), InvokeError> {
            match self.handle.take() {
                Some(h) => h
                    .join()
                    .map_err(|_| InvokeError::NodeFailed("panicked".into()))?
                    .map_err(|e| InvokeError::NodeFailed(e.to_string())),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct CycleCounter {
        finished: Mutex<usize>,
        errors: Mutex<Vec<String>>,
    }

    impl Observer for CycleCounter {
        fn on_cycle_finish(&self, _cycle: &CycleId) {
            *self.finished.lock().unwrap() += 1;
        }

        fn on_cycle_error(&self, _cycle: &CycleId, err: &str) {
            self.errors.lock().unwrap().push(err.to_owned());
        }
    }

    fn env(scratch: Arc<Scratch>) -> Env {
        Env {
            fuzzer: Some(Arc::new(NopFuzzer)),
            stat_dumper: Some(Arc::new(UnitDumper)),
            lifter: Some(Arc::new(UnitLifter)),
            inspector: Some(Arc::new(UnitInspector)),
            source: Some(Source {
                compilers: Arc::new(FixedSource),
                backends: Arc::new(FixedSource),
            }),
            runner_factory: Some(Arc::new(InProcessFactory { scratch })),
        }
    }

    fn config(dir: &std::path::Path, input: PathBuf) -> Config {
        Config {
            machines: [(id("localhost"), Machine::default())].into(),
            out_dir: dir.to_owned(),
            input_files: vec![input],
            quantities: RootSet {
                machine: MachineSet {
                    fuzz: FuzzSet {
                        subject_cycles: 2,
                        nworkers: 2,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                cycles: 1,
                ..Default::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn one_full_cycle_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mp.litmus");
        writeln!(std::fs::File::create(&input).unwrap(), "C mp").unwrap();

        let paths = Pathset::new(dir.path());
        let scratch = Arc::new(paths.scratch(&id("localhost")));

        let counter = Arc::new(CycleCounter::default());
        let director = Director::new(
            config(dir.path(), input),
            env(scratch.clone()),
            Observers::new(vec![counter.clone()]),
        )
        .unwrap();

        director.run(&Context::background()).unwrap();

        assert_eq!(*counter.finished.lock().unwrap(), 1, "errors: {:?}", counter.errors.lock().unwrap());

        // Every stage left its plan snapshot behind.
        for stage in [Stage::Plan, Stage::Perturb, Stage::Fuzz, Stage::Lift, Stage::Invoke, Stage::Analyse] {
            assert!(
                scratch.plan_file(stage).exists(),
                "missing plan file for {stage}"
            );
        }

        // The final plan has run results for both fuzzed variants.
        let final_plan = Plan::read_file(&scratch.plan_file(Stage::Analyse)).unwrap();
        assert_eq!(final_plan.corpus.len(), 2);
        for (name, subject) in &final_plan.corpus {
            assert!(name.starts_with("mp_"), "unexpected subject {name}");
            assert_eq!(
                subject.run_for(&id("gcc")).unwrap().status,
                crate::status::Status::Ok
            );
        }
    }

    #[test]
    fn missing_env_pieces_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Pathset::new(dir.path());
        let scratch = Arc::new(paths.scratch(&id("localhost")));
        let mut env = env(scratch);
        env.inspector = None;
        let err = Director::new(
            config(dir.path(), dir.path().join("x.litmus")),
            env,
            Observers::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DirectorError::Config(ConfigError::CInspectorNil)
        ));
    }

    #[test]
    fn no_machines_after_filtering_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Pathset::new(dir.path());
        let scratch = Arc::new(paths.scratch(&id("localhost")));
        let mut cfg = config(dir.path(), dir.path().join("x.litmus"));
        cfg.machine_filter = id("nonsuch.*");
        let err = Director::new(cfg, env(scratch), Observers::default()).unwrap_err();
        assert!(matches!(err, DirectorError::Config(ConfigError::NoMachines)));
    }

    #[test]
    fn empty_out_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Pathset::new(dir.path());
        let scratch = Arc::new(paths.scratch(&id("localhost")));
        let mut cfg = config(dir.path(), dir.path().join("x.litmus"));
        cfg.out_dir = PathBuf::new();
        let err = Director::new(cfg, env(scratch), Observers::default()).unwrap_err();
        assert!(matches!(err, DirectorError::Config(ConfigError::NoOutDir)));
    }

    #[test]
    fn cancellation_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mp.litmus");
        writeln!(std::fs::File::create(&input).unwrap(), "C mp").unwrap();
        let paths = Pathset::new(dir.path());
        let scratch = Arc::new(paths.scratch(&id("localhost")));

        let director = Director::new(
            config(dir.path(), input),
            env(scratch),
            Observers::default(),
        )
        .unwrap();

        let (canceller, ctx) = Context::cancellable();
        canceller.cancel();
        let err = director.run(&ctx).unwrap_err();
        assert!(matches!(err, DirectorError::Session(SessionError::Cancelled)));
    }
}
