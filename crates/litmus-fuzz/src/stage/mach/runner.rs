//! The batch runner: executes compiled subjects and parses their
//! observations.

use std::{
    fmt,
    io::{BufRead, Write},
    path::Path,
    sync::Arc,
    time::Instant,
};

use tracing::debug;

use crate::{
    id::Id,
    mutation,
    obs::Obs,
    observer::{Action, BuildForward, Observers},
    plan::{Plan, stage::Stage},
    quantity::{BatchSet, Timeout},
    service::{DriverError, backend::ObsParseError, process},
    stage::{StageError, StageRunner, confirm},
    status::Status,
    subject::{RunResult, Subject, corpus::builder::{self, Request}},
    sync::Context,
};

/// Parses backend observation text.
pub trait ObsParser: Send + Sync {
    fn parse_obs(&self, r: &mut dyn BufRead) -> Result<Obs, ObsParseError>;
}

/// Executes one compiled binary.
pub trait RunDriver: Send + Sync {
    fn run_binary(
        &self,
        ctx: &Context,
        bin: &Path,
        timeout: Timeout,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<(), DriverError>;
}

/// Runs binaries as plain subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl RunDriver for ProcessRunner {
    fn run_binary(
        &self,
        ctx: &Context,
        bin: &Path,
        timeout: Timeout,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<(), DriverError> {
        process::run(ctx, std::process::Command::new(bin), timeout, stdout, stderr)
    }
}

pub struct BatchRunner {
    parser: Arc<dyn ObsParser>,
    driver: Arc<dyn RunDriver>,
    pub quantities: BatchSet,
    observers: Observers,
}

impl fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRunner")
            .field("quantities", &self.quantities)
            .finish_non_exhaustive()
    }
}

impl BatchRunner {
    pub fn new(
        parser: Arc<dyn ObsParser>,
        driver: Arc<dyn RunDriver>,
        quantities: BatchSet,
        observers: Observers,
    ) -> Self {
        Self {
            parser,
            driver,
            quantities,
            observers,
        }
    }

    /// The compilers whose compile succeeded for `subject`.
    fn runnable<'s>(subject: &'s Subject, plan: &Plan) -> Vec<(Id, &'s crate::subject::CompileResult)> {
        plan.compilers
            .keys()
            .filter_map(|cid| {
                let compile = subject.compiles.get(&cid.to_string())?;
                (compile.status == Status::Ok).then(|| (cid.clone(), compile))
            })
            .collect()
    }

    fn run_subject(
        &self,
        ctx: &Context,
        cid: &Id,
        bin: &Path,
        name: &str,
        tx: &crossbeam_channel::Sender<Request>,
    ) -> Result<(), StageError> {
        ctx.check()?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let start = Instant::now();
        let outcome = self.driver.run_binary(
            ctx,
            bin,
            self.quantities.timeout,
            &mut stdout,
            &mut stderr,
        );
        let duration = start.elapsed();

        let (status, obs) = match outcome {
            Ok(()) => self.parse_outcome(&stdout),
            Err(DriverError::Timeout) => (Status::RunTimeout, None),
            Err(DriverError::Cancelled) => {
                return Err(crate::sync::SessionError::Cancelled.into());
            }
            Err(_) => (Status::RunFail, None),
        };

        // Mutation hits are counted from stderr only; compilers embedded in
        // a backend may also chat on stdout, which we deliberately ignore.
        let mutant_hits = mutation::scan_lines(stderr.as_slice()).unwrap_or_default();
        debug!(subject = name, compiler = %cid, %status, "ran subject");

        Request::run(
            name,
            cid.clone(),
            RunResult {
                status,
                duration,
                obs,
                mutant_hits,
            },
        )
        .send_to(ctx, tx)
        .map_err(StageError::from)
    }

    /// Maps a completed run's stdout into a status and observation.
    fn parse_outcome(&self, stdout: &[u8]) -> (Status, Option<Obs>) {
        let mut reader = stdout;
        match self.parser.parse_obs(&mut reader) {
            Ok(obs) if obs.is_empty() => (Status::RunFail, Some(obs)),
            Ok(obs) => (Status::of_obs(&obs), Some(obs)),
            Err(_) => (Status::RunFail, None),
        }
    }
}

impl StageRunner for BatchRunner {
    fn stage(&self) -> Stage {
        Stage::Run
    }

    fn run(&mut self, ctx: &Context, mut plan: Plan) -> Result<Plan, StageError> {
        let start = Instant::now();
        plan.check()?;

        let nreqs: usize = plan
            .corpus
            .iter()
            .map(|(_, s)| Self::runnable(s, &plan).len())
            .sum();
        self.observers
            .on_machine_action(&Action::RunStart { count: nreqs });

        if nreqs > 0 {
            let observer = BuildForward(&self.observers);
            let plan_ref = &plan;
            let ran = builder::par_build(
                ctx,
                self.quantities.nworkers,
                &plan.corpus,
                builder::Config {
                    init: plan.corpus.clone(),
                    name: Stage::Run.to_string(),
                    nreqs,
                },
                &observer,
                |ctx, name, subject, tx| {
                    for (cid, compile) in Self::runnable(subject, plan_ref) {
                        self.run_subject(ctx, &cid, &compile.files.bin, name, tx)?;
                    }
                    Ok::<_, StageError>(())
                },
            )?;
            plan.corpus = ran;
        }

        self.observers.on_machine_action(&Action::RunFinish);
        confirm(&mut plan, Stage::Run, start)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        id::id,
        obs::{Flag, State, StateTag},
        plan::mock,
        recipe::{OutputKind, Recipe},
        subject::{CompileFileset, CompileResult},
    };

    /// Writes scripted stdout/stderr instead of executing anything.
    #[derive(Debug, Default)]
    struct ScriptedRunner {
        stdout: &'static str,
        stderr: &'static str,
        fail: Option<&'static str>,
        runs: Mutex<Vec<std::path::PathBuf>>,
    }

    impl RunDriver for ScriptedRunner {
        fn run_binary(
            &self,
            _ctx: &Context,
            bin: &Path,
            _timeout: Timeout,
            stdout: &mut dyn Write,
            stderr: &mut dyn Write,
        ) -> Result<(), DriverError> {
            self.runs.lock().unwrap().push(bin.to_owned());
            stdout.write_all(self.stdout.as_bytes()).unwrap();
            stderr.write_all(self.stderr.as_bytes()).unwrap();
            match self.fail {
                Some("timeout") => Err(DriverError::Timeout),
                Some(msg) => Err(DriverError::Failed(msg.into())),
                None => Ok(()),
            }
        }
    }

    /// Parses `witness`/`counter` count lines; anything else is one state.
    struct LineParser;

    impl ObsParser for LineParser {
        fn parse_obs(&self, r: &mut dyn BufRead) -> Result<Obs, ObsParseError> {
            let mut obs = Obs::default();
            for line in r.lines() {
                let line = line.map_err(|e| ObsParseError(e.to_string()))?;
                match line.trim() {
                    "" => {}
                    "unsat" => obs.flags |= Flag::UNSAT,
                    "sat" => obs.flags |= Flag::SAT,
                    state => obs.states.push(State {
                        occurrences: 1,
                        tag: StateTag::Unknown,
                        values: [("out".to_owned(), state.to_owned())].into(),
                    }),
                }
            }
            Ok(obs)
        }
    }

    /// A plan whose subjects all compiled OK under `gcc`.
    fn compiled_plan() -> Plan {
        let mut plan = mock::plan();
        let names: Vec<String> = plan.corpus.names().iter().map(|s| s.to_string()).collect();
        for name in names {
            let subject = plan.corpus.get_mut(&name).unwrap();
            subject.compiles.clear();
            subject.runs.clear();
            subject
                .add_recipe(
                    &id("x86"),
                    Recipe::new("lift", OutputKind::Executable).with_files(["main.c"]),
                )
                .unwrap();
            subject
                .add_compile(
                    &id("gcc"),
                    CompileResult {
                        status: Status::Ok,
                        files: CompileFileset {
                            bin: format!("run/gcc/{name}/a.out").into(),
                            log: Default::default(),
                        },
                        ..CompileResult::default()
                    },
                )
                .unwrap();
        }
        let md = &mut plan.metadata;
        md.confirm_stage(Stage::Lift, chrono::Utc::now(), Default::default())
            .unwrap();
        md.confirm_stage(Stage::Compile, chrono::Utc::now(), Default::default())
            .unwrap();
        plan
    }

    fn runner(driver: ScriptedRunner) -> BatchRunner {
        BatchRunner::new(
            Arc::new(LineParser),
            Arc::new(driver),
            BatchSet::default(),
            Observers::default(),
        )
    }

    #[test]
    fn satisfied_run_is_ok() {
        let mut stage = runner(ScriptedRunner {
            stdout: "sat\n0 1\n",
            ..ScriptedRunner::default()
        });
        let plan = stage.run(&Context::background(), compiled_plan()).unwrap();
        for (_, subject) in &plan.corpus {
            let run = subject.run_for(&id("gcc")).unwrap();
            assert_eq!(run.status, Status::Ok);
            assert_eq!(run.obs.as_ref().unwrap().states.len(), 1);
        }
        assert!(plan.metadata.has_stage(Stage::Run));
    }

    #[test]
    fn interesting_observation_is_flagged() {
        let mut stage = runner(ScriptedRunner {
            stdout: "unsat\n1 1\n",
            ..ScriptedRunner::default()
        });
        let plan = stage.run(&Context::background(), compiled_plan()).unwrap();
        for (_, subject) in &plan.corpus {
            assert_eq!(subject.run_for(&id("gcc")).unwrap().status, Status::Flagged);
        }
    }

    #[test]
    fn timeout_and_failure_are_classified() {
        for (fail, want) in [
            (Some("timeout"), Status::RunTimeout),
            (Some("boom"), Status::RunFail),
        ] {
            let mut stage = runner(ScriptedRunner {
                fail,
                ..ScriptedRunner::default()
            });
            let plan = stage.run(&Context::background(), compiled_plan()).unwrap();
            for (_, subject) in &plan.corpus {
                assert_eq!(subject.run_for(&id("gcc")).unwrap().status, want);
            }
        }
    }

    #[test]
    fn empty_observation_is_a_run_failure() {
        let mut stage = runner(ScriptedRunner::default());
        let plan = stage.run(&Context::background(), compiled_plan()).unwrap();
        for (_, subject) in &plan.corpus {
            assert_eq!(subject.run_for(&id("gcc")).unwrap().status, Status::RunFail);
        }
    }

    #[test]
    fn mutant_hits_come_from_stderr_only() {
        let mut stage = runner(ScriptedRunner {
            stdout: "sat\n0 0\nMUTATION HIT: 9\n",
            stderr: "MUTATION SELECTED: 4\nMUTATION HIT: 4\nMUTATION HIT: 4\n",
            ..ScriptedRunner::default()
        });
        let plan = stage.run(&Context::background(), compiled_plan()).unwrap();
        for (_, subject) in &plan.corpus {
            let run = subject.run_for(&id("gcc")).unwrap();
            assert_eq!(run.mutant_hits.get(&4), Some(&2));
            assert!(!run.mutant_hits.contains_key(&9));
        }
    }

    #[test]
    fn failed_compiles_are_not_run() {
        let mut plan = compiled_plan();
        plan.corpus
            .get_mut("bar")
            .unwrap()
            .compiles
            .get_mut("gcc")
            .unwrap()
            .status = Status::CompileFail;

        let driver = ScriptedRunner {
            stdout: "sat\n",
            ..ScriptedRunner::default()
        };
        let mut stage = runner(driver);
        let out = stage.run(&Context::background(), plan).unwrap();
        assert!(out.corpus.get("bar").unwrap().runs.is_empty());
        assert_eq!(out.corpus.get("foo").unwrap().runs.len(), 1);
    }
}
