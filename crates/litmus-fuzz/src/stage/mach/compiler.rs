//! The batch compiler: runs every subject's recipe under every planned
//! compiler.

use std::{fmt, io::Write, sync::Arc, time::Instant};

use crate::{
    id::Id,
    observer::{Action, BuildForward, Observers},
    plan::{Plan, stage::Stage},
    quantity::BatchSet,
    service::{DriverError, compiler::{Driver, Instance}},
    stage::{ConfigError, StageError, StageRunner, confirm},
    status::Status,
    subject::{
        CompileFileset, CompileResult, Subject,
        corpus::builder::{self, Request},
    },
    sync::Context,
};

use super::interpreter::{Interpreter, InterpretError};

/// Where compile outputs (binary, log) go for one compilation.
pub trait CompilePather: Send + Sync {
    /// Creates the per-compiler directories up front.
    fn prepare(&self, compilers: &[Id]) -> std::io::Result<()>;
    fn compile_paths(&self, compiler: &Id, name: &str) -> CompileFileset;
}

pub struct BatchCompiler {
    driver: Arc<dyn Driver + Send + Sync>,
    paths: Arc<dyn CompilePather>,
    pub quantities: BatchSet,
    observers: Observers,
}

impl fmt::Debug for BatchCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCompiler")
            .field("quantities", &self.quantities)
            .finish_non_exhaustive()
    }
}

impl BatchCompiler {
    pub fn new(
        driver: Option<Arc<dyn Driver + Send + Sync>>,
        paths: Arc<dyn CompilePather>,
        quantities: BatchSet,
        observers: Observers,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            driver: driver.ok_or(ConfigError::DriverNil)?,
            paths,
            quantities,
            observers,
        })
    }

    fn compile_subject(
        &self,
        ctx: &Context,
        cid: &Id,
        instance: &Instance,
        name: &str,
        subject: &Subject,
        tx: &crossbeam_channel::Sender<Request>,
    ) -> Result<(), StageError> {
        ctx.check()?;
        let recipe = subject.recipe_for(&instance.compiler.arch)?;
        let files = self.paths.compile_paths(cid, name);

        let mut log = open_log(&files)?;
        let start = Instant::now();
        let mut interp = Interpreter::new(
            self.driver.as_ref(),
            instance,
            recipe,
            files.bin.clone(),
            self.quantities.timeout,
        );
        let outcome = interp.run(ctx, log.as_mut());
        let duration = start.elapsed();
        drop(log);

        // Per-subject compiler failures become the subject's status; only
        // infrastructure problems abort the stage.
        let status = match outcome {
            Ok(()) => Status::Ok,
            Err(InterpretError::Driver(DriverError::Timeout)) => Status::CompileTimeout,
            Err(InterpretError::Driver(DriverError::Cancelled)) => {
                return Err(crate::sync::SessionError::Cancelled.into());
            }
            Err(InterpretError::Driver(_)) => Status::CompileFail,
            Err(e) => return Err(e.into()),
        };

        Request::compile(
            name,
            cid.clone(),
            CompileResult {
                status,
                duration,
                files,
            },
        )
        .send_to(ctx, tx)
        .map_err(StageError::from)
    }
}

/// Opens the compile log for writing, or discards if no log is wanted.
fn open_log(files: &CompileFileset) -> Result<Box<dyn Write + Send>, std::io::Error> {
    if files.log.as_os_str().is_empty() {
        return Ok(Box::new(std::io::sink()));
    }
    if let Some(parent) = files.log.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Box::new(std::fs::File::create(&files.log)?))
}

impl StageRunner for BatchCompiler {
    fn stage(&self) -> Stage {
        Stage::Compile
    }

    fn run(&mut self, ctx: &Context, mut plan: Plan) -> Result<Plan, StageError> {
        let start = Instant::now();
        plan.check()?;

        let cids: Vec<Id> = plan.compilers.keys().cloned().collect();
        self.paths.prepare(&cids)?;
        let nreqs = plan.num_compilations();
        self.observers
            .on_machine_action(&Action::CompileStart { count: nreqs });

        let observer = BuildForward(&self.observers);
        let compilers = &plan.compilers;
        let compiled = builder::par_build(
            ctx,
            self.quantities.nworkers,
            &plan.corpus,
            builder::Config {
                init: plan.corpus.clone(),
                name: Stage::Compile.to_string(),
                nreqs,
            },
            &observer,
            |ctx, name, subject, tx| {
                for (cid, instance) in compilers {
                    self.compile_subject(ctx, cid, instance, name, subject, tx)?;
                }
                Ok::<_, StageError>(())
            },
        )?;

        plan.corpus = compiled;
        self.observers.on_machine_action(&Action::CompileFinish);
        confirm(&mut plan, Stage::Compile, start)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        id::id,
        plan::mock,
        recipe::{OutputKind, Recipe},
        stage::mach::interpreter::tests::ScriptedDriver,
    };

    #[derive(Debug)]
    struct NoLogPather;

    impl CompilePather for NoLogPather {
        fn prepare(&self, _compilers: &[Id]) -> std::io::Result<()> {
            Ok(())
        }

        fn compile_paths(&self, compiler: &Id, name: &str) -> CompileFileset {
            CompileFileset {
                bin: PathBuf::from("run").join(compiler.to_string()).join(name).join("a.out"),
                // Empty log path disables log capture.
                log: PathBuf::new(),
            }
        }
    }

    /// A mock plan whose subjects all carry a one-file exe recipe.
    fn lifted_plan() -> Plan {
        let mut plan = mock::plan();
        let names: Vec<String> = plan.corpus.names().iter().map(|s| s.to_string()).collect();
        for name in names {
            let subject = plan.corpus.get_mut(&name).unwrap();
            subject.compiles.clear();
            subject.runs.clear();
            subject
                .add_recipe(
                    &id("x86"),
                    Recipe::new(format!("lift/x86/{name}"), OutputKind::Executable)
                        .with_files(["main.c"])
                        .compile_all_c_to_exe(),
                )
                .unwrap();
        }
        plan.metadata
            .confirm_stage(Stage::Lift, chrono::Utc::now(), Default::default())
            .unwrap();
        plan
    }

    #[test]
    fn compiles_every_pairing() {
        let driver = Arc::new(ScriptedDriver::default());
        let mut stage = BatchCompiler::new(
            Some(driver.clone()),
            Arc::new(NoLogPather),
            BatchSet::default(),
            Observers::default(),
        )
        .unwrap();

        let plan = stage
            .run(&Context::background(), lifted_plan())
            .unwrap();

        assert!(plan.metadata.has_stage(Stage::Compile));
        for (_, subject) in &plan.corpus {
            let result = subject.compile_for(&id("gcc")).unwrap();
            assert_eq!(result.status, Status::Ok);
            assert!(result.files.bin.ends_with("a.out"));
        }
        // One exe compile per subject.
        assert_eq!(driver.calls.lock().unwrap().len(), 4);
    }

    #[test]
    fn driver_failure_is_classified_not_fatal() {
        let driver = Arc::new(ScriptedDriver {
            fail_on: Some(0),
            ..ScriptedDriver::default()
        });
        let mut stage = BatchCompiler::new(
            Some(driver),
            Arc::new(NoLogPather),
            BatchSet {
                nworkers: 1,
                ..BatchSet::default()
            },
            Observers::default(),
        )
        .unwrap();

        let plan = stage.run(&Context::background(), lifted_plan()).unwrap();
        let statuses: Vec<Status> = plan
            .corpus
            .iter()
            .map(|(_, s)| s.compile_for(&id("gcc")).unwrap().status)
            .collect();
        assert_eq!(statuses.iter().filter(|s| **s == Status::CompileFail).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == Status::Ok).count(), 3);
    }

    #[test]
    fn missing_driver_is_config_error() {
        assert_eq!(
            BatchCompiler::new(
                None,
                Arc::new(NoLogPather),
                BatchSet::default(),
                Observers::default(),
            )
            .unwrap_err(),
            ConfigError::DriverNil
        );
    }

    #[test]
    fn missing_recipe_is_fatal() {
        let driver = Arc::new(ScriptedDriver::default());
        let mut stage = BatchCompiler::new(
            Some(driver),
            Arc::new(NoLogPather),
            BatchSet::default(),
            Observers::default(),
        )
        .unwrap();
        let mut plan = lifted_plan();
        plan.corpus.get_mut("foo").unwrap().recipes.clear();
        let err = stage.run(&Context::background(), plan).unwrap_err();
        assert!(matches!(err, StageError::Subject(_)));
    }
}
