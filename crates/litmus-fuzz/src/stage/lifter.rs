//! The lift stage: turns each (architecture, subject) pair into a
//! compilable recipe.

use std::{fmt, path::PathBuf, sync::Arc, time::Instant};

use crate::{
    id::Id,
    litmus::Litmus,
    observer::{BuildForward, Observers},
    plan::{Plan, stage::Stage},
    recipe::Recipe,
    service::backend::{LiftError, LiftInput, LiftJob, LiftOutput, Target},
    stage::{ConfigError, StageError, StageRunner, confirm},
    subject::corpus::builder::{self, Request},
    sync::Context,
};

/// A single-shot recipe lifter (usually the backend itself).
pub trait SingleLifter: Send + Sync {
    fn lift(&self, ctx: &Context, job: &LiftJob) -> Result<Recipe, LiftError>;
}

/// Where the lift stage puts recipe files.
pub trait LiftPather: Send + Sync {
    /// Creates the per-architecture directories up front.
    fn prepare(&self, arches: &[Id]) -> std::io::Result<()>;
    fn lift_dir(&self, arch: &Id, name: &str) -> PathBuf;
}

pub struct Lifter {
    driver: Arc<dyn SingleLifter>,
    paths: Arc<dyn LiftPather>,
    nworkers: usize,
    observers: Observers,
}

impl fmt::Debug for Lifter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Lifter")
    }
}

impl Lifter {
    pub fn new(
        driver: Option<Arc<dyn SingleLifter>>,
        paths: Arc<dyn LiftPather>,
        nworkers: usize,
        observers: Observers,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            driver: driver.ok_or(ConfigError::LifterNil)?,
            paths,
            nworkers,
            observers,
        })
    }

    fn lift_one(
        &self,
        ctx: &Context,
        arch: &Id,
        name: &str,
        subject: &crate::subject::Subject,
        tx: &crossbeam_channel::Sender<Request>,
    ) -> Result<(), StageError> {
        ctx.check()?;
        let litmus = Litmus {
            path: subject.best_litmus()?.to_owned(),
            arch: Id::default(),
            stats: subject.stats.clone(),
        };
        let job = LiftJob {
            arch: arch.clone(),
            input: LiftInput::litmus(litmus),
            output: LiftOutput {
                dir: self.paths.lift_dir(arch, name),
                target: Target::Default,
            },
        };
        job.check()?;
        let recipe = self.driver.lift(ctx, &job)?;
        Request::recipe(name, arch.clone(), recipe)
            .send_to(ctx, tx)
            .map_err(StageError::from)
    }
}

impl StageRunner for Lifter {
    fn stage(&self) -> Stage {
        Stage::Lift
    }

    fn run(&mut self, ctx: &Context, mut plan: Plan) -> Result<Plan, StageError> {
        let start = Instant::now();
        plan.check_with_backend()?;

        let arches = plan.arches();
        self.paths.prepare(&arches)?;
        let nreqs = arches.len() * plan.corpus.len();

        let observer = BuildForward(&self.observers);
        let lifted = builder::par_build(
            ctx,
            self.nworkers,
            &plan.corpus,
            builder::Config {
                init: plan.corpus.clone(),
                name: Stage::Lift.to_string(),
                nreqs,
            },
            &observer,
            |ctx, name, subject, tx| {
                for arch in &arches {
                    self.lift_one(ctx, arch, name, subject, tx)?;
                }
                Ok::<_, StageError>(())
            },
        )?;

        plan.corpus = lifted;
        confirm(&mut plan, Stage::Lift, start)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::id,
        plan::mock,
        recipe::OutputKind,
    };

    #[derive(Debug)]
    struct DirPather;

    impl LiftPather for DirPather {
        fn prepare(&self, _arches: &[Id]) -> std::io::Result<()> {
            Ok(())
        }

        fn lift_dir(&self, arch: &Id, name: &str) -> PathBuf {
            PathBuf::from("lift").join(arch.to_string()).join(name)
        }
    }

    struct OneFileLifter;

    impl SingleLifter for OneFileLifter {
        fn lift(&self, _ctx: &Context, job: &LiftJob) -> Result<Recipe, LiftError> {
            Ok(Recipe::new(job.output.dir.clone(), OutputKind::Executable)
                .with_files(["main.c"])
                .compile_all_c_to_exe())
        }
    }

    #[test]
    fn nil_driver_is_rejected() {
        let err = Lifter::new(None, Arc::new(DirPather), 1, Observers::default()).unwrap_err();
        assert_eq!(err, ConfigError::LifterNil);
    }

    #[test]
    fn missing_backend_fails() {
        let mut stage = Lifter::new(
            Some(Arc::new(OneFileLifter)),
            Arc::new(DirPather),
            1,
            Observers::default(),
        )
        .unwrap();
        let mut plan = mock::plan();
        plan.backend = None;
        let err = stage.run(&Context::background(), plan).unwrap_err();
        assert!(matches!(
            err,
            StageError::Plan(crate::plan::PlanError::NoBackend)
        ));
    }

    #[test]
    fn every_arch_subject_pair_gets_a_recipe() {
        let mut stage = Lifter::new(
            Some(Arc::new(OneFileLifter)),
            Arc::new(DirPather),
            4,
            Observers::default(),
        )
        .unwrap();
        let plan = stage.run(&Context::background(), mock::plan()).unwrap();

        for (name, subject) in &plan.corpus {
            let recipe = subject.recipe_for(&id("x86")).unwrap();
            assert_eq!(recipe.dir, PathBuf::from("lift").join("x86").join(name));
            assert_eq!(recipe.files, vec!["main.c"]);
        }
        assert!(plan.metadata.has_stage(Stage::Lift));
    }
}
