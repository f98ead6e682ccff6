//! The machine-local stage: compile everything, then run everything.
//!
//! This stage is usually executed in a separate machine-node process driven
//! by the invoker over stdio; see [`forward`] for the protocol it speaks.

pub mod compiler;
pub mod forward;
pub mod interpreter;
pub mod runner;

use std::{
    io::{Read, Write},
    sync::Arc,
};

use crate::{
    observer::Observers,
    plan::Plan,
    quantity::MachNodeSet,
    stage::{ConfigError, StageError, StageRunner},
    sync::Context,
};

use compiler::{BatchCompiler, CompilePather};
use forward::ForwardObserver;
use runner::{BatchRunner, ObsParser, RunDriver};

/// The compile and run sub-stages, chained.
#[derive(Debug)]
pub struct Mach {
    compiler: BatchCompiler,
    runner: BatchRunner,
}

impl Mach {
    pub fn new(
        driver: Option<Arc<dyn crate::service::compiler::Driver + Send + Sync>>,
        paths: Arc<dyn CompilePather>,
        parser: Arc<dyn ObsParser>,
        run_driver: Arc<dyn RunDriver>,
        quantities: MachNodeSet,
        observers: Observers,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            compiler: BatchCompiler::new(driver, paths, quantities.compiler, observers.clone())?,
            runner: BatchRunner::new(parser, run_driver, quantities.runner, observers),
        })
    }

    /// Runs compile then run, leaving both stage records on the plan.
    pub fn run(&mut self, ctx: &Context, plan: Plan) -> Result<Plan, StageError> {
        let plan = self.compiler.run(ctx, plan)?;
        self.runner.run(ctx, plan)
    }

    /// The machine-node entry point: plan in, plan out, observations on the
    /// forwarding stream.
    ///
    /// Any error is also reported over the forwarding stream before being
    /// returned, so the invoking side sees it regardless of which pipe it is
    /// watching.
    pub fn run_node<E>(
        &mut self,
        ctx: &Context,
        stdin: impl Read,
        stdout: impl Write,
        forward: &ForwardObserver<E>,
    ) -> Result<(), StageError>
    where
        E: Write + Send,
    {
        match self.run_node_inner(ctx, stdin, stdout) {
            Ok(()) => Ok(()),
            Err(e) => {
                forward.forward_error(&e.to_string());
                Err(e)
            }
        }
    }

    fn run_node_inner(
        &mut self,
        ctx: &Context,
        stdin: impl Read,
        stdout: impl Write,
    ) -> Result<(), StageError> {
        let plan = Plan::read(stdin)?;
        let plan = self.run(ctx, plan)?;
        plan.write(stdout)?;
        Ok(())
    }
}

/// Builds the observer set for a machine node: everything forwards.
pub fn node_observers<W: Write + Send + 'static>(stderr: W) -> (Observers, Arc<ForwardObserver<W>>) {
    let forward = Arc::new(ForwardObserver::new(stderr));
    (Observers::new(vec![forward.clone()]), forward)
}
