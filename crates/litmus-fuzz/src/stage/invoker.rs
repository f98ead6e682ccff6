//! The invoker: ships the machine-local stage to a machine-node process and
//! wires its three pipes.

use std::{
    fmt,
    io::{BufReader, Read, Write},
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::Instant,
};

use tracing::debug;

use crate::{
    observer::Observers,
    plan::{Plan, PlanError, stage::Stage},
    stage::{StageError, StageRunner, confirm},
    stage::mach::forward::{self, ProtocolError},
    sync::Context,
};

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("machine node did not expose its pipes")]
    NoPipes,
    #[error("machine node exited badly: {0}")]
    NodeFailed(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The pipes of a started machine node.
pub struct Pipeset {
    pub stdin: Box<dyn Write + Send>,
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Box<dyn Read + Send>,
}

impl fmt::Debug for Pipeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pipeset")
    }
}

/// One live machine-node session.
pub trait MachineRunner: Send {
    fn start(&mut self) -> Result<Pipeset, InvokeError>;

    /// Waits for the node to exit, after its pipes have drained.
    fn wait(&mut self) -> Result<(), InvokeError>;
}

/// Materialises runners for plans.
///
/// Factories may hold disposable state (a local binary path, or a remote
/// session); the invoker asks for a fresh runner every cycle.
pub trait RunnerFactory: Send + Sync {
    fn make_runner(&self, plan: &Plan) -> Result<Box<dyn MachineRunner>, InvokeError>;
}

/// Spawns the machine node as a local subprocess.
#[derive(Debug, Clone)]
pub struct LocalFactory {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LocalFactory {
    /// Re-invokes the current executable with `args` (the conventional way
    /// to reach the `mach` subcommand).
    pub fn self_exe(args: Vec<String>) -> Result<Self, std::io::Error> {
        Ok(Self {
            program: std::env::current_exe()?,
            args,
        })
    }
}

impl RunnerFactory for LocalFactory {
    fn make_runner(&self, _plan: &Plan) -> Result<Box<dyn MachineRunner>, InvokeError> {
        Ok(Box::new(LocalRunner {
            program: self.program.clone(),
            args: self.args.clone(),
            child: None,
        }))
    }
}

#[derive(Debug)]
struct LocalRunner {
    program: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
}

impl MachineRunner for LocalRunner {
    fn start(&mut self) -> Result<Pipeset, InvokeError> {
        debug!(program = %self.program.display(), "spawning machine node");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pipes = Pipeset {
            stdin: Box::new(child.stdin.take().ok_or(InvokeError::NoPipes)?),
            stdout: Box::new(child.stdout.take().ok_or(InvokeError::NoPipes)?),
            stderr: Box::new(child.stderr.take().ok_or(InvokeError::NoPipes)?),
        };
        self.child = Some(child);
        Ok(pipes)
    }

    fn wait(&mut self) -> Result<(), InvokeError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(InvokeError::NodeFailed(status.to_string()))
        }
    }
}

/// The invoke stage.
pub struct Invoker {
    factory: std::sync::Arc<dyn RunnerFactory>,
    observers: Observers,
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Invoker")
    }
}

impl Invoker {
    pub fn new(factory: std::sync::Arc<dyn RunnerFactory>, observers: Observers) -> Self {
        Self { factory, observers }
    }

    /// Runs the three-pipe protocol: plan down stdin, plan up stdout,
    /// forwarded observations off stderr.
    fn pipework(
        &self,
        ctx: &Context,
        plan: &Plan,
        pipes: Pipeset,
    ) -> (
        Result<(), PlanError>,
        Result<Plan, PlanError>,
        Result<(), ProtocolError>,
    ) {
        let Pipeset {
            mut stdin,
            stdout,
            stderr,
        } = pipes;
        std::thread::scope(|scope| {
            let send = scope.spawn(move || {
                let res = plan.write(&mut stdin);
                // Closing stdin tells the node the plan is complete.
                drop(stdin);
                res
            });
            let recv = scope.spawn(move || Plan::read(stdout));
            let replay = scope.spawn(move || {
                forward::replay(ctx, BufReader::new(stderr), &self.observers)
            });
            (
                send.join().unwrap_or_else(|_| panic!("plan sender panicked")),
                recv.join().unwrap_or_else(|_| panic!("plan receiver panicked")),
                replay.join().unwrap_or_else(|_| panic!("replayer panicked")),
            )
        })
    }
}

impl StageRunner for Invoker {
    fn stage(&self) -> Stage {
        Stage::Invoke
    }

    fn run(&mut self, ctx: &Context, plan: Plan) -> Result<Plan, StageError> {
        let start = Instant::now();
        plan.check()?;

        let mut runner = self.factory.make_runner(&plan)?;
        let pipes = runner.start()?;
        let (sent, received, replayed) = self.pipework(ctx, &plan, pipes);
        let waited = runner.wait();

        // First error wins, in pipework order, with the wait result last.
        sent?;
        let mut out = received?;
        replayed.map_err(InvokeError::from)?;
        waited?;

        confirm(&mut out, Stage::Invoke, start)?;
        Ok(out)
    }
}
