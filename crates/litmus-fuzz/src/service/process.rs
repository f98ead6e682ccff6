//! Blocking subprocess execution with deadline and cancellation handling.

use std::{
    io::{Read, Write},
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use nix::{sys::signal, unistd::Pid};
use tracing::debug;

use crate::{quantity::Timeout, service::DriverError, sync::Context};

/// How long a signalled child gets to exit before being killed outright.
const GRACE: Duration = Duration::from_secs(2);

const POLL: Duration = Duration::from_millis(20);

/// Runs `cmd` to completion, streaming its stdout and stderr into the given
/// sinks.
///
/// The child is terminated if `timeout` elapses (mapping to
/// [`DriverError::Timeout`]) or `ctx` is cancelled (mapping to
/// [`DriverError::Cancelled`]).  A non-zero exit maps to
/// [`DriverError::Failed`].
pub fn run(
    ctx: &Context,
    mut cmd: Command,
    timeout: Timeout,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<(), DriverError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!(?cmd, "spawning service process");

    let mut child = cmd.spawn()?;
    let deadline = timeout.duration().map(|d| Instant::now() + d);

    // Drain both pipes off-thread while supervising, so a chatty child can
    // never block on a full pipe buffer.
    let mut out_pipe = child.stdout.take();
    let mut err_pipe = child.stderr.take();
    let (outcome, out_buf, err_buf) = std::thread::scope(|scope| {
        let out_reader = scope.spawn(move || read_all(out_pipe.as_mut()));
        let err_reader = scope.spawn(move || read_all(err_pipe.as_mut()));
        let outcome = supervise(ctx, &mut child, deadline);
        (
            outcome,
            out_reader.join().unwrap_or_else(|_| Ok(Vec::new())),
            err_reader.join().unwrap_or_else(|_| Ok(Vec::new())),
        )
    });
    stdout.write_all(&out_buf?)?;
    stderr.write_all(&err_buf?)?;

    match outcome {
        Wait::Exited(status) if status.success() => Ok(()),
        Wait::Exited(status) => Err(DriverError::Failed(format!("exit status {status}"))),
        Wait::TimedOut => Err(DriverError::Timeout),
        Wait::Cancelled => Err(DriverError::Cancelled),
        Wait::Error(e) => Err(e.into()),
    }
}

enum Wait {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    Error(std::io::Error),
}

fn supervise(ctx: &Context, child: &mut Child, deadline: Option<Instant>) -> Wait {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Wait::Exited(status),
            Ok(None) => {}
            Err(e) => return Wait::Error(e),
        }
        if ctx.is_cancelled() {
            terminate(child);
            return Wait::Cancelled;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            terminate(child);
            return Wait::TimedOut;
        }
        std::thread::sleep(POLL);
    }
}

/// Signals the child with SIGTERM, then SIGKILLs it after a grace period.
fn terminate(child: &mut Child) {
    let pid = Pid::from_raw(child.id() as i32);
    let _ = signal::kill(pid, signal::Signal::SIGTERM);
    let grace_end = Instant::now() + GRACE;
    while Instant::now() < grace_end {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(POLL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn read_all(pipe: Option<&mut impl Read>) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = Vec::new();
    if let Some(pipe) = pipe {
        pipe.read_to_end(&mut buf)?;
    }
    Ok(buf)
}
