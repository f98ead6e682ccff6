//! Observer interfaces for director, stage, and builder events.
//!
//! Observers are installed before the director starts and shared, immutable,
//! by every machine loop.  Callbacks arrive from whichever worker thread
//! produced the event, so implementations must be internally thread-safe.

use std::{fmt, path::Path, sync::Arc};

use derive_new::new as New;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    id::Id,
    plan::{analysis::Analysis, stage::Stage},
    status::Status,
    subject::corpus::builder,
};

/// Identifies one cycle of one machine's loop.
#[derive(Debug, Clone, PartialEq, Eq, New)]
pub struct CycleId {
    pub machine: Id,
    pub iter: usize,
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} #{}]", self.machine, self.iter)
    }
}

/// An event from the machine-local stage, as carried over the forwarding
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    CompileStart { count: usize },
    CompileFinish,
    RunStart { count: usize },
    RunFinish,
}

/// The full observer interface.  Every method defaults to a no-op, so
/// implementations pick the events they care about.
pub trait Observer: Send + Sync {
    fn on_cycle_start(&self, _cycle: &CycleId) {}
    fn on_cycle_finish(&self, _cycle: &CycleId) {}
    fn on_cycle_error(&self, _cycle: &CycleId, _err: &str) {}
    fn on_stage_start(&self, _cycle: &CycleId, _stage: Stage) {}
    fn on_stage_finish(&self, _cycle: &CycleId, _stage: Stage) {}

    fn on_build_start(&self, _m: &builder::Manifest) {}
    fn on_build_request(&self, _r: &builder::Request) {}
    fn on_build_finish(&self) {}

    fn on_machine_action(&self, _a: &Action) {}
    fn on_analysis(&self, _machine: &Id, _a: &Analysis) {}

    fn on_save(&self, _name: &str, _status: Status, _dest: &Path) {}
    fn on_save_error(&self, _name: &str, _err: &str) {}
}

/// An immutable, shareable snapshot of observers.
#[derive(Clone, Default)]
pub struct Observers(Arc<Vec<Arc<dyn Observer>>>);

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observers({})", self.0.len())
    }
}

macro_rules! fan_out {
    ($(fn $name:ident(&self $(, $arg:ident : $ty:ty)*);)*) => {
        $(pub fn $name(&self $(, $arg: $ty)*) {
            for obs in self.0.iter() {
                obs.$name($($arg),*);
            }
        })*
    };
}

impl Observers {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self(Arc::new(observers))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fan_out! {
        fn on_cycle_start(&self, cycle: &CycleId);
        fn on_cycle_finish(&self, cycle: &CycleId);
        fn on_cycle_error(&self, cycle: &CycleId, err: &str);
        fn on_stage_start(&self, cycle: &CycleId, stage: Stage);
        fn on_stage_finish(&self, cycle: &CycleId, stage: Stage);
        fn on_build_start(&self, m: &builder::Manifest);
        fn on_build_request(&self, r: &builder::Request);
        fn on_build_finish(&self);
        fn on_machine_action(&self, a: &Action);
        fn on_analysis(&self, machine: &Id, a: &Analysis);
        fn on_save(&self, name: &str, status: Status, dest: &Path);
        fn on_save_error(&self, name: &str, err: &str);
    }
}

/// Adapts an observer set onto the corpus builder's observer interface.
#[derive(Debug)]
pub struct BuildForward<'a>(pub &'a Observers);

impl builder::Observer for BuildForward<'_> {
    fn on_start(&self, m: &builder::Manifest) {
        self.0.on_build_start(m);
    }

    fn on_request(&self, r: &builder::Request) {
        self.0.on_build_request(r);
    }

    fn on_finish(&self) {
        self.0.on_build_finish();
    }
}

/// Routes observer events into `tracing` logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_cycle_start(&self, cycle: &CycleId) {
        info!(%cycle, "cycle starting");
    }

    fn on_cycle_finish(&self, cycle: &CycleId) {
        info!(%cycle, "cycle finished");
    }

    fn on_cycle_error(&self, cycle: &CycleId, err: &str) {
        error!(%cycle, err, "cycle failed");
    }

    fn on_stage_start(&self, cycle: &CycleId, stage: Stage) {
        info!(%cycle, %stage, "stage starting");
    }

    fn on_stage_finish(&self, cycle: &CycleId, stage: Stage) {
        info!(%cycle, %stage, "stage finished");
    }

    fn on_build_request(&self, r: &builder::Request) {
        // Only failures are worth a log line; the progress spam stays off.
        match &r.body {
            builder::Body::Compile { compiler_id, result } if result.status.is_bad() => {
                warn!(subject = %r.name, compiler = %compiler_id, status = %result.status, "compile went bad");
            }
            builder::Body::Run { compiler_id, result } if result.status.is_bad() => {
                warn!(subject = %r.name, compiler = %compiler_id, status = %result.status, "run went bad");
            }
            _ => {}
        }
    }

    fn on_analysis(&self, machine: &Id, a: &Analysis) {
        for status in Status::ALL {
            let names = a.names_with(status);
            if !names.is_empty() && status != Status::Ok {
                info!(%machine, %status, count = names.len(), subjects = ?names, "analysis bucket");
            }
        }
    }

    fn on_save(&self, name: &str, status: Status, dest: &Path) {
        info!(subject = name, %status, dest = %dest.display(), "archived failing subject");
    }

    fn on_save_error(&self, name: &str, err: &str) {
        warn!(subject = name, err, "could not archive subject");
    }
}
