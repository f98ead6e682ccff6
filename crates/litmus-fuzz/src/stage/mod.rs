//! The pipeline stages and the trait they share.

pub mod analyser;
pub mod fuzzer;
pub mod invoker;
pub mod lifter;
pub mod mach;
pub mod perturber;
pub mod planner;

use std::time::Instant;

use chrono::Utc;

use crate::{
    litmus::StatError,
    plan::{Plan, PlanError, analysis::AnalysisError, analysis::filter::FilterError, stage::Stage},
    service::{DriverError, backend::LiftError, compiler::InspectError},
    subject::{SubjectError, corpus::CorpusError, corpus::builder::BuildError,
        normaliser::NormaliseError},
    sync::{Context, SessionError},
};

/// Configuration errors shared across the director and its stages.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no machines defined")]
    NoMachines,
    #[error("no output directory specified in config")]
    NoOutDir,
    #[error("fuzzer driver not supplied")]
    FuzzerNil,
    #[error("stat dumper not supplied")]
    StatDumperNil,
    #[error("lifter not supplied")]
    LifterNil,
    #[error("compiler inspector not supplied")]
    CInspectorNil,
    #[error("compiler driver not supplied")]
    DriverNil,
    #[error("planner source incomplete")]
    PlannerSourceNil,
}

/// Any error a stage can raise.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Subject(#[from] SubjectError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Lift(#[from] LiftError),
    #[error(transparent)]
    Inspect(#[from] InspectError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Stat(#[from] StatError),
    #[error(transparent)]
    Interpret(#[from] mach::interpreter::InterpretError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Normalise(#[from] NormaliseError),
    #[error(transparent)]
    Invoke(#[from] invoker::InvokeError),
    #[error("at least one subject reported a bad status")]
    BadStatus,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Whether this error must stop the whole machine loop rather than just
    /// the current cycle.
    pub fn is_fatal(&self) -> bool {
        use mach::forward::ProtocolError;

        matches!(
            self,
            StageError::Session(SessionError::Cancelled)
                | StageError::Config(_)
                | StageError::BadStatus
                | StageError::Build(BuildError::Session(SessionError::Cancelled))
                | StageError::Analysis(AnalysisError::Session(SessionError::Cancelled))
                | StageError::Invoke(invoker::InvokeError::Protocol(ProtocolError::Session(
                    SessionError::Cancelled
                )))
        )
    }
}

/// One step of the per-cycle pipeline: consumes a plan, produces a new one.
///
/// Implementations append their own stage record before returning.
pub trait StageRunner {
    fn stage(&self) -> Stage;

    fn run(&mut self, ctx: &Context, plan: Plan) -> Result<Plan, StageError>;
}

/// Confirms `stage` on `plan`, stamping the duration since `start`.
pub(crate) fn confirm(plan: &mut Plan, stage: Stage, start: Instant) -> Result<(), PlanError> {
    plan.metadata
        .confirm_stage(stage, Utc::now(), start.elapsed())
}
