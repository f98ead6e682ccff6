//! The analyser stage: classify, report, and archive a completed plan.

pub mod saver;

use std::{sync::Arc, time::Instant};

use crate::{
    observer::Observers,
    plan::{
        Plan,
        analysis::{self, filter::FilterSet},
        stage::Stage,
    },
    quantity::AnalysisSet,
    stage::{StageError, StageRunner, confirm},
    sync::Context,
};

use saver::Saver;

/// The analyser stage.
///
/// The analysis itself never mutates the plan; this stage only appends its
/// own record on the way out.
#[derive(Debug)]
pub struct Analyser {
    quantities: AnalysisSet,
    filters: Arc<FilterSet>,
    error_on_bad_status: bool,
    saver: Option<Saver>,
    observers: Observers,
}

impl Analyser {
    pub fn new(observers: Observers) -> Self {
        Self {
            quantities: AnalysisSet::default(),
            filters: Arc::new(FilterSet::empty()),
            error_on_bad_status: false,
            saver: None,
            observers,
        }
    }

    pub fn with_quantities(mut self, quantities: AnalysisSet) -> Self {
        self.quantities = quantities;
        self
    }

    pub fn with_filters(mut self, filters: Arc<FilterSet>) -> Self {
        self.filters = filters;
        self
    }

    /// Makes the stage fail with `BadStatus` when any subject classifies
    /// badly.
    pub fn error_on_bad_status(mut self, strict: bool) -> Self {
        self.error_on_bad_status = strict;
        self
    }

    /// Enables archival of failing subjects into `paths`.
    pub fn saving_to(mut self, paths: Option<saver::Pathset>) -> Self {
        self.saver = paths.map(|p| Saver::new(p, self.observers.clone()));
        self
    }
}

impl StageRunner for Analyser {
    fn stage(&self) -> Stage {
        Stage::Analyse
    }

    fn run(&mut self, ctx: &Context, mut plan: Plan) -> Result<Plan, StageError> {
        let start = Instant::now();
        plan.check()?;

        let nworkers = self.quantities.nworkers.max(1);
        let analysis = analysis::analyse(ctx, &plan, nworkers, self.filters.as_ref())?;
        self.observers.on_analysis(&plan.machine.id, &analysis);

        if let Some(saver) = &self.saver {
            saver.run(&plan, &analysis).map_err(|e| match e {
                saver::SaveError::Normalise(n) => StageError::Normalise(n),
                saver::SaveError::Io(io) => StageError::Io(io),
                saver::SaveError::Plan(p) => StageError::Plan(*p),
            })?;
        }

        if self.error_on_bad_status && analysis.has_bad_outcomes() {
            return Err(StageError::BadStatus);
        }

        confirm(&mut plan, Stage::Analyse, start)?;
        Ok(plan)
    }
}
