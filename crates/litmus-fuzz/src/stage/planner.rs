//! The planner: builds the fresh plan each cycle starts from.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Instant};

use tracing::info;

use crate::{
    id::Id,
    litmus::StatDumper,
    machine::{Machine, NamedMachine},
    mutation,
    plan::{Metadata, Plan, stage::Stage},
    service::{DriverError, backend, compiler::{Compiler, Instance, InstanceMap}},
    stage::{ConfigError, StageError, confirm},
    subject::{Subject, corpus::Corpus},
    sync::Context,
};

/// Lists the compilers configured for a machine.
pub trait CompilerLister: Send + Sync {
    fn list_compilers(&self, machine: &Id) -> Result<BTreeMap<Id, Compiler>, DriverError>;
}

/// Chooses the memory-model backend for a machine.
pub trait BackendFinder: Send + Sync {
    fn find_backend(&self, machine: &Machine) -> Result<backend::Spec, DriverError>;
}

/// Where the planner learns about the outside world.
#[derive(Clone)]
pub struct Source {
    pub compilers: Arc<dyn CompilerLister>,
    pub backends: Arc<dyn BackendFinder>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("planner::Source")
    }
}

/// Builds plans for one machine at a time.
pub struct Planner {
    source: Source,
    dumper: Arc<dyn StatDumper + Send + Sync>,
    /// The litmus files making up the initial corpus.
    files: Vec<PathBuf>,
    mutation: mutation::Config,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl Planner {
    pub fn new(
        source: Source,
        dumper: Arc<dyn StatDumper + Send + Sync>,
        files: Vec<PathBuf>,
        mutation: mutation::Config,
    ) -> Self {
        Self {
            source,
            dumper,
            files,
            mutation,
        }
    }

    /// Plans one cycle for `machine`: picks a backend, instantiates the
    /// compilers, probes the input files into a corpus, and stamps the
    /// `Plan` stage record.
    pub fn plan(
        &self,
        ctx: &Context,
        id: &Id,
        machine: &Machine,
    ) -> Result<Plan, StageError> {
        let start = Instant::now();
        ctx.check()?;

        let backend = self.source.backends.find_backend(machine)?;
        let compilers = self.plan_compilers(ctx, id)?;
        let corpus = self.plan_corpus(ctx)?;

        let mut plan = Plan {
            metadata: Metadata::with_random_seed(),
            machine: NamedMachine {
                id: id.clone(),
                machine: machine.clone(),
            },
            backend: Some(backend),
            compilers,
            corpus,
            mutation: self.mutation.clone(),
        };
        plan.check()?;
        confirm(&mut plan, Stage::Plan, start)?;
        info!(machine = %id, seed = plan.metadata.seed, subjects = plan.corpus.len(),
            compilers = plan.compilers.len(), "planned cycle");
        Ok(plan)
    }

    fn plan_compilers(&self, ctx: &Context, id: &Id) -> Result<InstanceMap, StageError> {
        ctx.check()?;
        let listed = self.source.compilers.list_compilers(id)?;
        if listed.is_empty() {
            return Err(ConfigError::PlannerSourceNil.into());
        }
        Ok(listed
            .into_iter()
            .map(|(cid, compiler)| {
                (
                    cid,
                    Instance {
                        compiler,
                        ..Instance::default()
                    },
                )
            })
            .collect())
    }

    fn plan_corpus(&self, ctx: &Context) -> Result<Corpus, StageError> {
        let mut corpus = Corpus::new();
        for path in &self.files {
            ctx.check()?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut subject = Subject::new(path.clone());
            self.dumper.dump_stats(ctx, &mut subject.stats, path)?;
            corpus.add(name, subject)?;
        }
        Ok(corpus)
    }
}
