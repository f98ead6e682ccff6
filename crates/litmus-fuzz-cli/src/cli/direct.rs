use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use litmus_fuzz::{
    director::{Config, Director},
    id::Id,
    observer::{Observers, TracingObserver},
    quantity::{RootSet, Timeout},
    sync::Context,
};
use tracing::info;

use crate::{
    cli::GlobalOptions,
    services::{ConfigFile, env_from_config},
};

#[derive(Debug, clap::Parser)]
pub struct DirectCommand {
    /// Path to the JSON configuration file.
    #[clap(long)]
    config: PathBuf,

    /// Override the configured output directory.
    #[clap(long)]
    out_dir: Option<PathBuf>,

    /// Number of cycles per machine (0 = run until interrupted).
    #[clap(long)]
    cycles: Option<usize>,

    /// Only run machines whose ID matches this glob.
    #[clap(long)]
    machine_filter: Option<Id>,

    /// Per-job compile/run timeout, in seconds.
    #[clap(long)]
    timeout: Option<u64>,

    /// Fail the run when any subject ends badly.
    #[clap(long)]
    error_on_bad_status: bool,

    /// Archive failing subjects under the output directory.
    #[clap(long)]
    save_failures: bool,
}

impl DirectCommand {
    pub(super) fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let mut file = ConfigFile::load(&self.config).context("Loading config file")?;
        if let Some(out_dir) = &self.out_dir {
            file.out_dir = out_dir.clone();
        }

        let quantities = self.quantities(&global, &file);
        let env = env_from_config(&file, self.timeout);

        let config = Config {
            machines: file.machines.clone(),
            machine_filter: self.machine_filter.unwrap_or_default(),
            out_dir: file.out_dir.clone(),
            input_files: file.inputs.clone(),
            quantities,
            filter_file: file.filter_file.clone(),
            mutation: file.mutation.clone(),
            error_on_bad_status: self.error_on_bad_status,
            save_failures: self.save_failures,
        };

        let observers = Observers::new(vec![Arc::new(TracingObserver)]);
        let director = Director::new(config, env, observers).context("Building director")?;

        let (canceller, ctx) = Context::cancellable();
        let canceller = Arc::new(canceller);
        ctrlc::set_handler(move || {
            info!("interrupt received; cancelling");
            canceller.cancel();
        })
        .context("Installing interrupt handler")?;

        director.run(&ctx).context("Running director")?;
        Ok(())
    }

    /// Config-file quantities land on top of worker-count defaults; command
    /// line flags land on top of both.
    fn quantities(&self, global: &GlobalOptions, file: &ConfigFile) -> RootSet {
        let workers = global.parallel_workers();
        let mut quantities = RootSet::default();
        quantities.machine.fuzz.nworkers = workers;
        quantities.machine.mach.compiler.nworkers = workers;
        quantities.machine.mach.runner.nworkers = workers;
        quantities.analysis.nworkers = workers;
        quantities.cycles = 1;

        quantities.override_with(&file.quantities);

        let mut flags = RootSet::default();
        if let Some(cycles) = self.cycles {
            flags.cycles = cycles;
        }
        if let Some(secs) = self.timeout {
            let t = Timeout::new(Duration::from_secs(secs));
            flags.machine.mach.compiler.timeout = t;
            flags.machine.mach.runner.timeout = t;
        }
        quantities.override_with(&flags);
        quantities
    }
}
