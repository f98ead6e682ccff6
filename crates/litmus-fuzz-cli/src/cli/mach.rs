use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use litmus_fuzz::{
    director::pathset::Scratch,
    quantity::{BatchSet, MachNodeSet, Timeout},
    stage::mach::{Mach, node_observers, runner::ProcessRunner},
    sync::Context,
};

use crate::{
    cli::GlobalOptions,
    services::{GccStyleDriver, HerdStyleParser},
};

/// The machine-node program: reads a plan from stdin, compiles and runs it,
/// writes the updated plan to stdout, and forwards observations on stderr.
#[derive(Debug, clap::Parser)]
pub struct MachCommand {
    /// Scratch directory for compile and run outputs.
    #[clap(long)]
    out_dir: PathBuf,

    /// Per-job compile/run timeout, in seconds.
    #[clap(long)]
    timeout: Option<u64>,

    /// Parallel workers per sub-stage.
    #[clap(long)]
    nworkers: Option<usize>,
}

impl MachCommand {
    pub(super) fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let batch = BatchSet {
            timeout: self
                .timeout
                .map(|secs| Timeout::new(Duration::from_secs(secs)))
                .unwrap_or_default(),
            nworkers: self.nworkers.unwrap_or_else(|| global.parallel_workers()),
        };
        let quantities = MachNodeSet {
            compiler: batch,
            runner: batch,
        };

        let scratch = Arc::new(Scratch::new(&self.out_dir));
        let (observers, forward) = node_observers(std::io::stderr());
        let mut mach = Mach::new(
            Some(Arc::new(GccStyleDriver)),
            scratch,
            Arc::new(HerdStyleParser),
            Arc::new(ProcessRunner),
            quantities,
            observers,
        )
        .context("Building machine stage")?;

        let (canceller, ctx) = Context::cancellable();
        let canceller = Arc::new(canceller);
        ctrlc::set_handler(move || canceller.cancel())
            .context("Installing interrupt handler")?;

        mach.run_node(&ctx, std::io::stdin(), std::io::stdout(), &forward)
            .context("Running machine stage")?;
        Ok(())
    }
}
