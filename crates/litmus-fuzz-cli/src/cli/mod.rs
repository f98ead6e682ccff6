mod analyse;
mod direct;
mod mach;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use analyse::AnalyseCommand;
use direct::DirectCommand;
use mach::MachCommand;

#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    #[clap(flatten)]
    global_options: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub(super) fn run(self) -> anyhow::Result<()> {
        // The machine node's stderr is the forwarding protocol stream, so
        // it must stay free of log output.
        if !matches!(self.command, Command::Mach(_)) {
            setup_logger(&self.global_options).context("Setting up logger")?;
        }
        match self.command {
            Command::Direct(cmd) => cmd.run(self.global_options),
            Command::Mach(cmd) => cmd.run(self.global_options),
            Command::Analyse(cmd) => cmd.run(self.global_options),
        }
    }
}

#[derive(Debug, clap::Parser)]
pub struct GlobalOptions {
    #[clap(long, default_value = "info")]
    default_log_level: LevelFilter,

    /// Worker count used where a stage has no explicit setting.
    #[clap(long)]
    parallel_workers: Option<usize>,
}

impl GlobalOptions {
    pub fn parallel_workers(&self) -> usize {
        self.parallel_workers
            .unwrap_or_else(|| std::cmp::max(1, num_cpus::get() / 2))
    }
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the director: per-machine fuzz-compile-run-analyse cycles.
    Direct(Box<DirectCommand>),
    /// Run the machine-local stage over stdio (used by the invoker).
    Mach(MachCommand),
    /// Analyse a saved plan file and print the classification.
    Analyse(AnalyseCommand),
}

fn setup_logger(global_opts: &GlobalOptions) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned())),
        )
        .with(
            EnvFilter::builder()
                .with_default_directive(global_opts.default_log_level.into())
                .from_env()
                .context("Constructing log filter from env.")?,
        )
        .init();

    Ok(())
}
