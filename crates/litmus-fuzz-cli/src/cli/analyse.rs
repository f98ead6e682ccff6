use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{Context as _, bail};
use litmus_fuzz::{
    plan::{
        Plan,
        analysis::{Analysis, analyse, filter::FilterSet},
    },
    status::Status,
    sync::Context,
};

use crate::cli::GlobalOptions;

/// One-shot analysis of a saved plan file.
#[derive(Debug, clap::Parser)]
pub struct AnalyseCommand {
    /// The plan file to analyse.
    plan: PathBuf,

    /// Optional filter file rescuing known-benign compile failures.
    #[clap(long)]
    filter_file: Option<PathBuf>,

    /// Exit non-zero when any subject ends badly.
    #[clap(long)]
    error_on_bad_status: bool,
}

impl AnalyseCommand {
    pub(super) fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let plan = Plan::read_file(&self.plan).context("Reading plan")?;
        let filters = match &self.filter_file {
            Some(path) => Arc::new(FilterSet::load(path).context("Loading filters")?),
            None => Arc::new(FilterSet::empty()),
        };

        let analysis = analyse(
            &Context::background(),
            &plan,
            global.parallel_workers(),
            &filters,
        )
        .context("Analysing plan")?;

        write_report(&mut std::io::stdout().lock(), &analysis)?;

        if self.error_on_bad_status && analysis.has_bad_outcomes() {
            bail!("at least one subject reported a bad status");
        }
        Ok(())
    }
}

fn write_report(w: &mut impl Write, analysis: &Analysis) -> std::io::Result<()> {
    for status in Status::ALL {
        let names = analysis.names_with(status);
        if names.is_empty() {
            continue;
        }
        writeln!(w, "{status} ({}):", names.len())?;
        for name in names {
            writeln!(w, "  {name}")?;
        }
    }
    for (cid, summary) in &analysis.compilers {
        writeln!(
            w,
            "compiler {cid}: compile mean {:?} (min {:?}, max {:?}), run mean {:?}",
            summary.compile_times.mean(),
            summary.compile_times.min,
            summary.compile_times.max,
            summary.run_times.mean(),
        )?;
    }
    Ok(())
}
