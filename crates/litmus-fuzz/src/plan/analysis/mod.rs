//! Plan analysis: classifying subjects by outcome and aggregating per-compiler
//! statistics.

pub mod filter;

use std::{collections::BTreeMap, time::Duration};

use crossbeam_channel::bounded;
use tracing::warn;

use crate::{
    plan::Plan,
    status::Status,
    subject::{Subject, corpus::{Corpus, CorpusError}},
    sync::{Context, SessionError},
};
use filter::FilterSet;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Plan(#[from] Box<crate::plan::PlanError>),
}

/// Aggregate timing statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSet {
    pub min: Duration,
    pub max: Duration,
    pub sum: Duration,
    pub count: u32,
}

impl TimeSet {
    pub fn observe(&mut self, d: Duration) {
        if self.count == 0 || d < self.min {
            self.min = d;
        }
        if d > self.max {
            self.max = d;
        }
        self.sum += d;
        self.count += 1;
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.sum / self.count
        }
    }
}

/// Per-compiler aggregates over one analysis.
#[derive(Debug, Clone, Default)]
pub struct CompilerSummary {
    /// How many subjects landed on each status under this compiler.
    pub counts: BTreeMap<Status, usize>,
    pub compile_times: TimeSet,
    pub run_times: TimeSet,
    /// Captured compile logs of failing subjects, keyed by subject name.
    pub failing_logs: BTreeMap<String, String>,
}

/// The outcome of analysing a completed plan.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Every subject, bucketed by its final classification.  All statuses
    /// are present, possibly with empty buckets.
    pub by_status: BTreeMap<Status, Corpus>,
    /// Aggregates keyed by the string form of each compiler ID.
    pub compilers: BTreeMap<String, CompilerSummary>,
}

impl Analysis {
    /// Sorted names of the subjects classified with `status`.
    pub fn names_with(&self, status: Status) -> Vec<&str> {
        self.by_status
            .get(&status)
            .map(|c| c.names())
            .unwrap_or_default()
    }

    pub fn has_bad_outcomes(&self) -> bool {
        self.by_status
            .iter()
            .any(|(status, bucket)| status.is_bad() && !bucket.is_empty())
    }
}

/// One subject's classification, as computed by a worker.
#[derive(Debug)]
struct Classification {
    name: String,
    subject: Subject,
    status: Status,
    /// Per-compiler contributions: (cid, status, compile time, run time, log).
    compilers: Vec<CompilerContribution>,
}

#[derive(Debug)]
struct CompilerContribution {
    cid: String,
    status: Status,
    compile_time: Option<Duration>,
    run_time: Option<Duration>,
    failing_log: Option<String>,
}

/// Analyses `plan`, classifying subjects over up to `nworkers` threads.
///
/// The plan itself is never mutated; the filters may rescue `CompileFail`
/// subjects into `Filtered` when their compile log matches.
pub fn analyse(
    ctx: &Context,
    plan: &Plan,
    nworkers: usize,
    filters: &FilterSet,
) -> Result<Analysis, AnalysisError> {
    plan.check().map_err(Box::new)?;
    ctx.check()?;

    let classifications = classify_all(ctx, plan, nworkers.max(1), filters)?;
    let mut analysis = Analysis::default();
    for status in Status::ALL {
        analysis.by_status.insert(status, Corpus::new());
    }

    for c in classifications {
        // Names are unique in the source corpus, so these adds cannot fail.
        if let Some(bucket) = analysis.by_status.get_mut(&c.status) {
            let _ = bucket.add(c.name.clone(), c.subject);
        }
        for contrib in c.compilers {
            let summary = analysis.compilers.entry(contrib.cid).or_default();
            *summary.counts.entry(contrib.status).or_default() += 1;
            if let Some(t) = contrib.compile_time {
                summary.compile_times.observe(t);
            }
            if let Some(t) = contrib.run_time {
                summary.run_times.observe(t);
            }
            if let Some(log) = contrib.failing_log {
                summary.failing_logs.insert(c.name.clone(), log);
            }
        }
    }
    Ok(analysis)
}

fn classify_all(
    ctx: &Context,
    plan: &Plan,
    nworkers: usize,
    filters: &FilterSet,
) -> Result<Vec<Classification>, AnalysisError> {
    let (work_tx, work_rx) = bounded::<(&String, &Subject)>(0);
    let (res_tx, res_rx) = bounded::<Classification>(0);

    std::thread::scope(|scope| {
        for _ in 0..nworkers {
            let work_rx = work_rx.clone();
            let res_tx = res_tx.clone();
            scope.spawn(move || {
                for (name, subject) in work_rx {
                    let c = classify(name, subject, plan, filters);
                    if res_tx.send(c).is_err() {
                        break;
                    }
                }
            });
        }
        drop(work_rx);
        drop(res_tx);

        let done = ctx.done();
        scope.spawn(move || {
            for item in &plan.corpus {
                crossbeam_channel::select! {
                    send(work_tx, item) -> res => {
                        if res.is_err() {
                            break;
                        }
                    }
                    recv(done) -> _ => break,
                }
            }
        });

        let mut out = Vec::with_capacity(plan.corpus.len());
        for c in res_rx {
            out.push(c);
        }
        ctx.check()?;
        // Aggregation order must not depend on worker scheduling.
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    })
}

fn classify(name: &str, subject: &Subject, plan: &Plan, filters: &FilterSet) -> Classification {
    let mut status = Status::Ok;
    let mut compilers = Vec::new();

    for (cid, compile) in &subject.compiles {
        let style = plan
            .compilers
            .get(&cid.parse().unwrap_or_default())
            .map(|inst| &inst.compiler.style);
        let (comp_status, failing_log) = filter_compile_status(name, compile, style, filters);
        status = status.max(comp_status);

        let mut contrib = CompilerContribution {
            cid: cid.clone(),
            status: comp_status,
            compile_time: Some(compile.duration),
            run_time: None,
            failing_log,
        };
        if let Some(run) = subject.runs.get(cid) {
            status = status.max(run.status);
            contrib.status = contrib.status.max(run.status);
            contrib.run_time = Some(run.duration);
        }
        compilers.push(contrib);
    }
    // Runs with no matching compile should be impossible, but a worst-wins
    // reduction must still see them.
    for (cid, run) in &subject.runs {
        if !subject.compiles.contains_key(cid) {
            status = status.max(run.status);
        }
    }

    Classification {
        name: name.to_owned(),
        subject: subject.clone(),
        status,
        compilers,
    }
}

/// Applies the filter set to one compile result, returning the (possibly
/// rescued) status and the captured log of a failing compile.
fn filter_compile_status(
    name: &str,
    compile: &crate::subject::CompileResult,
    style: Option<&crate::id::Id>,
    filters: &FilterSet,
) -> (Status, Option<String>) {
    if compile.status != Status::CompileFail {
        return (compile.status, None);
    }
    let log = read_log(&compile.files.log);
    if log.is_none() {
        warn!(subject = name, "failing compile left no readable log");
    }
    let matched = match (&log, style) {
        (Some(log), Some(style)) => filters.any_match(style, log),
        _ => false,
    };
    let status = if matched {
        Status::Filtered
    } else {
        Status::CompileFail
    };
    (status, log)
}

fn read_log(path: &std::path::Path) -> Option<String> {
    if path.as_os_str().is_empty() {
        return None;
    }
    std::fs::read_to_string(path).ok()
}
