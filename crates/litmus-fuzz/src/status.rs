//! Subject outcome statuses and their "worst wins" ordering.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::obs::Obs;

/// The outcome of processing one subject under one compiler.
///
/// The ordering is significant: later variants are "worse", and a subject's
/// overall classification is the maximum over its compile and run statuses.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Status {
    #[default]
    Ok,
    /// The subject was rescued from a bad status by an analysis filter.
    Filtered,
    /// The subject's observation looks like a potential compiler bug.
    Flagged,
    CompileFail,
    CompileTimeout,
    RunFail,
    RunTimeout,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Ok,
        Status::Filtered,
        Status::Flagged,
        Status::CompileFail,
        Status::CompileTimeout,
        Status::RunFail,
        Status::RunTimeout,
    ];

    /// Whether this status counts as a bad outcome.
    ///
    /// Bad outcomes are everything other than `Ok` and `Filtered`.
    pub fn is_bad(self) -> bool {
        !matches!(self, Status::Ok | Status::Filtered)
    }

    /// Classifies an observation: interesting observations flag the subject.
    pub fn of_obs(obs: &Obs) -> Status {
        if obs.flags.is_interesting() {
            Status::Flagged
        } else {
            Status::Ok
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown status {0:?}")]
pub struct BadStatusName(String);

impl FromStr for Status {
    type Err = BadStatusName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|v| s == v.to_string())
            .ok_or_else(|| BadStatusName(s.to_owned()))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "Ok",
            Status::Filtered => "Filtered",
            Status::Flagged => "Flagged",
            Status::CompileFail => "CompileFail",
            Status::CompileTimeout => "CompileTimeout",
            Status::RunFail => "RunFail",
            Status::RunTimeout => "RunTimeout",
        };
        f.write_str(name)
    }
}
