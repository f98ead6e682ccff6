//! Pipeline stages and the records plans keep of them.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The stages a plan can pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Plan,
    Perturb,
    Fuzz,
    Lift,
    /// The invoker shipping the machine-local stage somewhere else.
    Invoke,
    Compile,
    Run,
    Analyse,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Plan,
        Stage::Perturb,
        Stage::Fuzz,
        Stage::Lift,
        Stage::Invoke,
        Stage::Compile,
        Stage::Run,
        Stage::Analyse,
    ];

    /// The order in which the director drives stages after planning.
    pub const PIPELINE: [Stage; 5] = [
        Stage::Perturb,
        Stage::Fuzz,
        Stage::Lift,
        Stage::Invoke,
        Stage::Analyse,
    ];

    /// The stage that must already be recorded before this one may run.
    ///
    /// Most stages only need planning to have happened; the machine-local
    /// pair is stricter, since running something unlifted or uncompiled is
    /// meaningless.
    pub fn prerequisite(self) -> Option<Stage> {
        match self {
            Stage::Plan => None,
            Stage::Perturb | Stage::Fuzz | Stage::Lift | Stage::Invoke | Stage::Analyse => {
                Some(Stage::Plan)
            }
            Stage::Compile => Some(Stage::Lift),
            Stage::Run => Some(Stage::Compile),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown stage {0:?}")]
pub struct BadStageName(String);

impl FromStr for Stage {
    type Err = BadStageName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|v| s == v.to_string())
            .ok_or_else(|| BadStageName(s.to_owned()))
    }
}

/// The record a completed stage leaves in the plan's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub stage: Stage,
    /// When the stage finished.
    pub completed_on: DateTime<Utc>,
    #[serde(default)]
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_capitalised_names() {
        for stage in Stage::ALL {
            let js = serde_json::to_string(&stage).unwrap();
            assert_eq!(js, format!("\"{stage}\""));
            assert_eq!(serde_json::from_str::<Stage>(&js).unwrap(), stage);
        }
    }

    #[test]
    fn from_str_round_trip() {
        assert_eq!("Plan".parse::<Stage>().unwrap(), Stage::Plan);
        assert!("Nonsuch".parse::<Stage>().is_err());
    }

    #[test]
    fn pipeline_prerequisites_chain() {
        // Each pipeline stage's prerequisite chain bottoms out at planning.
        for stage in Stage::PIPELINE {
            let mut cur = Some(stage);
            let mut steps = 0;
            while let Some(s) = cur {
                cur = s.prerequisite();
                steps += 1;
                assert!(steps < 10, "prerequisite cycle at {s}");
            }
        }
    }
}
