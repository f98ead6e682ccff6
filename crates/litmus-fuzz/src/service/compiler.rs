//! Compiler specifications, configured instances, and the driver/inspector
//! interfaces.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io::Write,
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    id::Id,
    mutation::Mutant,
    quantity::Timeout,
    service::{DriverError, RunInfo},
    sync::Context,
};

pub mod optlevel {
    //! Optimisation levels and the selections that enable or disable them.

    use std::collections::{BTreeMap, BTreeSet};

    use serde::{Deserialize, Serialize};

    /// What an optimisation level optimises for.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Bias {
        #[default]
        Unknown,
        Debug,
        Size,
        Speed,
    }

    /// Properties of a single optimisation level.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Level {
        /// Whether the level actually performs optimisation.
        #[serde(default)]
        pub optimises: bool,
        #[serde(default)]
        pub bias: Bias,
        /// Whether the level takes liberties with the language standard.
        #[serde(default)]
        pub breaks_standards: bool,
    }

    /// An optimisation level with the name used to select it.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Named {
        pub name: String,
        #[serde(flatten)]
        pub level: Level,
    }

    /// A user selection over a default name set.
    ///
    /// Disables take priority over enables.  Applying a selection never
    /// mutates the defaults.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Selection {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub enabled: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub disabled: Vec<String>,
    }

    impl Selection {
        pub fn apply(&self, defaults: &BTreeSet<String>) -> BTreeSet<String> {
            let mut set = defaults.clone();
            set.extend(self.enabled.iter().cloned());
            for name in &self.disabled {
                set.remove(name);
            }
            set
        }

        /// Applies this selection to the key set of a level map.
        pub fn apply_levels(
            &self,
            defaults: &BTreeMap<String, Level>,
            all: &BTreeMap<String, Level>,
        ) -> BTreeMap<String, Level> {
            let names = self.apply(&defaults.keys().cloned().collect());
            names
                .into_iter()
                .filter_map(|n| {
                    let level = all.get(&n).or_else(|| defaults.get(&n))?;
                    Some((n, *level))
                })
                .collect()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn disables_beat_enables() {
            let defaults: BTreeSet<_> = ["1", "2", "3"].map(String::from).into();
            let sel = Selection {
                enabled: vec!["fast".into(), "g".into()],
                disabled: vec!["fast".into(), "2".into()],
            };
            let got = sel.apply(&defaults);
            let want: BTreeSet<_> = ["1", "3", "g"].map(String::from).into();
            assert_eq!(got, want);
            // The defaults are untouched.
            assert_eq!(defaults.len(), 3);
        }
    }
}

/// The configuration of one compiler as the user wrote it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compiler {
    /// The compiler's style (`gcc`, for instance), driving driver selection.
    pub style: Id,
    /// Architecture the compiler targets.
    pub arch: Id,
    /// How to invoke the compiler, if not the style default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunInfo>,
    /// Optimisation-level selection over the inspector's defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt: Option<optlevel::Selection>,
    /// Machine-profile (march) selection over the inspector's defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub march: Option<optlevel::Selection>,
}

/// A compiler after perturbation: the configuration plus the choices made
/// for this cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Selected optimisation level, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_opt: Option<optlevel::Named>,
    /// Selected march, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_march: Option<String>,
    /// When this configuration was generated; doubles as a mutation seed.
    #[serde(default)]
    pub config_time: Option<DateTime<Utc>>,
    /// Mutant selected for this cycle, when mutation testing is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutant: Option<Mutant>,
    #[serde(flatten)]
    pub compiler: Compiler,
}

impl Instance {
    pub fn selected_opt_name(&self) -> Option<&str> {
        self.selected_opt.as_ref().map(|o| o.name.as_str())
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.compiler.style, self.compiler.arch)?;
        if let Some(opt) = self.selected_opt_name() {
            write!(f, " opt {opt:?}")?;
        }
        if let Some(march) = &self.selected_march {
            write!(f, " march {march:?}")?;
        }
        Ok(())
    }
}

/// Compiler instances keyed by compiler ID, iterated in ID order.
pub type InstanceMap = BTreeMap<Id, Instance>;

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("compiler style {0} not known to inspector")]
    UnknownStyle(Id),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Knows the default optimisation levels and march values of each compiler
/// style.
pub trait Inspector {
    fn default_opt_levels(
        &self,
        compiler: &Compiler,
    ) -> Result<BTreeMap<String, optlevel::Level>, InspectError>;

    /// Every level the style supports, selectable or not.
    fn opt_levels(
        &self,
        compiler: &Compiler,
    ) -> Result<BTreeMap<String, optlevel::Level>, InspectError>;

    fn default_marches(&self, compiler: &Compiler) -> Result<BTreeSet<String>, InspectError>;
}

/// What a compile request is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileKind {
    Obj,
    Exe,
}

/// One request dispatched to a compiler driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub kind: CompileKind,
    pub out: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub timeout: Timeout,
}

/// The single-method compiler driver contract.
///
/// Drivers stream compiler stderr into the supplied sink and must honour
/// both the job timeout and context cancellation.
pub trait Driver {
    fn run_compile(
        &self,
        ctx: &Context,
        instance: &Instance,
        job: &CompileJob,
        stderr: &mut dyn Write,
    ) -> Result<(), DriverError>;
}
