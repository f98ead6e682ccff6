//! Machine descriptors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::Id;

/// A description of one target machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Number of cores available for test running.
    #[serde(default)]
    pub cores: usize,
    /// Remote access configuration; absent for the local machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<Ssh>,
}

impl Machine {
    pub fn is_remote(&self) -> bool {
        self.ssh.is_some()
    }
}

/// The surface of an SSH connection to a remote machine.
///
/// Transport details are an external concern; the director only threads this
/// through to the runner factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ssh {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Remote scratch directory.
    pub dir: String,
}

/// A machine together with its identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedMachine {
    pub id: Id,
    #[serde(flatten)]
    pub machine: Machine,
}

/// The machine set a director drives, keyed and iterated in ID order.
pub type MachineMap = BTreeMap<Id, Machine>;

/// Filters `machines` down to those whose ID matches `glob`.
pub fn filter_machines(machines: MachineMap, glob: &Id) -> MachineMap {
    machines
        .into_iter()
        .filter(|(id, _)| id.matches_glob(glob))
        .collect()
}
