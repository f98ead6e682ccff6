//! Observations: the parsed outcome of running a litmus binary under a
//! backend.

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Property flags attached to a whole observation.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Flag: u8 {
        /// All states met the postcondition (or, with `EXIST`, at least one
        /// did).
        const SAT = 1 << 0;
        /// At least one state missed the postcondition (or, with `EXIST`,
        /// none met it).
        const UNSAT = 1 << 1;
        /// The run strayed into undefined behaviour.
        const UNDEF = 1 << 2;
        /// The postcondition is existential rather than universal.
        const EXIST = 1 << 3;
        /// The backend stopped before exploring every state.
        const PARTIAL = 1 << 4;
    }
}

#[derive(Debug, thiserror::Error)]
#[error("bad observation flag {0:?}")]
pub struct BadFlagName(String);

const FLAG_NAMES: [(&str, Flag); 5] = [
    ("sat", Flag::SAT),
    ("unsat", Flag::UNSAT),
    ("undef", Flag::UNDEF),
    ("exist", Flag::EXIST),
    ("partial", Flag::PARTIAL),
];

impl Flag {
    /// Whether this flag set suggests a potential compiler bug.
    ///
    /// Partiality produces false negatives, not false positives, so it is
    /// not interesting on its own.
    pub fn is_interesting(self) -> bool {
        self.contains(Flag::UNDEF)
            || self.contains(Flag::SAT | Flag::EXIST)
            || (self.contains(Flag::UNSAT) && !self.contains(Flag::EXIST))
            || !self.intersects(Flag::SAT | Flag::UNSAT)
    }

    /// The lowercase names of every set flag, in declaration order.
    pub fn names(self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, BadFlagName> {
        let mut flags = Flag::empty();
        for name in names {
            let (_, f) = FLAG_NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .ok_or_else(|| BadFlagName(name.to_owned()))?;
            flags |= *f;
        }
        Ok(flags)
    }
}

impl Serialize for Flag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        Flag::from_names(names.iter().map(String::as_str)).map_err(serde::de::Error::custom)
    }
}

/// How one state relates to the postcondition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateTag {
    #[default]
    Unknown,
    /// The state satisfies the postcondition.
    Witness,
    /// The state violates the postcondition.
    Counter,
}

/// One observed final state, with its occurrence count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub occurrences: u64,
    #[serde(default)]
    pub tag: StateTag,
    /// Variable-to-value bindings, keyed by variable name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// A full observation record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obs {
    #[serde(default, skip_serializing_if = "Flag::is_empty")]
    pub flags: Flag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<State>,
}

impl Obs {
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.states.is_empty()
    }

    /// The states tagged as witnesses.
    pub fn witnesses(&self) -> impl Iterator<Item = &State> {
        self.states.iter().filter(|s| s.tag == StateTag::Witness)
    }

    /// The states tagged as counter-examples.
    pub fn counter_examples(&self) -> impl Iterator<Item = &State> {
        self.states.iter().filter(|s| s.tag == StateTag::Counter)
    }
}
