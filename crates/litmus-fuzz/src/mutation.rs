//! Compiler mutation-testing support: mutant identifiers, the per-plan
//! mutation configuration, and the scanner that picks mutant hit reports out
//! of compiler output.

use std::{
    collections::BTreeMap,
    io::{self, BufRead},
};

use serde::{Deserialize, Serialize};

/// The index of a mutant inside an instrumented compiler.
pub type Mutant = u64;

/// A map from mutant index to the number of times it was hit.
///
/// A mutant that is present with count zero was selected but never hit.
pub type HitMap = BTreeMap<Mutant, u64>;

/// Prefix of lines reporting that a mutant fired.
pub const HIT_PREFIX: &str = "MUTATION HIT:";
/// Prefix of lines reporting that a mutant was chosen.
pub const SELECT_PREFIX: &str = "MUTATION SELECTED:";

/// Per-plan mutation configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub enabled: bool,
    /// Half-open range of mutant indices to draw from when perturbing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<MutantRange>,
}

/// A half-open range `[start, end)` of mutant indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantRange {
    pub start: Mutant,
    pub end: Mutant,
}

impl MutantRange {
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Scans `r` line by line, accumulating mutant selections and hits.
///
/// Hit counts come from stderr lines only; trailing junk after the index is
/// tolerated, and lines whose index does not parse are ignored.
pub fn scan_lines<R: BufRead>(r: R) -> io::Result<HitMap> {
    let mut hits = HitMap::new();
    for line in r.lines() {
        scan_line(&line?, &mut hits);
    }
    Ok(hits)
}

fn scan_line(line: &str, hits: &mut HitMap) {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(HIT_PREFIX) {
        if let Some(index) = leading_index(rest) {
            *hits.entry(index).or_default() += 1;
        }
    } else if let Some(rest) = line.strip_prefix(SELECT_PREFIX)
        && let Some(index) = leading_index(rest)
    {
        hits.entry(index).or_default();
    }
}

fn leading_index(rest: &str) -> Option<Mutant> {
    rest.split_whitespace().next()?.parse().ok()
}
