//! Analysis filters: regex-over-log rules that rescue known-benign compiler
//! failures.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::id::Id;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("bad filter pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("filter file: {0}")]
    Json(#[from] serde_json::Error),
}

/// One filter rule as written in the filter file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Glob over compiler style IDs this filter applies to.
    pub compiler_style: Id,
    /// Regex matched against the subject's compile log.
    pub pattern: String,
}

#[derive(Debug)]
struct Compiled {
    style_glob: Id,
    regex: Regex,
}

/// A compiled filter set, loaded once at stage configuration.
#[derive(Debug, Default)]
pub struct FilterSet(Vec<Compiled>);

impl FilterSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compiles a set of filter rules.
    pub fn compile(filters: Vec<Filter>) -> Result<Self, FilterError> {
        let compiled = filters
            .into_iter()
            .map(|f| {
                let regex = Regex::new(&f.pattern).map_err(|source| FilterError::BadPattern {
                    pattern: f.pattern.clone(),
                    source,
                })?;
                Ok(Compiled {
                    style_glob: f.compiler_style,
                    regex,
                })
            })
            .collect::<Result<_, FilterError>>()?;
        Ok(Self(compiled))
    }

    /// Loads and compiles a filter file (a JSON list of rules).
    pub fn load(path: &Path) -> Result<Self, FilterError> {
        let file = std::fs::File::open(path)?;
        let filters: Vec<Filter> = serde_json::from_reader(file)?;
        Self::compile(filters)
    }

    /// Whether any rule applying to `style` matches `log`.
    pub fn any_match(&self, style: &Id, log: &str) -> bool {
        self.0
            .iter()
            .any(|f| style.matches_glob(&f.style_glob) && f.regex.is_match(log))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::id::id;

    fn set() -> FilterSet {
        FilterSet::compile(vec![
            Filter {
                compiler_style: id("gcc.*"),
                pattern: "internal compiler error".into(),
            },
            Filter {
                compiler_style: id("*"),
                pattern: r"ld: cannot find -l\w+".into(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn match_respects_style_glob() {
        let s = set();
        assert!(s.any_match(&id("gcc.8"), "x: internal compiler error: y"));
        assert!(!s.any_match(&id("clang"), "x: internal compiler error: y"));
        assert!(s.any_match(&id("clang"), "ld: cannot find -lpthread"));
    }

    #[test]
    fn bad_pattern_is_reported() {
        let err = FilterSet::compile(vec![Filter {
            compiler_style: id("gcc"),
            pattern: "(".into(),
        }])
        .unwrap_err();
        assert!(matches!(err, FilterError::BadPattern { .. }));
    }

    #[test]
    fn load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"[{{"compiler_style": "gcc", "pattern": "segfault"}}]"#
        )
        .unwrap();
        let s = FilterSet::load(f.path()).unwrap();
        assert!(s.any_match(&id("gcc"), "compiler segfault here"));
    }
}
