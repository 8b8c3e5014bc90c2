//! Repository selector service.
//!
//! Turns the full list of repository names known to a server into the
//! ordered work set of one repo group. Selection is a pure function of the
//! names and the selector, so repeated runs over the same inventory always
//! produce the same list in the same order.

use regex::Regex;

use crate::error::{AppError, Result};

/// Include/exclude pattern pair.
///
/// A name is selected when it matches `include` (absent = match all) and
/// does not match `exclude` (absent = match none). Exclude wins on overlap.
#[derive(Debug, Clone, Default)]
pub struct RepoSelector {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl RepoSelector {
    pub fn new(include: Option<Regex>, exclude: Option<Regex>) -> Self {
        Self { include, exclude }
    }

    /// Compile a selector from raw patterns. Empty strings count as absent.
    pub fn from_patterns(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        Ok(Self {
            include: compile_pattern(include, "regex_include")?,
            exclude: compile_pattern(exclude, "regex_exclude")?,
        })
    }

    pub fn include_pattern(&self) -> Option<&str> {
        self.include.as_ref().map(Regex::as_str)
    }

    pub fn exclude_pattern(&self) -> Option<&str> {
        self.exclude.as_ref().map(Regex::as_str)
    }

    pub fn matches(&self, name: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(name) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(name),
            None => true,
        }
    }

    /// Select matching names, sorted lexically and deduplicated.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Vec<String> {
        let mut selected: Vec<String> = names
            .iter()
            .map(|name| name.as_ref())
            .filter(|name| self.matches(name))
            .map(str::to_string)
            .collect();
        selected.sort();
        selected.dedup();
        selected
    }
}

fn compile_pattern(pattern: Option<&str>, field: &str) -> Result<Option<Regex>> {
    match pattern.map(str::trim) {
        None | Some("") => Ok(None),
        Some(p) => Regex::new(p)
            .map(Some)
            .map_err(|e| AppError::Validation(format!("invalid {} '{}': {}", field, p, e))),
    }
}
