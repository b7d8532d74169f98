//! Exclusion matching for the logging and tracing concerns.
//!
//! RPC rules are exact matches against the full method name. HTTP rules are
//! URI path prefixes. Rules are fixed once the server is built.

use std::collections::HashSet;

/// Returns `true` iff `name` is exactly one of `rules`.
pub fn is_excluded(name: &str, rules: &HashSet<String>) -> bool {
    !rules.is_empty() && rules.contains(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    Exact,
    Prefix,
}

/// An immutable set of excluded call names.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    mode: MatchMode,
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl ExclusionRules {
    /// Rules that never exclude anything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn exact<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: MatchMode::Exact,
            exact: names.into_iter().map(Into::into).collect(),
            prefixes: Vec::new(),
        }
    }

    /// Prefix rules. Empty prefixes are dropped, they would exclude every
    /// call.
    pub fn prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: MatchMode::Prefix,
            exact: HashSet::new(),
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        match self.mode {
            MatchMode::Exact => self.exact.len(),
            MatchMode::Prefix => self.prefixes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        match self.mode {
            MatchMode::Exact => is_excluded(name, &self.exact),
            MatchMode::Prefix => self.prefixes.iter().any(|p| name.starts_with(p.as_str())),
        }
    }
}
