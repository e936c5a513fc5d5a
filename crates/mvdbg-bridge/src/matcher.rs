//! Reply-line matchers.
//!
//! A closed set of predicate shapes instead of arbitrary closures, so
//! router decisions stay inspectable in logs and deterministic in tests.

use smol_str::SmolStr;

/// Predicate deciding whether a reply line answers a request or feeds a
/// persistent callback.
#[derive(Debug, Clone)]
pub enum LineMatcher {
    /// The whole line equals the text.
    Equals(SmolStr),
    /// The line starts with the text.
    Prefix(SmolStr),
    /// The line contains the text anywhere.
    Contains(SmolStr),
    /// The line matches a regular expression.
    Regex(regex::Regex),
    /// An arbitrary pure predicate.
    Custom(fn(&str) -> bool),
}

impl LineMatcher {
    #[must_use]
    pub fn equals(text: impl Into<SmolStr>) -> Self {
        Self::Equals(text.into())
    }

    #[must_use]
    pub fn prefix(text: impl Into<SmolStr>) -> Self {
        Self::Prefix(text.into())
    }

    #[must_use]
    pub fn contains(text: impl Into<SmolStr>) -> Self {
        Self::Contains(text.into())
    }

    #[must_use]
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::Equals(text) => line == text.as_str(),
            Self::Prefix(text) => line.starts_with(text.as_str()),
            Self::Contains(text) => line.contains(text.as_str()),
            Self::Regex(pattern) => pattern.is_match(line),
            Self::Custom(predicate) => predicate(line),
        }
    }
}
