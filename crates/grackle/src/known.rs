//! The known-error set.
//!
//! A flat file of error prefixes, one per line, loaded once at startup.
//! A failure whose first line starts with one of these prefixes is counted
//! separately and never held against a production's reputation.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::Result;

/// How much of a failure's first line takes part in the lookup.
const PREFIX_CHARS: usize = 80;

#[derive(Debug, Default)]
pub struct KnownErrors {
    set: HashSet<String>,
}

impl KnownErrors {
    /// Load the set from a file. Blank lines are ignored; every other line,
    /// stripped of its trailing newline, is inserted verbatim.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::from_lines(text.lines()))
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let set = lines
            .into_iter()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self { set }
    }

    /// Is this exact prefix registered?
    pub fn contains(&self, prefix: &str) -> bool {
        self.set.contains(prefix)
    }

    /// Does a failure message match the set? Compares the first
    /// [`PREFIX_CHARS`] characters of the message's first line.
    pub fn matches(&self, message: &str) -> bool {
        self.set.contains(error_prefix(message))
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// The lookup key for a failure message: first line, truncated to
/// [`PREFIX_CHARS`] characters.
pub fn error_prefix(message: &str) -> &str {
    let line = message.split('\n').next().unwrap_or("");
    match line.char_indices().nth(PREFIX_CHARS) {
        Some((at, _)) => &line[..at],
        None => line,
    }
}
