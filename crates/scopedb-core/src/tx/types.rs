//! Scope, mode and terminal-state vocabulary shared by the scheduler and backends

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl TransactionMode {
    /// True if a transaction in this mode can serve a request in `requested`.
    pub fn satisfies(self, requested: TransactionMode) -> bool {
        match self {
            TransactionMode::ReadWrite => true,
            TransactionMode::ReadOnly => requested == TransactionMode::ReadOnly,
        }
    }

    pub fn is_write(self) -> bool {
        self == TransactionMode::ReadWrite
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::ReadOnly => f.write_str("readonly"),
            TransactionMode::ReadWrite => f.write_str("readwrite"),
        }
    }
}

/// Set of store names a transaction or request touches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Scope(BTreeSet<String>);

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, store: &str) -> bool {
        self.0.contains(store)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_superset(&self, other: &Scope) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn extend(&mut self, other: &Scope) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn union(&self, other: &Scope) -> Scope {
        let mut scope = self.clone();
        scope.extend(other);
        scope
    }
}

impl From<&str> for Scope {
    fn from(store: &str) -> Self {
        Scope(BTreeSet::from([store.to_string()]))
    }
}

impl From<String> for Scope {
    fn from(store: String) -> Self {
        Scope(BTreeSet::from([store]))
    }
}

impl<const N: usize> From<[&str; N]> for Scope {
    fn from(stores: [&str; N]) -> Self {
        stores.into_iter().collect()
    }
}

impl From<&[&str]> for Scope {
    fn from(stores: &[&str]) -> Self {
        stores.iter().copied().collect()
    }
}

impl<'a> FromIterator<&'a str> for Scope {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Scope(iter.into_iter().map(str::to_string).collect())
    }
}

impl FromIterator<String> for Scope {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Scope(iter.into_iter().collect())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// How a transaction context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    Complete,
    Error,
    Abort,
}

impl TerminalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalKind::Complete => "complete",
            TerminalKind::Error => "error",
            TerminalKind::Abort => "abort",
        }
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal event reported by a backend on commit or abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEvent {
    pub kind: TerminalKind,
    pub detail: Option<String>,
}

impl TerminalEvent {
    pub fn complete() -> Self {
        Self {
            kind: TerminalKind::Complete,
            detail: None,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            kind: TerminalKind::Error,
            detail: Some(detail.into()),
        }
    }

    pub fn abort(detail: impl Into<String>) -> Self {
        Self {
            kind: TerminalKind::Abort,
            detail: Some(detail.into()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.kind == TerminalKind::Complete
    }
}

/// Lifecycle state of a transaction context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Created,
    Active,
    Completed,
    Errored,
    Aborted,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Completed | TxState::Errored | TxState::Aborted)
    }
}

impl From<TerminalKind> for TxState {
    fn from(kind: TerminalKind) -> Self {
        match kind {
            TerminalKind::Complete => TxState::Completed,
            TerminalKind::Error => TxState::Errored,
            TerminalKind::Abort => TxState::Aborted,
        }
    }
}
