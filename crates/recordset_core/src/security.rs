//! Access-control collaborator contracts.
//!
//! # Responsibility
//! - Define the permission check and record-rule seams consulted by record
//!   collections before reading or mutating rows.
//! - Provide a permissive default and a table-driven policy.
//!
//! # Invariants
//! - The superuser bypasses every check and rule of [`AccessPolicy`].
//! - Record rules only ever narrow a query; they never widen it.

use crate::error::{CoreError, CoreResult};
use crate::query::Condition;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

/// User id bypassing [`AccessPolicy`] checks.
pub const SUPERUSER_ID: i64 = 1;

/// Operation kind checked against the access-control layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Read,
    Write,
    Create,
    Unlink,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Create => "create",
            Self::Unlink => "unlink",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission and record-rule evaluator.
pub trait AccessControl: Send + Sync {
    /// Fails with [`CoreError::Permission`] when `uid` may not run `operation`
    /// on `model`.
    fn check_permission(&self, uid: i64, model: &str, operation: Operation) -> CoreResult<()>;

    /// Condition restricting the rows `uid` may act on.
    fn record_rule(&self, _uid: i64, _model: &str, _operation: Operation) -> Option<Condition> {
        None
    }
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check_permission(&self, _uid: i64, _model: &str, _operation: Operation) -> CoreResult<()> {
        Ok(())
    }
}

/// Static deny list plus record rules, keyed by model and operation.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    denied: BTreeSet<(String, Operation)>,
    rules: BTreeMap<(String, Operation), Condition>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, model: &str, operation: Operation) -> Self {
        self.denied.insert((model.to_string(), operation));
        self
    }

    /// Adds a record rule; rules on the same key are intersected.
    pub fn rule(mut self, model: &str, operation: Operation, condition: Condition) -> Self {
        let key = (model.to_string(), operation);
        let combined = match self.rules.remove(&key) {
            Some(existing) => existing.and(condition),
            None => condition,
        };
        self.rules.insert(key, combined);
        self
    }
}

impl AccessControl for AccessPolicy {
    fn check_permission(&self, uid: i64, model: &str, operation: Operation) -> CoreResult<()> {
        if uid == SUPERUSER_ID || !self.denied.contains(&(model.to_string(), operation)) {
            return Ok(());
        }
        Err(CoreError::Permission {
            uid,
            model: model.to_string(),
            operation,
        })
    }

    fn record_rule(&self, uid: i64, model: &str, operation: Operation) -> Option<Condition> {
        if uid == SUPERUSER_ID {
            return None;
        }
        self.rules.get(&(model.to_string(), operation)).cloned()
    }
}
