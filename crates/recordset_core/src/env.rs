//! Per-request execution environment.
//!
//! # Responsibility
//! - Bundle the acting user, the context map, the storage handle and the
//!   record cache of one unit of work.
//! - Count and log every storage round trip.
//! - Provide the transaction adapter that commits on success and rolls back
//!   on the first failure.
//!
//! # Invariants
//! - An `Environment` is single-threaded (`!Sync`); each request builds its own.
//! - Negative ids minted here are unique within the environment.
//! - Cache borrows are never held across storage calls.

use crate::cache::Cache;
use crate::collection::RecordCollection;
use crate::db::{DbResult, Storage};
use crate::error::CoreResult;
use crate::i18n::Translate;
use crate::logging::STORAGE_TARGET;
use crate::registry::Registry;
use crate::security::{AccessControl, AllowAll, SUPERUSER_ID};
use crate::value::{FieldMap, Value};
use log::{debug, error, info};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Arbitrary key/value map carried by an environment or a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Whether `key` is set to a truthy value.
    pub fn is_true(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Boolean(flag)) => *flag,
            Some(Value::Integer(value)) => *value != 0,
            Some(Value::Text(value)) => !value.is_empty(),
            _ => false,
        }
    }

    pub fn lang(&self) -> Option<&str> {
        self.values.get("lang").and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Configuration of an [`Environment`], independent of the storage handle.
#[derive(Clone)]
pub struct EnvironmentBuilder {
    registry: Arc<Registry>,
    uid: i64,
    context: Context,
    access: Arc<dyn AccessControl>,
    translator: Option<Arc<dyn Translate>>,
}

impl EnvironmentBuilder {
    pub fn uid(mut self, uid: i64) -> Self {
        self.uid = uid;
        self
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn translator(mut self, translator: Arc<dyn Translate>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn build(self, storage: &dyn Storage) -> Environment<'_> {
        Environment {
            registry: self.registry,
            storage,
            uid: self.uid,
            context: self.context,
            cache: RefCell::new(Cache::new()),
            next_negative_id: Cell::new(-1),
            statements: Cell::new(0),
            access: self.access,
            translator: self.translator,
        }
    }
}

/// Execution context of one unit of work.
pub struct Environment<'a> {
    registry: Arc<Registry>,
    storage: &'a dyn Storage,
    uid: i64,
    context: Context,
    cache: RefCell<Cache>,
    next_negative_id: Cell<i64>,
    statements: Cell<u64>,
    access: Arc<dyn AccessControl>,
    translator: Option<Arc<dyn Translate>>,
}

impl<'a> Environment<'a> {
    /// Starts a builder acting as the superuser with an empty context.
    pub fn builder(registry: Arc<Registry>) -> EnvironmentBuilder {
        EnvironmentBuilder {
            registry,
            uid: SUPERUSER_ID,
            context: Context::new(),
            access: Arc::new(AllowAll),
            translator: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn access(&self) -> &dyn AccessControl {
        self.access.as_ref()
    }

    pub fn translator(&self) -> Option<&dyn Translate> {
        self.translator.as_deref()
    }

    /// Empty, unfetched collection of `model`.
    pub fn pool(&self, model: &str) -> CoreResult<RecordCollection<'_>> {
        let model = self.registry.model(model)?;
        Ok(RecordCollection::new(self, model))
    }

    /// Fetched collection of `model` holding `ids`.
    pub fn browse(&self, model: &str, ids: &[i64]) -> CoreResult<RecordCollection<'_>> {
        Ok(self.pool(model)?.with_ids(ids.iter().copied()))
    }

    /// Number of storage statements issued so far.
    pub fn statement_count(&self) -> u64 {
        self.statements.get()
    }

    pub(crate) fn next_negative_id(&self) -> i64 {
        let id = self.next_negative_id.get();
        self.next_negative_id.set(id - 1);
        id
    }

    pub(crate) fn cache(&self) -> Ref<'_, Cache> {
        self.cache.borrow()
    }

    pub(crate) fn cache_mut(&self) -> RefMut<'_, Cache> {
        self.cache.borrow_mut()
    }

    pub(crate) fn execute(&self, sql: &str, args: &[Value]) -> DbResult<usize> {
        self.run(sql, |storage| storage.execute(sql, args))
    }

    pub(crate) fn query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<FieldMap>> {
        self.run(sql, |storage| storage.query(sql, args))
    }

    pub(crate) fn get(&self, sql: &str, args: &[Value]) -> DbResult<Option<Value>> {
        self.run(sql, |storage| storage.get(sql, args))
    }

    pub(crate) fn select(&self, sql: &str, args: &[Value]) -> DbResult<Vec<Value>> {
        self.run(sql, |storage| storage.select(sql, args))
    }

    fn run<T, F>(&self, sql: &str, call: F) -> DbResult<T>
    where
        F: FnOnce(&dyn Storage) -> DbResult<T>,
    {
        let started_at = Instant::now();
        self.statements.set(self.statements.get() + 1);
        let result = call(self.storage);
        match &result {
            Ok(_) => debug!(
                target: STORAGE_TARGET,
                "event=sql module=storage status=ok duration_ms={} statement={}",
                started_at.elapsed().as_millis(),
                statement_kind(sql)
            ),
            Err(err) => error!(
                target: STORAGE_TARGET,
                "event=sql module=storage status=error duration_ms={} statement={} error={}",
                started_at.elapsed().as_millis(),
                statement_kind(sql),
                err
            ),
        }
        result
    }
}

impl Debug for Environment<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("uid", &self.uid)
            .field("context", &self.context)
            .field("statements", &self.statements.get())
            .finish()
    }
}

fn statement_kind(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

/// Current time as Unix epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// Runs `work` in an immediate transaction with a fresh environment.
///
/// Commits when `work` returns `Ok`, rolls back otherwise; no partial write
/// of a failed unit of work survives.
pub fn with_transaction<T, F>(
    conn: &Connection,
    builder: EnvironmentBuilder,
    work: F,
) -> CoreResult<T>
where
    F: FnOnce(&Environment<'_>) -> CoreResult<T>,
{
    let started_at = Instant::now();
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let (result, statements) = {
        let env = builder.build(&*tx);
        let result = work(&env);
        (result, env.statement_count())
    };
    match result {
        Ok(value) => {
            tx.commit()?;
            info!(
                "event=transaction module=env status=ok duration_ms={} statements={}",
                started_at.elapsed().as_millis(),
                statements
            );
            Ok(value)
        }
        Err(err) => {
            tx.rollback()?;
            info!(
                "event=transaction module=env status=rollback duration_ms={} statements={} error_code={}",
                started_at.elapsed().as_millis(),
                statements,
                err.code()
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{statement_kind, Context};
    use crate::value::Value;

    #[test]
    fn truthy_context_values() {
        let context = Context::new()
            .with("skip_check_constraints", true)
            .with("force_compute_write", 0)
            .with("lang", "fr");
        assert!(context.is_true("skip_check_constraints"));
        assert!(!context.is_true("force_compute_write"));
        assert!(!context.is_true("missing"));
        assert_eq!(context.lang(), Some("fr"));
        assert_eq!(context.get("lang"), Some(&Value::from("fr")));
    }

    #[test]
    fn statement_kind_is_first_keyword() {
        assert_eq!(statement_kind("SELECT \"id\" FROM \"sale\""), "SELECT");
        assert_eq!(statement_kind("  "), "unknown");
    }
}
