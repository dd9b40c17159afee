//! Create, write and unlink pipelines.
//!
//! Every pipeline runs inside the caller's transaction: the first error
//! aborts it and the transaction adapter rolls the whole unit back.

use super::RecordCollection;
use crate::data::RecordData;
use crate::db::DbError;
use crate::env::now_millis;
use crate::error::{CoreError, CoreResult};
use crate::logging::COLLECTION_TARGET;
use crate::query::sql::{delete_query, insert_query, quote, update_query};
use crate::query::Condition;
use crate::registry::field::FieldType;
use crate::resolver::{comodel_of, known_field};
use crate::security::Operation;
use crate::value::{FieldMap, Value};
use log::info;
use std::collections::BTreeMap;
use std::time::Instant;

const BOOKKEEPING_FIELDS: [&str; 2] = ["write_date", "write_uid"];

/// Switches of the internal write pipeline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteOptions {
    /// Store computed fields instead of skipping them.
    pub(crate) force_compute: bool,
    pub(crate) check_access: bool,
}

impl WriteOptions {
    const USER: Self = Self {
        force_compute: false,
        check_access: true,
    };

    pub(crate) const RECOMPUTE: Self = Self {
        force_compute: true,
        check_access: false,
    };
}

impl<'e> RecordCollection<'e> {
    /// Inserts one record and returns it as a singleton collection.
    ///
    /// Missing fields take their defaults; queued related records are
    /// created and linked; stored computed fields are computed and declared
    /// constraints checked before returning.
    pub fn create(&self, data: RecordData) -> CoreResult<Self> {
        let started_at = Instant::now();
        let env = self.env;
        let model = self.model;
        env.access()
            .check_permission(env.uid(), model.name(), Operation::Create)?;

        let mut data = data;
        self.create_fk_relation_records(&mut data)?;
        let RecordData {
            mut values,
            to_create,
        } = data;
        let changed = changed_fields(&values, &to_create);

        for (name, value) in self.default_get() {
            let skip = model
                .field(&name)
                .map_or(true, |field| field.is_computed() || field.is_related());
            if !skip && name != "id" {
                values.entry(name).or_insert(value);
            }
        }
        if !model.is_system() {
            let now = Value::Integer(now_millis());
            let uid = Value::Integer(env.uid());
            values.insert("create_date".to_string(), now.clone());
            values.insert("create_uid".to_string(), uid.clone());
            values.insert("write_date".to_string(), now);
            values.insert("write_uid".to_string(), uid);
        }
        let mut values = self.coerce_values(values)?;
        if values.get("id").is_some_and(|id| id.as_i64().unwrap_or_default() == 0) {
            values.remove("id");
        }

        let columns = self.column_values(&values, self.context.is_true("force_compute_write"));
        let (sql, args) = insert_query(model.table(), &columns);
        let id = env
            .get(&sql, &args)
            .map_err(|err| self.storage_error(err))?
            .and_then(|id| id.as_i64())
            .ok_or_else(|| {
                CoreError::invariant(format!("insert into {} returned no id", model.table()))
            })?;
        env.cache_mut().add_record(model, id, &columns, "");

        let record = self.with_ids([id]);
        let parents = record.reverse_parents(&columns)?;
        record.invalidate_reverse_parents(&parents)?;
        record.update_relation_fields(&values)?;
        record.update_related_fields(&values)?;
        record.write_contexted(&values)?;
        record.create_reverse_relation_records(to_create)?;
        record.process_inverse_methods(&values)?;
        record.process_triggers(&changed, true)?;
        record.process_reverse_triggers(&parents)?;
        record.check_constraints(&model.field_names())?;

        info!(
            target: COLLECTION_TARGET,
            "event=record_create module=collection status=ok model={} id={} duration_ms={}",
            model.name(),
            id,
            started_at.elapsed().as_millis()
        );
        Ok(record)
    }

    /// Updates every record with `data`.
    ///
    /// Records outside the user's write rule are skipped silently; in-memory
    /// records are only updated in the cache.
    pub fn write(&self, data: RecordData) -> CoreResult<()> {
        self.write_values(data, WriteOptions::USER)
    }

    pub(crate) fn write_values(&self, data: RecordData, options: WriteOptions) -> CoreResult<()> {
        if data.values.is_empty() && data.to_create.is_empty() {
            return Ok(());
        }
        let started_at = Instant::now();
        let env = self.env;
        let model = self.model;
        if options.check_access {
            env.access()
                .check_permission(env.uid(), model.name(), Operation::Write)?;
        }
        let records = if options.check_access {
            self.narrow_by_rule(Operation::Write)?
        } else {
            self.clone()
        };
        let ids = records.ids()?.to_vec();
        if ids.is_empty() {
            return Ok(());
        }
        if records.has_negative_ids()? {
            return records.write_in_memory(data, &ids);
        }

        let mut data = data;
        records.create_fk_relation_records(&mut data)?;
        let RecordData {
            mut values,
            to_create,
        } = data;
        let changed = changed_fields(&values, &to_create);
        if !model.is_system() && !options.force_compute {
            values.insert("write_date".to_string(), Value::Integer(now_millis()));
            values.insert("write_uid".to_string(), Value::Integer(env.uid()));
        }
        if !options.force_compute {
            records.process_inverse_methods(&values)?;
        }
        let values = records.coerce_values(values)?;
        let force_compute = options.force_compute || self.context.is_true("force_compute_write");
        let mut columns = records.column_values(&values, force_compute);
        columns.remove("id");

        let mut parents = records.reverse_parents(&columns)?;
        let stored = records.do_update(&columns, &ids)?;
        {
            let mut cache = env.cache_mut();
            for id in &ids {
                for (name, value) in &columns {
                    if !stored && BOOKKEEPING_FIELDS.contains(&name.as_str()) {
                        continue;
                    }
                    cache.update_entry(model, *id, name, value.clone(), "");
                }
            }
        }
        for (key, new_parents) in records.reverse_parents(&columns)? {
            parents.entry(key).or_default().extend(new_parents);
        }
        records.invalidate_reverse_parents(&parents)?;

        records.update_relation_fields(&values)?;
        records.update_related_fields(&values)?;
        records.write_contexted(&values)?;
        records.create_reverse_relation_records(to_create)?;
        records.process_triggers(&changed, false)?;
        records.process_reverse_triggers(&parents)?;
        records.check_constraints(&changed)?;

        info!(
            target: COLLECTION_TARGET,
            "event=record_write module=collection status=ok model={} records={} fields={} duration_ms={}",
            model.name(),
            ids.len(),
            changed.len(),
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    fn write_in_memory(&self, data: RecordData, ids: &[i64]) -> CoreResult<()> {
        if ids.iter().any(|id| *id > 0) {
            return Err(CoreError::invariant(format!(
                "cannot write stored and in-memory {} records together",
                self.model.name()
            )));
        }
        if !data.to_create.is_empty() {
            return Err(CoreError::invariant(
                "nested creation is not supported on in-memory records",
            ));
        }
        let values = self.coerce_values(data.values)?;
        let slug = self.slug();
        let mut cache = self.env.cache_mut();
        for id in ids {
            for (name, value) in &values {
                cache.update_entry(self.model, *id, name, value.clone(), &slug);
            }
        }
        Ok(())
    }

    /// Updates the model table; returns `false` when only bookkeeping
    /// columns changed and no statement was issued.
    fn do_update(&self, columns: &FieldMap, ids: &[i64]) -> CoreResult<bool> {
        let bookkeeping_only = columns
            .keys()
            .all(|name| BOOKKEEPING_FIELDS.contains(&name.as_str()));
        if columns.is_empty() || bookkeeping_only {
            return Ok(false);
        }
        let (sql, args) = update_query(self.model.table(), columns, ids);
        let affected = self
            .env
            .execute(&sql, &args)
            .map_err(|err| self.storage_error(err))?;
        if affected == 0 {
            return Err(CoreError::invariant(format!(
                "update of {} matched no rows",
                self.model.name()
            )));
        }
        Ok(true)
    }

    /// Stores contexted values for the current context.
    ///
    /// The default-context row is created too when it does not exist yet,
    /// so a first write in any context also seeds the default value.
    pub(crate) fn write_contexted(&self, values: &FieldMap) -> CoreResult<()> {
        let default_only = self.context.is_true("default_contexts");
        for (name, value) in values {
            let Some(field) = self.model.field(name) else {
                continue;
            };
            if !field.is_contexted() || field.is_related() {
                continue;
            }
            let keys = field.context_keys();
            let table = self.model.context_table(name);
            let key_values: Vec<Value> = keys
                .iter()
                .map(|key| match self.context.get(key) {
                    Some(current) if !current.is_null() && !default_only => {
                        Value::Text(current.to_string())
                    }
                    _ => Value::Null,
                })
                .collect();
            let defaults = vec![Value::Null; keys.len()];

            for id in self.positive_ids()? {
                self.upsert_context_row(&table, keys, &key_values, id, value)?;
                if key_values.iter().any(|key| !key.is_null())
                    && !self.context_row_exists(&table, keys, &defaults, id)?
                {
                    self.insert_context_row(&table, keys, &defaults, id, value)?;
                }
                let mut cache = self.env.cache_mut();
                cache.invalidate_field(self.model, id, name);
                cache.update_entry(self.model, id, name, value.clone(), &self.slug());
            }
        }
        Ok(())
    }

    fn context_match(keys: &[String], key_values: &[Value], id: i64) -> (String, Vec<Value>) {
        let mut clauses = vec![format!("{} = ?", quote("record_id"))];
        let mut args = vec![Value::Integer(id)];
        for (key, key_value) in keys.iter().zip(key_values) {
            clauses.push(format!("{} IS ?", quote(key)));
            args.push(key_value.clone());
        }
        (clauses.join(" AND "), args)
    }

    fn upsert_context_row(
        &self,
        table: &str,
        keys: &[String],
        key_values: &[Value],
        id: i64,
        value: &Value,
    ) -> CoreResult<()> {
        let (filter, filter_args) = Self::context_match(keys, key_values, id);
        let sql = format!("UPDATE {} SET {} = ? WHERE {filter}", quote(table), quote("value"));
        let mut args = vec![value.clone()];
        args.extend(filter_args);
        if self.env.execute(&sql, &args)? == 0 {
            self.insert_context_row(table, keys, key_values, id, value)?;
        }
        Ok(())
    }

    fn context_row_exists(
        &self,
        table: &str,
        keys: &[String],
        key_values: &[Value],
        id: i64,
    ) -> CoreResult<bool> {
        let (filter, args) = Self::context_match(keys, key_values, id);
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {filter}", quote(table));
        let count = self
            .env
            .get(&sql, &args)?
            .and_then(|count| count.as_i64())
            .unwrap_or_default();
        Ok(count > 0)
    }

    fn insert_context_row(
        &self,
        table: &str,
        keys: &[String],
        key_values: &[Value],
        id: i64,
        value: &Value,
    ) -> CoreResult<()> {
        let mut row = FieldMap::new();
        row.insert("record_id".to_string(), Value::Integer(id));
        for (key, key_value) in keys.iter().zip(key_values) {
            row.insert(key.clone(), key_value.clone());
        }
        row.insert("value".to_string(), value.clone());
        let (sql, args) = insert_query(table, &row);
        self.env.get(&sql, &args)?;
        Ok(())
    }

    /// Deletes every record and returns how many rows storage removed.
    ///
    /// Stored computed fields depending on the deleted records are
    /// recomputed afterwards.
    pub fn unlink(&self) -> CoreResult<usize> {
        let started_at = Instant::now();
        let env = self.env;
        let model = self.model;
        env.access()
            .check_permission(env.uid(), model.name(), Operation::Unlink)?;
        let records = self.narrow_by_rule(Operation::Unlink)?;
        let ids = records.ids()?.to_vec();
        if ids.is_empty() {
            return Ok(0);
        }
        let positive: Vec<i64> = ids.iter().copied().filter(|id| *id > 0).collect();
        let dependents = records.collect_dependents()?;

        let mut removed = 0;
        if !positive.is_empty() {
            let (sql, args) = delete_query(model.table(), &positive);
            removed = env
                .execute(&sql, &args)
                .map_err(|err| self.storage_error(err))?;
        }
        records.invalidate_after_unlink(&ids);
        records.recompute_dependents(dependents)?;

        info!(
            target: COLLECTION_TARGET,
            "event=record_unlink module=collection status=ok model={} records={} duration_ms={}",
            model.name(),
            removed,
            started_at.elapsed().as_millis()
        );
        Ok(removed)
    }

    /// Creates an in-memory record with a negative id.
    ///
    /// Nothing reaches storage; the record only lives in this environment's
    /// cache. Queued related records are created in memory as well.
    pub fn new_record(&self, data: RecordData) -> CoreResult<Self> {
        let model = self.model;
        let id = self.env.next_negative_id();
        let RecordData {
            values: given,
            to_create,
        } = data;

        let mut values = FieldMap::new();
        for (name, value) in self.default_get() {
            let skip = model
                .field(&name)
                .map_or(true, |field| field.is_computed() || field.is_related());
            if !skip && name != "id" {
                values.insert(name, value);
            }
        }
        values.extend(given);

        let mut reverse = Vec::new();
        for (name, queued) in to_create {
            let field = known_field(model, &name)?;
            let comodel = comodel_of(self.registry(), model, field)?;
            let target = self.related_pool(comodel);
            match field.field_type() {
                FieldType::One2Many { reverse_fk, .. } | FieldType::Rev2One { reverse_fk, .. } => {
                    reverse.push((name, target, reverse_fk.clone(), queued));
                }
                _ => {
                    let mut ids = values.get(&name).map(Value::to_ids).unwrap_or_default();
                    for child in queued {
                        ids.push(target.new_record(child)?.ensure_one()?);
                    }
                    values.insert(name, Value::Ids(ids));
                }
            }
        }

        let values: FieldMap = self
            .coerce_values(values)?
            .into_iter()
            .filter(|(name, _)| !name.contains('.'))
            .collect();
        let slug = self.slug();
        {
            let mut cache = self.env.cache_mut();
            cache.update_entry(model, id, "id", Value::Integer(id), &slug);
            for (name, value) in &values {
                cache.update_entry(model, id, name, value.clone(), &slug);
            }
        }

        for (name, target, reverse_fk, queued) in reverse {
            let mut children = Vec::with_capacity(queued.len());
            for child in queued {
                children.push(target.new_record(child.set(&reverse_fk, id))?.ensure_one()?);
            }
            self.env
                .cache_mut()
                .update_entry(model, id, &name, Value::Ids(children), &slug);
        }
        Ok(self.with_ids([id]))
    }

    /// Drops every cached value of these records and reloads the stored
    /// ones. In-memory records are dropped only.
    pub fn invalidate_cache(&self) -> CoreResult<()> {
        let ids = self.ids()?.to_vec();
        {
            let mut cache = self.env.cache_mut();
            for id in &ids {
                cache.invalidate_record(self.model, *id);
            }
        }
        let stored: Vec<i64> = ids.into_iter().filter(|id| *id > 0).collect();
        if !stored.is_empty() {
            self.with_ids(stored).load(&[])?;
        }
        Ok(())
    }

    /// Records of this collection allowed by the user's rule for `operation`.
    fn narrow_by_rule(&self, operation: Operation) -> CoreResult<Self> {
        let env = self.env;
        let Some(rule) = env.access().record_rule(env.uid(), self.model.name(), operation) else {
            return Ok(self.clone());
        };
        if self.has_negative_ids()? {
            return Ok(self.clone());
        }
        let ids = self.ids()?.to_vec();
        self.search(Condition::field("id").is_in(ids).and(rule)).fetch()
    }

    pub(crate) fn coerce_values(&self, values: FieldMap) -> CoreResult<FieldMap> {
        values
            .into_iter()
            .map(|(name, value)| {
                if name.contains('.') {
                    return Ok((name, value));
                }
                let field = known_field(self.model, &name)?;
                let value = field.field_type().coerce(value).map_err(|reason| {
                    CoreError::invariant(format!(
                        "invalid value for {}.{name}: {reason}",
                        self.model.name()
                    ))
                })?;
                Ok((name, value))
            })
            .collect()
    }

    /// Values stored in the model table's own columns.
    fn column_values(&self, values: &FieldMap, force_compute: bool) -> FieldMap {
        values
            .iter()
            .filter(|(name, _)| {
                self.model.field(name).is_some_and(|field| {
                    field.is_column() && (!field.is_computed() || force_compute)
                })
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Wraps a storage error, attaching the friendly message of the SQL
    /// constraint it names, translated into the context language.
    fn storage_error(&self, error: DbError) -> CoreError {
        let reported = error.to_string();
        let message = self
            .model
            .sql_constraints()
            .iter()
            .find(|constraint| reported.contains(&constraint.name))
            .map(|constraint| self.t(&constraint.message));
        CoreError::Storage { error, message }
    }
}

fn changed_fields(
    values: &FieldMap,
    to_create: &BTreeMap<String, Vec<RecordData>>,
) -> Vec<String> {
    let mut changed: Vec<String> = values.keys().cloned().collect();
    for name in to_create.keys() {
        if !changed.contains(name) {
            changed.push(name.clone());
        }
    }
    changed
}
