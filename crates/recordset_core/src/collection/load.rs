//! Loading rows from storage into the environment cache.

use super::{IdSet, RecordCollection};
use crate::error::{CoreError, CoreResult};
use crate::logging::COLLECTION_TARGET;
use crate::query::sql::{count_query, quote, SelectQuery, SqlCondition};
use crate::query::{Condition, Operator};
use crate::registry::field::FieldType;
use crate::resolver::{
    comodel_of, compile_condition, context_filter_for, known_field, order_expression,
    substitute_related,
};
use crate::security::Operation;
use crate::value::{FieldMap, Value};
use log::debug;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

/// Fields of one load request, split by how they are fetched.
#[derive(Debug, Default)]
struct LoadPlan {
    /// Local fields: columns, contexted values, non-stored relations.
    direct: Vec<String>,
    /// Dotted paths through relations.
    paths: Vec<String>,
}

impl LoadPlan {
    fn new(collection: &RecordCollection<'_>, fields: &[&str]) -> CoreResult<Self> {
        let model = collection.model;
        let mut plan = Self {
            direct: vec!["id".to_string()],
            paths: Vec::new(),
        };
        if fields.is_empty() {
            for name in model.stored_field_names() {
                plan.push_direct(name);
            }
            return Ok(plan);
        }
        for name in fields {
            let head = name.split('.').next().unwrap_or(name);
            let field = known_field(model, head)?;
            if name.contains('.') || field.is_related() {
                let path = substitute_related(collection.registry(), model, name)?;
                if path.contains('.') {
                    plan.paths.push(path);
                } else {
                    plan.push_direct(path);
                }
                continue;
            }
            if field.is_computed() && !field.is_column() {
                continue;
            }
            if field.is_stored() || field.field_type().is_non_stored_relation() {
                plan.push_direct(field.name().to_string());
            }
        }
        Ok(plan)
    }

    fn push_direct(&mut self, name: String) {
        if !self.direct.contains(&name) {
            self.direct.push(name);
        }
    }
}

impl<'e> RecordCollection<'e> {
    /// Makes `fields` available in the cache, querying only what is missing.
    ///
    /// An empty field list loads every stored field. Unfetched collections
    /// are fetched first; records of a prefetch group load together.
    pub fn load(&self, fields: &[&str]) -> CoreResult<Self> {
        if !self.is_fetched() {
            return self.force_load(fields);
        }
        let plan = LoadPlan::new(self, fields)?;
        let positive = self.positive_ids()?;
        let missing = self.missing_ids(&positive, &plan.direct);
        if !missing.is_empty() {
            let mut target = missing;
            if let Some(siblings) = self.prefetch.as_deref() {
                let siblings: Vec<i64> = siblings.iter().copied().filter(|id| *id > 0).collect();
                for id in self.missing_ids(&siblings, &plan.direct) {
                    if !target.contains(&id) {
                        target.push(id);
                    }
                }
            }
            self.fetch_direct(&plan.direct, Some(&target))?;
        }
        self.load_paths(&plan.paths)?;
        Ok(self.clone())
    }

    /// Reloads `fields` from storage regardless of the cache.
    pub fn force_load(&self, fields: &[&str]) -> CoreResult<Self> {
        let plan = LoadPlan::new(self, fields)?;
        if self.is_fetched() {
            if self.has_negative_ids()? {
                return Err(CoreError::invariant(format!(
                    "cannot load in-memory {} records from storage",
                    self.model.name()
                )));
            }
            let ids = self.positive_ids()?;
            if !ids.is_empty() {
                self.fetch_direct(&plan.direct, Some(&ids))?;
            }
        } else {
            let ids = if self.query.is_empty() {
                Vec::new()
            } else {
                self.fetch_direct(&plan.direct, None)?
            };
            let _ = self.ids.set(IdSet::from_ids(ids));
        }
        self.load_paths(&plan.paths)?;
        Ok(self.clone())
    }

    fn missing_ids(&self, ids: &[i64], fields: &[String]) -> Vec<i64> {
        let slug = self.slug();
        let cache = self.env.cache();
        ids.iter()
            .copied()
            .filter(|id| !cache.check_if_in_cache(self.model, &[*id], fields, &slug, true))
            .collect()
    }

    /// Runs the SELECT for `fields` and stores the rows in the cache.
    ///
    /// With `restrict`, rows are selected by id; otherwise the collection
    /// query applies with its ordering and pagination. Returns the ids in
    /// row order.
    pub(crate) fn fetch_direct(
        &self,
        fields: &[String],
        restrict: Option<&[i64]>,
    ) -> CoreResult<Vec<i64>> {
        let started_at = Instant::now();
        let env = self.env;
        let model = self.model;
        env.access()
            .check_permission(env.uid(), model.name(), Operation::Read)?;
        if restrict.is_some_and(|ids| ids.iter().any(|id| *id < 0)) {
            return Err(CoreError::invariant(format!(
                "cannot query in-memory {} records",
                model.name()
            )));
        }

        let mut cond = match restrict {
            Some(ids) => Condition::field("id").is_in(ids.to_vec()),
            None => self.query.cond.clone(),
        };
        if let Some(rule) = env.access().record_rule(env.uid(), model.name(), Operation::Read) {
            cond = cond.and(rule);
        }
        let filter = compile_condition(self.registry(), model, &cond, &self.context)?;

        let mut columns = vec![quote("id")];
        for name in fields {
            if name != "id" && model.field(name).is_some_and(|field| field.is_column()) {
                columns.push(quote(name));
            }
        }
        let mut select = SelectQuery::new(model.table(), columns, filter);
        if restrict.is_none() {
            let orders = if self.query.orders.is_empty() {
                model.default_order()
            } else {
                self.query.orders.as_slice()
            };
            for order in orders {
                select
                    .orders
                    .push(order_expression(self.registry(), model, order)?);
            }
            select.limit = self.query.limit;
            select.offset = self.query.offset;
        }
        let (sql, args) = select.to_sql();
        let rows = env.query(&sql, &args)?;

        let slug = self.slug();
        let mut ids = Vec::with_capacity(rows.len());
        {
            let mut cache = env.cache_mut();
            for row in rows {
                let Some(id) = row.get("id").and_then(Value::as_i64) else {
                    continue;
                };
                let decoded: FieldMap = row
                    .into_iter()
                    .filter_map(|(name, raw)| {
                        let field = model.field(&name)?;
                        Some((name, field.field_type().decode(raw)))
                    })
                    .collect();
                cache.add_record(model, id, &decoded, &slug);
                ids.push(id);
            }
        }

        for name in fields {
            let Some(field) = model.field(name) else {
                continue;
            };
            if field.is_contexted() && !field.is_related() {
                self.load_contexted(name, &ids)?;
            } else if field.field_type().is_non_stored_relation() {
                self.load_relation(name, &ids)?;
            }
        }

        debug!(
            target: COLLECTION_TARGET,
            "event=records_load module=collection status=ok model={} rows={} fields={} duration_ms={}",
            model.name(),
            ids.len(),
            fields.len(),
            started_at.elapsed().as_millis()
        );
        Ok(ids)
    }

    /// Loads the values of a contexted field for the current context.
    ///
    /// Rows are ordered so that the most specific context comes last and
    /// wins; records without any row get `Null`.
    fn load_contexted(&self, name: &str, ids: &[i64]) -> CoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let model = self.model;
        let field = known_field(model, name)?;
        let (ctx_filter, ctx_orders) = context_filter_for(&self.query, name);
        let filter = SqlCondition::Compare {
            column: "record_id".to_string(),
            operator: Operator::In,
            value: Value::Ids(ids.to_vec()),
        }
        .and(ctx_filter);
        let table = model.context_table(name);
        let mut select = SelectQuery::new(&table, vec![quote("record_id"), quote("value")], filter);
        select.orders.push(format!("{} ASC", quote("record_id")));
        select.orders.extend(ctx_orders);
        let (sql, args) = select.to_sql();
        let rows = self.env.query(&sql, &args)?;

        let mut values: BTreeMap<i64, Value> = BTreeMap::new();
        for row in rows {
            let Some(id) = row.get("record_id").and_then(Value::as_i64) else {
                continue;
            };
            let raw = row.get("value").cloned().unwrap_or(Value::Null);
            values.insert(id, field.field_type().decode(raw));
        }
        let slug = self.slug();
        let mut cache = self.env.cache_mut();
        for id in ids {
            let value = values.remove(id).unwrap_or(Value::Null);
            cache.update_entry(model, *id, name, value, &slug);
        }
        Ok(())
    }

    /// Loads a one-to-many, reverse-one or many-to-many field.
    fn load_relation(&self, name: &str, ids: &[i64]) -> CoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let model = self.model;
        let field = known_field(model, name)?;
        match field.field_type() {
            FieldType::One2Many { reverse_fk, .. } | FieldType::Rev2One { reverse_fk, .. } => {
                let comodel = comodel_of(self.registry(), model, field)?;
                let filter = SqlCondition::Compare {
                    column: reverse_fk.clone(),
                    operator: Operator::In,
                    value: Value::Ids(ids.to_vec()),
                };
                let mut select = SelectQuery::new(
                    comodel.table(),
                    vec![quote("id"), quote(reverse_fk)],
                    filter,
                );
                for order in comodel.default_order() {
                    select
                        .orders
                        .push(order_expression(self.registry(), comodel, order)?);
                }
                let (sql, args) = select.to_sql();
                let rows = self.env.query(&sql, &args)?;

                let mut children: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
                for row in rows {
                    let parent = row.get(reverse_fk.as_str()).and_then(Value::as_i64);
                    let child = row.get("id").and_then(Value::as_i64);
                    if let (Some(parent), Some(child)) = (parent, child) {
                        children.entry(parent).or_default().push(child);
                    }
                }
                let reverse_one = matches!(field.field_type(), FieldType::Rev2One { .. });
                let mut cache = self.env.cache_mut();
                for id in ids {
                    let linked = children.remove(id).unwrap_or_default();
                    let value = if reverse_one {
                        linked.first().map_or(Value::Null, |child| Value::Integer(*child))
                    } else {
                        Value::Ids(linked)
                    };
                    cache.update_entry(model, *id, name, value, "");
                }
            }
            FieldType::Many2Many { .. } => {
                let link = field.link_table().ok_or_else(|| {
                    CoreError::invariant(format!("{name} on {} has no link table", model.name()))
                })?;
                let filter = SqlCondition::Compare {
                    column: link.our_column.clone(),
                    operator: Operator::In,
                    value: Value::Ids(ids.to_vec()),
                };
                let select = SelectQuery::new(
                    &link.table,
                    vec![quote(&link.our_column), quote(&link.their_column)],
                    filter,
                );
                let (sql, args) = select.to_sql();
                let rows = self.env.query(&sql, &args)?;

                let mut linked: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
                for row in rows {
                    let ours = row.get(link.our_column.as_str()).and_then(Value::as_i64);
                    let theirs = row.get(link.their_column.as_str()).and_then(Value::as_i64);
                    if let (Some(ours), Some(theirs)) = (ours, theirs) {
                        linked.entry(ours).or_default().push(theirs);
                    }
                }
                let mut cache = self.env.cache_mut();
                for id in ids {
                    cache.remove_m2m_links(link, *id);
                    cache.add_m2m_link(link, *id, &linked.remove(id).unwrap_or_default());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Loads dotted paths: the first hop locally, the rest on the targets.
    fn load_paths(&self, paths: &[String]) -> CoreResult<()> {
        for path in paths {
            let Some((head, rest)) = path.split_once('.') else {
                continue;
            };
            self.load(&[head])?;
            let field = known_field(self.model, head)?;
            let comodel = comodel_of(self.registry(), self.model, field)?;
            let mut seen = HashSet::new();
            let mut targets = Vec::new();
            for id in self.ids()? {
                if let Some(value) = self.cached(*id, head) {
                    targets.extend(value.to_ids().into_iter().filter(|target| seen.insert(*target)));
                }
            }
            if targets.is_empty() {
                continue;
            }
            self.related_collection(comodel, targets).load(&[rest])?;
        }
        Ok(())
    }

    /// Number of rows matching the query, ignoring pagination.
    pub fn search_count(&self) -> CoreResult<usize> {
        let env = self.env;
        let model = self.model;
        env.access()
            .check_permission(env.uid(), model.name(), Operation::Read)?;
        if self.query.is_empty() {
            return Ok(0);
        }
        let mut cond = self.query.cond.clone();
        if let Some(rule) = env.access().record_rule(env.uid(), model.name(), Operation::Read) {
            cond = cond.and(rule);
        }
        let filter = compile_condition(self.registry(), model, &cond, &self.context)?;
        let (sql, args) = count_query(model.table(), &filter);
        let count = env
            .get(&sql, &args)?
            .and_then(|value| value.as_i64())
            .unwrap_or_default();
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
