//! Record collections: handles on zero, one or many rows of one model.
//!
//! # Responsibility
//! - Narrow queries without mutating the receiver.
//! - Read field values through the environment cache, loading lazily.
//! - Host the write pipeline (`write`), loading (`load`) and grouped
//!   aggregates (`aggregate`).
//!
//! # Invariants
//! - Id lists are deduplicated, never contain `0`, and never change once
//!   fetched for a given collection value.
//! - A collection with an empty query never loads rows implicitly.
//! - Negative ids name in-memory records that only live in the cache.

mod aggregate;
mod load;
mod write;

pub use aggregate::GroupAggregateRow;
pub(crate) use write::WriteOptions;

use crate::cache::context_slug;
use crate::data::ModelData;
use crate::env::{Context, Environment};
use crate::error::{CoreError, CoreResult};
use crate::i18n::format_placeholders;
use crate::query::{Condition, OrderPredicate, Query};
use crate::registry::model::Model;
use crate::registry::Registry;
use crate::resolver::{apply_contexts, comodel_of, known_field, resolve_field, substitute_related};
use crate::value::{FieldMap, Value};
use once_cell::unsync::OnceCell;
use std::collections::HashSet;
use std::fmt::{Debug, Display, Formatter};
use std::rc::Rc;

/// Deduplicated id list of a fetched collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct IdSet {
    pub(crate) ids: Vec<i64>,
    pub(crate) has_negative: bool,
}

impl IdSet {
    pub(crate) fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        let mut seen = HashSet::new();
        let ids: Vec<i64> = ids
            .into_iter()
            .filter(|id| *id != 0 && seen.insert(*id))
            .collect();
        let has_negative = ids.iter().any(|id| *id < 0);
        Self { ids, has_negative }
    }
}

/// Handle on records of one model, bound to one environment.
#[derive(Clone)]
pub struct RecordCollection<'e> {
    pub(crate) env: &'e Environment<'e>,
    pub(crate) model: &'e Model,
    pub(crate) query: Query,
    pub(crate) ids: OnceCell<IdSet>,
    /// Sibling ids batch-loaded together with this record.
    pub(crate) prefetch: Option<Rc<[i64]>>,
    pub(crate) context: Rc<Context>,
}

impl<'e> RecordCollection<'e> {
    pub(crate) fn new(env: &'e Environment<'e>, model: &'e Model) -> Self {
        let context = env.context().clone();
        let mut query = Query::new();
        apply_contexts(&mut query, model, &context);
        Self {
            env,
            model,
            query,
            ids: OnceCell::new(),
            prefetch: None,
            context: Rc::new(context),
        }
    }

    fn with_query(&self, query: Query) -> Self {
        Self {
            env: self.env,
            model: self.model,
            query,
            ids: OnceCell::new(),
            prefetch: None,
            context: Rc::clone(&self.context),
        }
    }

    /// Fetched collection of the same model holding `ids`.
    pub fn with_ids<I>(&self, ids: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        let set = IdSet::from_ids(ids);
        let mut query = self.query.clone();
        query.restrict_to_ids(&set.ids);
        query.orders.clear();
        query.groups.clear();
        let collection = self.with_query(query);
        let _ = collection.ids.set(set);
        collection
    }

    /// Empty, unfetched collection of `comodel` sharing this context.
    pub(crate) fn related_pool(&self, comodel: &'e Model) -> Self {
        let mut query = Query::new();
        apply_contexts(&mut query, comodel, &self.context);
        Self {
            env: self.env,
            model: comodel,
            query,
            ids: OnceCell::new(),
            prefetch: None,
            context: Rc::clone(&self.context),
        }
    }

    /// Fetched collection of `comodel` sharing this collection's context.
    pub(crate) fn related_collection<I>(&self, comodel: &'e Model, ids: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        self.related_pool(comodel).with_ids(ids)
    }

    pub fn env(&self) -> &'e Environment<'e> {
        self.env
    }

    pub fn model(&self) -> &'e Model {
        self.model
    }

    pub fn model_name(&self) -> &'e str {
        self.model.name()
    }

    pub(crate) fn registry(&self) -> &'e Registry {
        self.env.registry()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The filter condition accumulated so far.
    pub fn condition(&self) -> &Condition {
        &self.query.cond
    }

    /// Cache slug of the current context for this model.
    pub(crate) fn slug(&self) -> String {
        context_slug(self.model.context_keys(), &self.context)
    }

    pub fn is_fetched(&self) -> bool {
        self.ids.get().is_some()
    }

    /// Record ids, fetching them first if needed.
    pub fn ids(&self) -> CoreResult<&[i64]> {
        let set = self.ids.get_or_try_init(|| self.fetch_ids())?;
        Ok(&set.ids)
    }

    fn fetch_ids(&self) -> CoreResult<IdSet> {
        if self.query.is_empty() {
            return Ok(IdSet::default());
        }
        let ids = self.fetch_direct(&["id".to_string()], None)?;
        Ok(IdSet::from_ids(ids))
    }

    pub(crate) fn positive_ids(&self) -> CoreResult<Vec<i64>> {
        Ok(self.ids()?.iter().copied().filter(|id| *id > 0).collect())
    }

    pub fn has_negative_ids(&self) -> CoreResult<bool> {
        self.ids()?;
        Ok(self.ids.get().is_some_and(|set| set.has_negative))
    }

    pub fn len(&self) -> CoreResult<usize> {
        Ok(self.ids()?.len())
    }

    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.ids()?.is_empty())
    }

    /// Fetches the ids of a non-empty query.
    pub fn fetch(&self) -> CoreResult<Self> {
        self.ids()?;
        Ok(self.clone())
    }

    pub fn search(&self, cond: Condition) -> Self {
        let mut query = self.query.clone();
        query.cond = query.cond.and(cond);
        self.with_query(query)
    }

    /// Explicitly selects every row of the model.
    pub fn search_all(&self) -> Self {
        let mut query = self.query.clone();
        query.fetch_all = true;
        self.with_query(query)
    }

    pub fn limit(&self, limit: usize) -> Self {
        let mut query = self.query.clone();
        query.limit = Some(limit);
        self.with_query(query)
    }

    pub fn offset(&self, offset: usize) -> Self {
        let mut query = self.query.clone();
        query.offset = offset;
        self.with_query(query)
    }

    /// Replaces the ordering, e.g. `["amount desc", "partner_id.name"]`.
    pub fn order_by(&self, exprs: &[&str]) -> CoreResult<Self> {
        let mut orders = Vec::with_capacity(exprs.len());
        for expr in exprs {
            let order = OrderPredicate::parse(expr).ok_or_else(|| {
                CoreError::invariant(format!(
                    "invalid order expression `{expr}` for {}",
                    self.model.name()
                ))
            })?;
            orders.push(order);
        }
        let mut query = self.query.clone();
        query.orders = orders;
        Ok(self.with_query(query))
    }

    pub fn group_by(&self, fields: &[&str]) -> Self {
        let mut query = self.query.clone();
        query.groups = fields.iter().map(|field| field.to_string()).collect();
        self.with_query(query)
    }

    /// Copy of this collection with `key` overridden in its context.
    pub fn with_context(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut context = (*self.context).clone();
        context.set(key, value);
        let mut query = self.query.clone();
        apply_contexts(&mut query, self.model, &context);
        Self {
            env: self.env,
            model: self.model,
            query,
            ids: self.ids.clone(),
            prefetch: self.prefetch.clone(),
            context: Rc::new(context),
        }
    }

    /// Value of `field` on the first record.
    ///
    /// Empty collections yield the field's zero value; non-stored computed
    /// fields are evaluated live; related fields and dotted paths are read
    /// through the records they point to.
    pub fn get(&self, field: &str) -> CoreResult<Value> {
        let descriptor = known_field(self.model, field.split('.').next().unwrap_or(field))?;
        if field.contains('.') || descriptor.is_related() {
            let path = substitute_related(self.registry(), self.model, field)?;
            return self.get_path(&path);
        }

        let Some(id) = self.ids()?.first().copied() else {
            return Ok(descriptor.zero_value());
        };
        if let (Some(compute), false) = (descriptor.compute.as_ref(), descriptor.is_column()) {
            return compute(&self.with_ids([id]));
        }
        if let Some(value) = self.cached(id, field) {
            return Ok(value);
        }
        if id < 0 {
            return Ok(descriptor.zero_value());
        }
        if descriptor.field_type().is_non_stored_relation() {
            self.load(&[field])?;
        } else {
            self.load(&[])?;
        }
        Ok(self
            .cached(id, field)
            .unwrap_or_else(|| descriptor.zero_value()))
    }

    fn get_path(&self, path: &str) -> CoreResult<Value> {
        let Some((head, rest)) = path.split_once('.') else {
            return self.get(path);
        };
        let (_, leaf) = resolve_field(self.registry(), self.model, path)?;
        let field = known_field(self.model, head)?;
        let comodel = comodel_of(self.registry(), self.model, field)?;
        let Some(target) = self.get(head)?.to_ids().first().copied() else {
            return Ok(leaf.zero_value());
        };
        self.related_collection(comodel, [target]).get(rest)
    }

    pub(crate) fn cached(&self, id: i64, field: &str) -> Option<Value> {
        self.env.cache().get(self.model, id, field, &self.slug())
    }

    /// Writes `value` into `field` of every record.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> CoreResult<()> {
        self.write(crate::data::RecordData::new().set(field, value))
    }

    /// All fields of the first record; empty data for an empty collection.
    pub fn first(&self) -> CoreResult<ModelData> {
        let Some(id) = self.ids()?.first().copied() else {
            return Ok(ModelData {
                model: self.model.name().to_string(),
                values: FieldMap::new(),
            });
        };
        self.load_for_data()?;
        self.with_ids([id]).record_data()
    }

    /// All fields of every record, in collection order.
    pub fn all(&self) -> CoreResult<Vec<ModelData>> {
        self.load_for_data()?;
        self.records()?
            .iter()
            .map(RecordCollection::record_data)
            .collect()
    }

    fn load_for_data(&self) -> CoreResult<()> {
        let names = self.model.field_names();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.load(&names)?;
        Ok(())
    }

    fn record_data(&self) -> CoreResult<ModelData> {
        let mut values = FieldMap::new();
        for field in self.model.fields() {
            values.insert(field.name().to_string(), self.get(field.name())?);
        }
        Ok(ModelData {
            model: self.model.name().to_string(),
            values,
        })
    }

    /// One singleton per record; each remembers its siblings for batch loads.
    pub fn records(&self) -> CoreResult<Vec<Self>> {
        let ids = self.ids()?;
        let siblings: Rc<[i64]> = Rc::from(ids);
        Ok(ids
            .iter()
            .map(|id| {
                let mut record = self.with_ids([*id]);
                record.prefetch = Some(Rc::clone(&siblings));
                record
            })
            .collect())
    }

    /// Returns the id of the only record, failing on any other count.
    pub fn ensure_one(&self) -> CoreResult<i64> {
        match self.ids()? {
            [id] => Ok(*id),
            ids => Err(CoreError::NotFound(format!(
                "expected a single {} record, got {}",
                self.model.name(),
                ids.len()
            ))),
        }
    }

    fn check_same_model(&self, other: &Self) -> CoreResult<()> {
        if self.model.name() != other.model.name() {
            return Err(CoreError::invariant(format!(
                "cannot combine {} and {} records",
                self.model.name(),
                other.model.name()
            )));
        }
        Ok(())
    }

    /// Records of both collections, first-seen order.
    pub fn union(&self, other: &Self) -> CoreResult<Self> {
        self.check_same_model(other)?;
        let ids: Vec<i64> = self.ids()?.iter().chain(other.ids()?).copied().collect();
        Ok(self.with_ids(ids))
    }

    pub fn subtract(&self, other: &Self) -> CoreResult<Self> {
        self.check_same_model(other)?;
        let removed: HashSet<i64> = other.ids()?.iter().copied().collect();
        let ids: Vec<i64> = self
            .ids()?
            .iter()
            .copied()
            .filter(|id| !removed.contains(id))
            .collect();
        Ok(self.with_ids(ids))
    }

    pub fn intersect(&self, other: &Self) -> CoreResult<Self> {
        self.check_same_model(other)?;
        let kept: HashSet<i64> = other.ids()?.iter().copied().collect();
        let ids: Vec<i64> = self
            .ids()?
            .iter()
            .copied()
            .filter(|id| kept.contains(id))
            .collect();
        Ok(self.with_ids(ids))
    }

    /// Runs the method chain `method` on these records.
    pub fn call(&self, method: &str, args: &[Value]) -> CoreResult<Value> {
        let chain = self.model.method(method).ok_or_else(|| {
            CoreError::invariant(format!(
                "model {} has no method `{method}`",
                self.model.name()
            ))
        })?;
        chain.invoke(self, args)
    }

    /// Translates `source` into the context language.
    pub fn t(&self, source: &str) -> String {
        let translated = match (self.env.translator(), self.context.lang()) {
            (Some(translator), Some(lang)) => translator.translate(lang, "", source),
            _ => None,
        };
        translated.unwrap_or_else(|| source.to_string())
    }

    /// Translates `source` and fills its `{}` placeholders with `args`.
    pub fn t_args<T: Display>(&self, source: &str, args: &[T]) -> String {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        format_placeholders(&self.t(source), &args)
    }

    /// The record whose `external_id` is `external_id`.
    pub fn get_record(&self, external_id: &str) -> CoreResult<Self> {
        let records = self
            .search(Condition::field("external_id").equals(external_id))
            .fetch()?;
        if records.is_empty()? {
            return Err(CoreError::NotFound(format!(
                "no {} record with external id `{external_id}`",
                self.model.name()
            )));
        }
        Ok(records)
    }

    /// Default values of every field that has one.
    ///
    /// A context entry `default_<field>` overrides the field's own default.
    pub fn default_get(&self) -> FieldMap {
        let mut defaults = FieldMap::new();
        for field in self.model.fields() {
            let key = format!("default_{}", field.name());
            if let Some(value) = self.context.get(&key) {
                defaults.insert(field.name().to_string(), value.clone());
            } else if let Some(default) = field.default.as_ref() {
                defaults.insert(field.name().to_string(), default(self.env));
            }
        }
        defaults
    }
}

impl Debug for RecordCollection<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCollection")
            .field("model", &self.model.name())
            .field("ids", &self.ids.get().map(|set| &set.ids))
            .field("query", &self.query)
            .finish()
    }
}
