//! Relation maintenance for the write pipelines.
//!
//! # Responsibility
//! - Create records queued in `RecordData::to_create` and link them.
//! - Synchronize one-to-many and many-to-many fields by diffing the stored
//!   links against the requested ones.
//! - Write related fields through the records they point to.
//! - Keep inverse relation caches coherent after foreign keys move.
//!
//! # Invariants
//! - Only the links that actually change are touched in storage.
//! - In-memory records are never linked from stored ones.

use crate::collection::RecordCollection;
use crate::data::RecordData;
use crate::error::{CoreError, CoreResult};
use crate::logging::RELATION_TARGET;
use crate::query::sql::quote;
use crate::registry::field::{Field, FieldType};
use crate::registry::model::Model;
use crate::resolver::{comodel_of, known_field, substitute_related};
use crate::value::{FieldMap, Value};
use log::warn;
use std::collections::{BTreeMap, BTreeSet};

/// One-to-many (or reverse-one) field mirroring a moved foreign key, with
/// the parent records whose list changed.
pub(crate) type ReverseParents = BTreeMap<(String, String), BTreeSet<i64>>;

impl<'e> RecordCollection<'e> {
    /// Creates the many-to-one and many-to-many records queued in `data`
    /// and stores their ids in `data.values`.
    pub(crate) fn create_fk_relation_records(&self, data: &mut RecordData) -> CoreResult<()> {
        let names: Vec<String> = data.to_create.keys().cloned().collect();
        for name in names {
            let field = known_field(self.model, &name)?;
            let to_many = match field.field_type() {
                FieldType::Many2One { .. } => false,
                FieldType::Many2Many { .. } => true,
                _ => continue,
            };
            let comodel = comodel_of(self.registry(), self.model, field)?;
            let queued = data.to_create.remove(&name).unwrap_or_default();
            let target = self.related_pool(comodel);
            let mut created = Vec::with_capacity(queued.len());
            for child in queued {
                created.extend_from_slice(target.create(child)?.ids()?);
            }
            let value = if to_many {
                let mut ids = data.values.get(&name).map(Value::to_ids).unwrap_or_default();
                ids.extend(created);
                Value::Ids(ids)
            } else {
                created
                    .first()
                    .map_or(Value::Null, |id| Value::Integer(*id))
            };
            data.values.insert(name, value);
        }
        Ok(())
    }

    /// Creates the one-to-many and reverse-one records queued for every
    /// record of this collection.
    pub(crate) fn create_reverse_relation_records(
        &self,
        to_create: BTreeMap<String, Vec<RecordData>>,
    ) -> CoreResult<()> {
        for (name, queued) in to_create {
            let field = known_field(self.model, &name)?;
            let reverse_fk = match field.field_type() {
                FieldType::One2Many { reverse_fk, .. } | FieldType::Rev2One { reverse_fk, .. } => {
                    reverse_fk.clone()
                }
                _ => {
                    return Err(CoreError::invariant(format!(
                        "cannot create records through `{name}` on {}",
                        self.model.name()
                    )))
                }
            };
            let comodel = comodel_of(self.registry(), self.model, field)?;
            let target = self.related_pool(comodel);
            for id in self.positive_ids()? {
                for child in &queued {
                    target.create(child.clone().set(&reverse_fk, id))?;
                }
                self.env.cache_mut().invalidate_field(self.model, id, &name);
            }
        }
        Ok(())
    }

    /// Applies one-to-many, reverse-one and many-to-many values.
    pub(crate) fn update_relation_fields(&self, values: &FieldMap) -> CoreResult<()> {
        for (name, value) in values {
            let Some(field) = self.model.field(name) else {
                continue;
            };
            match field.field_type() {
                FieldType::One2Many { .. } => self.sync_one2many(field, &value.to_ids())?,
                FieldType::Rev2One { .. } => self.sync_one2many(field, &value.to_ids())?,
                FieldType::Many2Many { .. } => self.sync_many2many(field, &value.to_ids())?,
                _ => {}
            }
        }
        Ok(())
    }

    fn sync_one2many(&self, field: &Field, targets: &[i64]) -> CoreResult<()> {
        let (FieldType::One2Many { reverse_fk, .. } | FieldType::Rev2One { reverse_fk, .. }) =
            field.field_type()
        else {
            return Ok(());
        };
        if targets.iter().any(|id| *id < 0) {
            return Err(CoreError::invariant(format!(
                "cannot link in-memory records through `{}`",
                field.name()
            )));
        }
        let comodel = comodel_of(self.registry(), self.model, field)?;
        let parents = self.positive_ids()?;
        if parents.len() > 1 && !targets.is_empty() {
            warn!(
                target: RELATION_TARGET,
                "event=relation_sync module=relation status=warn model={} field={} parents={} detail=last_parent_wins",
                self.model.name(),
                field.name(),
                parents.len()
            );
        }
        let wanted: BTreeSet<i64> = targets.iter().copied().collect();
        for parent in parents {
            let sql = format!(
                "SELECT \"id\" FROM {} WHERE {} = ?",
                quote(comodel.table()),
                quote(reverse_fk)
            );
            let current: BTreeSet<i64> = self
                .env
                .select(&sql, &[Value::Integer(parent)])?
                .iter()
                .filter_map(Value::as_i64)
                .collect();
            let removed: Vec<i64> = current.difference(&wanted).copied().collect();
            let added: Vec<i64> = wanted.difference(&current).copied().collect();
            self.move_children(comodel, reverse_fk, removed, Value::Null)?;
            self.move_children(comodel, reverse_fk, added, Value::Integer(parent))?;
            self.env
                .cache_mut()
                .invalidate_field_everywhere(self.model, field.name());
        }
        Ok(())
    }

    /// Points `children` at `parent` through their own write pipeline, so
    /// the lists they leave and join are recomputed.
    fn move_children(
        &self,
        comodel: &'e Model,
        reverse_fk: &str,
        children: Vec<i64>,
        parent: Value,
    ) -> CoreResult<()> {
        if children.is_empty() {
            return Ok(());
        }
        self.related_collection(comodel, children)
            .write(RecordData::new().set(reverse_fk, parent))
    }

    fn sync_many2many(&self, field: &Field, targets: &[i64]) -> CoreResult<()> {
        let link = field.link_table().ok_or_else(|| {
            CoreError::invariant(format!(
                "`{}` on {} has no link table",
                field.name(),
                self.model.name()
            ))
        })?;
        if targets.iter().any(|id| *id < 0) {
            return Err(CoreError::invariant(format!(
                "cannot link in-memory records through `{}`",
                field.name()
            )));
        }
        let wanted: BTreeSet<i64> = targets.iter().copied().collect();
        for id in self.positive_ids()? {
            let sql = format!(
                "SELECT {} FROM {} WHERE {} = ?",
                quote(&link.their_column),
                quote(&link.table),
                quote(&link.our_column)
            );
            let current: BTreeSet<i64> = self
                .env
                .select(&sql, &[Value::Integer(id)])?
                .iter()
                .filter_map(Value::as_i64)
                .collect();
            let removed: Vec<i64> = current.difference(&wanted).copied().collect();
            let added: Vec<i64> = wanted.difference(&current).copied().collect();

            if !removed.is_empty() {
                let placeholders = vec!["?"; removed.len()].join(", ");
                let sql = format!(
                    "DELETE FROM {} WHERE {} = ? AND {} IN ({placeholders})",
                    quote(&link.table),
                    quote(&link.our_column),
                    quote(&link.their_column)
                );
                let mut args = vec![Value::Integer(id)];
                args.extend(removed.iter().map(|other| Value::Integer(*other)));
                self.env.execute(&sql, &args)?;
            }
            if !added.is_empty() {
                let rows = vec!["(?, ?)"; added.len()].join(", ");
                let sql = format!(
                    "INSERT INTO {} ({}, {}) VALUES {rows}",
                    quote(&link.table),
                    quote(&link.our_column),
                    quote(&link.their_column)
                );
                let args: Vec<Value> = added
                    .iter()
                    .flat_map(|other| [Value::Integer(id), Value::Integer(*other)])
                    .collect();
                self.env.execute(&sql, &args)?;
            }

            let linked: Vec<i64> = wanted.iter().copied().collect();
            let mut cache = self.env.cache_mut();
            cache.remove_m2m_links(link, id);
            cache.add_m2m_link(link, id, &linked);
        }
        Ok(())
    }

    /// Writes related fields and dotted paths through the records they
    /// point to, creating a missing many-to-one or reverse-one target.
    pub(crate) fn update_related_fields(&self, values: &FieldMap) -> CoreResult<()> {
        for (name, value) in values {
            let head = name.split('.').next().unwrap_or(name);
            let Some(field) = self.model.field(head) else {
                continue;
            };
            if !name.contains('.') && !field.is_related() {
                continue;
            }
            let path = substitute_related(self.registry(), self.model, name)?;
            let Some((head, rest)) = path.split_once('.') else {
                continue;
            };
            let field = known_field(self.model, head)?;
            if !matches!(
                field.field_type(),
                FieldType::Many2One { .. } | FieldType::Rev2One { .. }
            ) {
                return Err(CoreError::invariant(format!(
                    "cannot write `{name}` on {}: `{head}` is not a to-one relation",
                    self.model.name()
                )));
            }
            let comodel = comodel_of(self.registry(), self.model, field)?;
            for record in self.records()? {
                match record.get(head)?.to_ids().first().copied() {
                    Some(target) => record
                        .related_collection(comodel, [target])
                        .write(RecordData::new().set(rest, value.clone()))?,
                    None => record.create_related_target(field, rest, value.clone())?,
                }
            }
        }
        Ok(())
    }

    fn create_related_target(&self, field: &Field, rest: &str, value: Value) -> CoreResult<()> {
        let comodel = comodel_of(self.registry(), self.model, field)?;
        let target = self.related_pool(comodel);
        match field.field_type() {
            FieldType::Rev2One { reverse_fk, .. } => {
                let id = self.ensure_one()?;
                target.create(RecordData::new().set(rest, value).set(reverse_fk, id))?;
                self.env
                    .cache_mut()
                    .invalidate_field(self.model, id, field.name());
            }
            _ => {
                let created = target.create(RecordData::new().set(rest, value))?;
                let id = created.ensure_one()?;
                self.write(RecordData::new().set(field.name(), id))?;
            }
        }
        Ok(())
    }

    /// One-to-many fields of other models mirroring the many-to-one keys in
    /// `values`, with the parents currently referenced by these records.
    pub(crate) fn reverse_parents(&self, values: &FieldMap) -> CoreResult<ReverseParents> {
        let mut parents = ReverseParents::new();
        for (name, value) in values {
            let Some(field) = self.model.field(name) else {
                continue;
            };
            if !matches!(field.field_type(), FieldType::Many2One { .. }) {
                continue;
            }
            for (owner, mirror) in self.mirrors_of(name) {
                let entry = parents.entry((owner, mirror)).or_default();
                entry.extend(value.to_ids().into_iter().filter(|id| *id > 0));
                for record in self.records()? {
                    if record.ensure_one()? < 0 {
                        continue;
                    }
                    if let Some(current) = record.get(name)?.as_i64() {
                        entry.insert(current);
                    }
                }
            }
        }
        Ok(parents)
    }

    /// (model, field) of every one-to-many or reverse-one field whose
    /// reverse key is `fk` on this model.
    fn mirrors_of(&self, fk: &str) -> Vec<(String, String)> {
        let mut mirrors = Vec::new();
        for model in self.registry().models() {
            for field in model.fields() {
                let (FieldType::One2Many {
                    comodel,
                    reverse_fk,
                }
                | FieldType::Rev2One {
                    comodel,
                    reverse_fk,
                }) = field.field_type()
                else {
                    continue;
                };
                if comodel == self.model.name() && reverse_fk == fk {
                    mirrors.push((model.name().to_string(), field.name().to_string()));
                }
            }
        }
        mirrors
    }

    /// Drops the cached one-to-many lists of `parents`.
    pub(crate) fn invalidate_reverse_parents(&self, parents: &ReverseParents) -> CoreResult<()> {
        let mut cache = self.env.cache_mut();
        for ((owner, mirror), ids) in parents {
            let model = self.registry().model(owner)?;
            for id in ids {
                cache.invalidate_field(model, *id, mirror);
            }
        }
        Ok(())
    }

    /// Drops every cached value that may still point to the deleted `ids`.
    pub(crate) fn invalidate_after_unlink(&self, ids: &[i64]) {
        let mut cache = self.env.cache_mut();
        for id in ids {
            cache.invalidate_record(self.model, *id);
        }
        for model in self.registry().models() {
            for field in model.fields() {
                if field.field_type().comodel() != Some(self.model.name()) {
                    continue;
                }
                match field.field_type() {
                    FieldType::Many2One { .. } => {
                        cache.invalidate_referencing(model, field.name(), ids)
                    }
                    FieldType::One2Many { .. } | FieldType::Rev2One { .. } => {
                        cache.invalidate_field_everywhere(model, field.name())
                    }
                    FieldType::Many2Many { .. } => {
                        if let Some(link) = field.link_table() {
                            cache.invalidate_links(link);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}
