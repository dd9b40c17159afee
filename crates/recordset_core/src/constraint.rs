//! Stored computed fields and declared constraints.
//!
//! # Responsibility
//! - Run inverse methods of settable computed fields.
//! - Recompute stored computed fields whose dependencies changed, on the
//!   records that depend on the changed ones.
//! - Run constraint methods once per record after every other write step.
//!
//! # Invariants
//! - Recomputation writes bypass access checks and inverse methods.
//! - A constraint method runs at most once per record and write, even when
//!   several changed fields declare it.

use crate::collection::{RecordCollection, WriteOptions};
use crate::data::RecordData;
use crate::error::CoreResult;
use crate::query::Condition;
use crate::registry::model::Model;
use crate::relation::ReverseParents;
use crate::value::FieldMap;
use log::debug;
use std::collections::BTreeMap;

/// (model, computed field) to recompute, with the record ids concerned.
type Pending = BTreeMap<(String, String), Vec<i64>>;

/// Computed field to refresh on records that depend on a deleted record.
#[derive(Debug, Clone)]
pub(crate) struct Dependent {
    model: String,
    field: String,
    ids: Vec<i64>,
}

fn push_pending(pending: &mut Pending, model: &str, field: &str, ids: &[i64]) {
    if ids.is_empty() {
        return;
    }
    let entry = pending
        .entry((model.to_string(), field.to_string()))
        .or_default();
    for id in ids {
        if !entry.contains(id) {
            entry.push(*id);
        }
    }
}

impl<'e> RecordCollection<'e> {
    /// Calls the inverse method of every settable computed field in `values`.
    pub(crate) fn process_inverse_methods(&self, values: &FieldMap) -> CoreResult<()> {
        for (name, value) in values {
            let Some(inverse) = self.model.field(name).and_then(|field| field.inverse.clone())
            else {
                continue;
            };
            for record in self.records()? {
                inverse(&record, value)?;
            }
        }
        Ok(())
    }

    /// Ids of `owner` records whose `path` leads to one of `ids`.
    fn dependent_ids(&self, owner: &'e Model, path: &str, ids: &[i64]) -> CoreResult<Vec<i64>> {
        if path.is_empty() {
            return Ok(ids.to_vec());
        }
        let found = self
            .related_pool(owner)
            .search(Condition::field(path).is_in(ids.to_vec()))
            .fetch()?;
        Ok(found.ids()?.to_vec())
    }

    fn collect_triggers(
        &self,
        model: &Model,
        fields: &[String],
        ids: &[i64],
        pending: &mut Pending,
    ) -> CoreResult<()> {
        let registry = self.registry();
        for name in fields {
            for trigger in registry.triggers(model.name(), name) {
                let owner = registry.model(&trigger.model)?;
                let targets = self.dependent_ids(owner, &trigger.path, ids)?;
                push_pending(pending, &trigger.model, &trigger.field, &targets);
            }
        }
        Ok(())
    }

    /// Recomputes the stored computed fields depending on `changed`.
    ///
    /// With `include_own`, every stored computed field of these records is
    /// computed as well, as needed right after creation.
    pub(crate) fn process_triggers(&self, changed: &[String], include_own: bool) -> CoreResult<()> {
        let ids = self.positive_ids()?;
        if ids.is_empty() {
            return Ok(());
        }
        let mut pending = Pending::new();
        self.collect_triggers(self.model, changed, &ids, &mut pending)?;
        if include_own {
            for field in self.model.fields() {
                if field.is_computed() && field.is_column() {
                    push_pending(&mut pending, self.model.name(), field.name(), &ids);
                }
            }
        }
        self.run_pending(pending)
    }

    /// Recomputes fields depending on one-to-many lists that gained or lost
    /// records because a many-to-one key moved.
    pub(crate) fn process_reverse_triggers(&self, parents: &ReverseParents) -> CoreResult<()> {
        let mut pending = Pending::new();
        for ((owner, mirror), ids) in parents {
            let model = self.registry().model(owner)?;
            let ids: Vec<i64> = ids.iter().copied().collect();
            self.collect_triggers(model, std::slice::from_ref(mirror), &ids, &mut pending)?;
        }
        self.run_pending(pending)
    }

    fn run_pending(&self, pending: Pending) -> CoreResult<()> {
        for ((model, field), ids) in pending {
            let model = self.registry().model(&model)?;
            self.related_collection(model, ids)
                .recompute(std::slice::from_ref(&field))?;
        }
        Ok(())
    }

    /// Computes `fields` on every record and stores the results.
    pub(crate) fn recompute(&self, fields: &[String]) -> CoreResult<()> {
        for record in self.records()? {
            if record.ensure_one()? < 0 {
                continue;
            }
            let mut data = RecordData::new();
            for name in fields {
                let Some(compute) = self.model.field(name).and_then(|field| field.compute.clone())
                else {
                    continue;
                };
                data = data.set(name, compute(&record)?);
            }
            debug!(
                "event=recompute module=constraint status=start model={} fields={}",
                self.model.name(),
                fields.join(",")
            );
            record.write_values(data, WriteOptions::RECOMPUTE)?;
        }
        Ok(())
    }

    /// Computed fields of other records that depend on these records, to be
    /// refreshed once these records are gone.
    pub(crate) fn collect_dependents(&self) -> CoreResult<Vec<Dependent>> {
        let ids = self.positive_ids()?;
        let mut pending = Pending::new();
        if !ids.is_empty() {
            let registry = self.registry();
            for field in self.model.fields() {
                for trigger in registry.triggers(self.model.name(), field.name()) {
                    if trigger.path.is_empty() {
                        continue;
                    }
                    let owner = registry.model(&trigger.model)?;
                    let targets = self.dependent_ids(owner, &trigger.path, &ids)?;
                    push_pending(&mut pending, &trigger.model, &trigger.field, &targets);
                }
            }
        }
        Ok(pending
            .into_iter()
            .map(|((model, field), ids)| Dependent { model, field, ids })
            .collect())
    }

    /// Recomputes the dependents that still exist.
    pub(crate) fn recompute_dependents(&self, dependents: Vec<Dependent>) -> CoreResult<()> {
        for dependent in dependents {
            let model = self.registry().model(&dependent.model)?;
            let remaining = self
                .related_pool(model)
                .search(Condition::field("id").is_in(dependent.ids))
                .fetch()?;
            remaining.recompute(std::slice::from_ref(&dependent.field))?;
        }
        Ok(())
    }

    /// Runs the constraint methods declared by the fields in `changed`.
    ///
    /// Skipped entirely when the context sets `skip_check_constraints`.
    pub(crate) fn check_constraints(&self, changed: &[String]) -> CoreResult<()> {
        if self.context().is_true("skip_check_constraints") {
            return Ok(());
        }
        let mut methods: Vec<&str> = Vec::new();
        for name in changed {
            if let Some(method) = self
                .model
                .field(name)
                .and_then(|field| field.constraint_method())
            {
                if !methods.contains(&method) {
                    methods.push(method);
                }
            }
        }
        if methods.is_empty() {
            return Ok(());
        }
        for record in self.records()? {
            if record.ensure_one()? < 0 {
                continue;
            }
            for method in &methods {
                record.call(method, &[])?;
            }
        }
        Ok(())
    }
}
