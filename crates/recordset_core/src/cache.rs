//! Per-environment record cache.
//!
//! # Responsibility
//! - Memoize field values keyed by (model, record id, field, context slug).
//! - Keep a many-to-many link index shared by both sides of a link table.
//!
//! # Invariants
//! - The cache never performs I/O.
//! - Non-contexted fields are always stored under the empty slug.
//! - Many-to-many values are derived from the link index; a record side is
//!   readable only after its links were loaded or written.
//! - Not synchronized: one cache belongs to exactly one `Environment`.

use crate::env::Context;
use crate::registry::field::{Field, FieldType, LinkTable};
use crate::registry::model::Model;
use crate::value::{FieldMap, Value};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    model: String,
    id: i64,
}

impl RecordKey {
    fn new(model: &Model, id: i64) -> Self {
        Self {
            model: model.name().to_string(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FieldKey {
    field: String,
    slug: String,
}

/// Canonical serialization of the context keys relevant to a model.
///
/// Keys are sorted; keys missing from `context` are skipped. A context with
/// `default_contexts` set reads default values and maps to the empty slug.
pub fn context_slug(keys: &[String], context: &Context) -> String {
    if context.is_true("default_contexts") {
        return String::new();
    }
    keys.iter()
        .filter_map(|key| {
            context
                .get(key)
                .filter(|value| !value.is_null())
                .map(|value| format!("{key}={value}"))
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[derive(Debug, Default)]
pub struct Cache {
    records: HashMap<RecordKey, HashMap<FieldKey, Value>>,
    /// Link table -> (left id, right id) with columns ordered by name.
    links: HashMap<String, BTreeSet<(i64, i64)>>,
    /// (link table, column, id) sides whose links are known.
    links_loaded: HashSet<(String, String, i64)>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slug_for<'s>(field: &Field, slug: &'s str) -> &'s str {
        if field.is_contexted() {
            slug
        } else {
            ""
        }
    }

    /// Returns whether every id has every field cached under `slug`.
    ///
    /// Non-strict checks also accept the default-context entry of contexted
    /// fields.
    pub fn check_if_in_cache(
        &self,
        model: &Model,
        ids: &[i64],
        fields: &[String],
        slug: &str,
        strict: bool,
    ) -> bool {
        ids.iter().all(|id| {
            fields.iter().all(|name| match model.field(name) {
                None => false,
                Some(field) => match link_of(field) {
                    Some(link) => self.links_loaded.contains(&(
                        link.table.clone(),
                        link.our_column.clone(),
                        *id,
                    )),
                    None => {
                        self.has_entry(model, *id, name, Self::slug_for(field, slug))
                            || (!strict && field.is_contexted() && self.has_entry(model, *id, name, ""))
                    }
                },
            })
        })
    }

    fn has_entry(&self, model: &Model, id: i64, field: &str, slug: &str) -> bool {
        self.records
            .get(&RecordKey::new(model, id))
            .is_some_and(|entries| {
                entries.contains_key(&FieldKey {
                    field: field.to_string(),
                    slug: slug.to_string(),
                })
            })
    }

    pub fn get(&self, model: &Model, id: i64, field: &str, slug: &str) -> Option<Value> {
        let descriptor = model.field(field)?;
        if let Some(link) = link_of(descriptor) {
            let side = (link.table.clone(), link.our_column.clone(), id);
            if !self.links_loaded.contains(&side) {
                return None;
            }
            return Some(Value::Ids(self.linked_ids(link, id)));
        }
        self.records
            .get(&RecordKey::new(model, id))?
            .get(&FieldKey {
                field: field.to_string(),
                slug: Self::slug_for(descriptor, slug).to_string(),
            })
            .cloned()
    }

    /// Bulk-inserts a row; unknown keys are ignored.
    pub fn add_record(&mut self, model: &Model, id: i64, values: &FieldMap, slug: &str) {
        for (field, value) in values {
            self.update_entry(model, id, field, value.clone(), slug);
        }
        self.update_entry(model, id, "id", Value::Integer(id), slug);
    }

    pub fn update_entry(&mut self, model: &Model, id: i64, field: &str, value: Value, slug: &str) {
        let Some(descriptor) = model.field(field) else {
            return;
        };
        if let Some(link) = link_of(descriptor) {
            self.remove_m2m_links(link, id);
            self.add_m2m_link(link, id, &value.to_ids());
            return;
        }
        self.records
            .entry(RecordKey::new(model, id))
            .or_default()
            .insert(
                FieldKey {
                    field: field.to_string(),
                    slug: Self::slug_for(descriptor, slug).to_string(),
                },
                value,
            );
    }

    /// Drops every entry of one record, all slugs included.
    pub fn invalidate_record(&mut self, model: &Model, id: i64) {
        self.records.remove(&RecordKey::new(model, id));
        for field in model.fields() {
            if let Some(link) = link_of(field) {
                let counterparts = self.linked_ids(link, id);
                self.remove_m2m_links(link, id);
                self.links_loaded
                    .remove(&(link.table.clone(), link.our_column.clone(), id));
                for counterpart in counterparts {
                    self.links_loaded.remove(&(
                        link.table.clone(),
                        link.their_column.clone(),
                        counterpart,
                    ));
                }
            }
        }
    }

    /// Drops one field of one record under every slug.
    pub fn invalidate_field(&mut self, model: &Model, id: i64, field: &str) {
        if let Some(entries) = self.records.get_mut(&RecordKey::new(model, id)) {
            entries.retain(|key, _| key.field != field);
        }
    }

    /// Drops `field` of every cached record of `model`.
    pub fn invalidate_field_everywhere(&mut self, model: &Model, field: &str) {
        for (key, entries) in self.records.iter_mut() {
            if key.model == model.name() {
                entries.retain(|entry, _| entry.field != field);
            }
        }
    }

    /// Drops cached records of `model` whose `field` points to one of `ids`.
    pub fn invalidate_referencing(&mut self, model: &Model, field: &str, ids: &[i64]) {
        self.records.retain(|key, entries| {
            if key.model != model.name() {
                return true;
            }
            !entries.iter().any(|(entry, value)| {
                entry.field == field && value.as_i64().is_some_and(|id| ids.contains(&id))
            })
        });
    }

    /// Links `id` to every id in `related` and marks its side as loaded.
    pub fn add_m2m_link(&mut self, link: &LinkTable, id: i64, related: &[i64]) {
        let pairs = self.links.entry(link.table.clone()).or_default();
        for other in related {
            pairs.insert(oriented(link, id, *other));
        }
        self.links_loaded
            .insert((link.table.clone(), link.our_column.clone(), id));
    }

    /// Removes every link of `id` on the declaring side of `link`.
    pub fn remove_m2m_links(&mut self, link: &LinkTable, id: i64) {
        let ours_left = link.our_column <= link.their_column;
        if let Some(pairs) = self.links.get_mut(&link.table) {
            pairs.retain(|(left, right)| if ours_left { *left != id } else { *right != id });
        }
    }

    /// Forgets every link of `link.table`, both sides.
    pub fn invalidate_links(&mut self, link: &LinkTable) {
        self.links.remove(&link.table);
        self.links_loaded.retain(|(table, _, _)| *table != link.table);
    }

    fn linked_ids(&self, link: &LinkTable, id: i64) -> Vec<i64> {
        let ours_left = link.our_column <= link.their_column;
        self.links.get(&link.table).map_or_else(Vec::new, |pairs| {
            pairs
                .iter()
                .filter_map(|(left, right)| match ours_left {
                    true if *left == id => Some(*right),
                    false if *right == id => Some(*left),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.links.clear();
        self.links_loaded.clear();
    }

    /// Number of cached records, link sides excluded.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

fn link_of(field: &Field) -> Option<&LinkTable> {
    match field.field_type() {
        FieldType::Many2Many { .. } => field.link_table(),
        _ => None,
    }
}

fn oriented(link: &LinkTable, ours: i64, theirs: i64) -> (i64, i64) {
    if link.our_column <= link.their_column {
        (ours, theirs)
    } else {
        (theirs, ours)
    }
}

#[cfg(test)]
mod tests {
    use super::{context_slug, Cache};
    use crate::env::Context;
    use crate::registry::field::Field;
    use crate::registry::Registry;
    use crate::registry::model::Model;
    use crate::value::{FieldMap, Value};

    fn registry() -> Registry {
        let mut builder = Registry::builder();
        builder
            .register(
                Model::builder("Partner")
                    .field(Field::char("name"))
                    .field(Field::text("bio").contexted(&["lang"]))
                    .field(Field::many2many("tag_ids", "Tag")),
            )
            .unwrap();
        builder
            .register(
                Model::builder("Tag")
                    .field(Field::char("name"))
                    .field(Field::many2many("partner_ids", "Partner")),
            )
            .unwrap();
        builder.seal().unwrap()
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn slug_only_applies_to_contexted_fields() {
        let registry = registry();
        let partner = registry.model("Partner").unwrap();
        let mut cache = Cache::new();
        let mut row = FieldMap::new();
        row.insert("name".to_string(), Value::from("Acme"));
        row.insert("bio".to_string(), Value::from("Bonjour"));
        cache.add_record(partner, 1, &row, "lang=fr");

        assert_eq!(cache.get(partner, 1, "name", "lang=en"), Some(Value::from("Acme")));
        assert_eq!(cache.get(partner, 1, "bio", "lang=en"), None);
        assert!(cache.check_if_in_cache(partner, &[1], &fields(&["name", "bio"]), "lang=fr", true));
        assert!(!cache.check_if_in_cache(partner, &[1], &fields(&["bio"]), "lang=en", true));
    }

    #[test]
    fn strict_check_requires_every_id() {
        let registry = registry();
        let partner = registry.model("Partner").unwrap();
        let mut cache = Cache::new();
        cache.update_entry(partner, 1, "name", Value::from("a"), "");
        assert!(!cache.check_if_in_cache(partner, &[1, 2], &fields(&["name"]), "", true));
        cache.invalidate_record(partner, 1);
        assert!(!cache.check_if_in_cache(partner, &[1], &fields(&["name"]), "", true));
    }

    #[test]
    fn link_index_is_visible_from_both_sides() {
        let registry = registry();
        let partner = registry.model("Partner").unwrap();
        let tag = registry.model("Tag").unwrap();
        let mut cache = Cache::new();

        cache.update_entry(tag, 10, "partner_ids", Value::Ids(vec![]), "");
        cache.update_entry(partner, 1, "tag_ids", Value::Ids(vec![10, 11]), "");
        assert_eq!(cache.get(partner, 1, "tag_ids", ""), Some(Value::Ids(vec![10, 11])));
        assert_eq!(cache.get(tag, 10, "partner_ids", ""), Some(Value::Ids(vec![1])));
        assert_eq!(cache.get(tag, 11, "partner_ids", ""), None);

        let link = partner.field("tag_ids").unwrap().link_table().unwrap();
        cache.remove_m2m_links(link, 1);
        cache.add_m2m_link(link, 1, &[11]);
        assert_eq!(cache.get(tag, 10, "partner_ids", ""), Some(Value::Ids(vec![])));
    }

    #[test]
    fn context_slug_is_sorted_and_skips_missing_keys() {
        let context = Context::new().with("lang", "fr").with("company", 3);
        let keys = vec!["company".to_string(), "lang".to_string(), "tz".to_string()];
        assert_eq!(context_slug(&keys, &context), "company=3;lang=fr");
        let defaults = context.with("default_contexts", true);
        assert_eq!(context_slug(&keys, &defaults), "");
    }
}
