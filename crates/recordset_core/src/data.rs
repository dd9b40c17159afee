//! Input and output shapes of record data.

use crate::value::{FieldMap, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// Field values for `create`/`write`, with nested record directives.
///
/// `to_create` entries are created before (many-to-one, many-to-many) or
/// after (one-to-many, reverse-one) the record they belong to, and their ids
/// are linked through the named field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordData {
    pub values: FieldMap,
    pub to_create: BTreeMap<String, Vec<RecordData>>,
}

impl RecordData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.values.insert(field.to_string(), value.into());
        self
    }

    /// Queues a related record to create and link through `field`.
    pub fn create_related(mut self, field: &str, data: RecordData) -> Self {
        self.to_create.entry(field.to_string()).or_default().push(data);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn has(&self, field: &str) -> bool {
        self.values.contains_key(field) || self.to_create.contains_key(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.values.remove(field)
    }

    /// Names of every field carrying a value or a directive.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.keys().cloned().collect();
        for name in self.to_create.keys() {
            if !self.values.contains_key(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

impl From<FieldMap> for RecordData {
    fn from(values: FieldMap) -> Self {
        Self {
            values,
            to_create: BTreeMap::new(),
        }
    }
}

/// Field values of one record, as returned by `first()`/`all()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelData {
    pub model: String,
    pub values: FieldMap,
}

impl ModelData {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::RecordData;

    #[test]
    fn directives_count_as_set_fields() {
        let data = RecordData::new()
            .set("name", "Acme")
            .create_related("tag_ids", RecordData::new().set("name", "vip"));
        assert!(data.has("tag_ids"));
        assert_eq!(data.field_names(), vec!["name".to_string(), "tag_ids".to_string()]);
    }
}
