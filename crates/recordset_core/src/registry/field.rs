//! Field descriptors.
//!
//! # Responsibility
//! - Describe one model attribute: storage, relation kind and behaviors.
//! - Coerce caller values and decode driver values to the declared type.
//!
//! # Invariants
//! - Relation kinds form a closed set; relation targets are validated at seal.
//! - A contexted field never owns a column on its model table.

use crate::collection::RecordCollection;
use crate::env::Environment;
use crate::error::CoreResult;
use crate::value::Value;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub type DefaultFn = Arc<dyn Fn(&Environment<'_>) -> Value + Send + Sync>;
pub type ComputeFn = Arc<dyn Fn(&RecordCollection<'_>) -> CoreResult<Value> + Send + Sync>;
pub type InverseFn = Arc<dyn Fn(&RecordCollection<'_>, &Value) -> CoreResult<()> + Send + Sync>;

/// Semantic type of a field, relations included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    Char,
    Text,
    /// Unix epoch milliseconds.
    DateTime,
    Many2One {
        comodel: String,
    },
    One2Many {
        comodel: String,
        reverse_fk: String,
    },
    Many2Many {
        comodel: String,
    },
    /// At most one record of `comodel` whose `reverse_fk` points here.
    Rev2One {
        comodel: String,
        reverse_fk: String,
    },
}

impl FieldType {
    pub fn comodel(&self) -> Option<&str> {
        match self {
            Self::Many2One { comodel }
            | Self::One2Many { comodel, .. }
            | Self::Many2Many { comodel }
            | Self::Rev2One { comodel, .. } => Some(comodel.as_str()),
            _ => None,
        }
    }

    pub fn is_relation(&self) -> bool {
        self.comodel().is_some()
    }

    /// One-to-many, many-to-many and reverse-one: no column on this table.
    pub fn is_non_stored_relation(&self) -> bool {
        matches!(
            self,
            Self::One2Many { .. } | Self::Many2Many { .. } | Self::Rev2One { .. }
        )
    }

    pub fn is_reverse_relation(&self) -> bool {
        matches!(self, Self::One2Many { .. } | Self::Rev2One { .. })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Boolean | Self::Integer | Self::DateTime | Self::Many2One { .. } => "INTEGER",
            Self::Float => "REAL",
            Self::Char | Self::Text => "TEXT",
            Self::One2Many { .. } | Self::Many2Many { .. } | Self::Rev2One { .. } => "",
        }
    }

    /// Value returned for unset fields and empty collections.
    pub fn zero_value(&self) -> Value {
        match self {
            Self::Boolean => Value::Boolean(false),
            Self::Integer | Self::DateTime => Value::Integer(0),
            Self::Float => Value::Float(0.0),
            Self::Char | Self::Text => Value::Text(String::new()),
            Self::Many2One { .. } | Self::Rev2One { .. } => Value::Null,
            Self::One2Many { .. } | Self::Many2Many { .. } => Value::Ids(Vec::new()),
        }
    }

    /// Converts a caller-provided value to this type.
    pub fn coerce(&self, value: Value) -> Result<Value, String> {
        match (self, value) {
            (_, Value::Null) => Ok(match self {
                Self::One2Many { .. } | Self::Many2Many { .. } => Value::Ids(Vec::new()),
                _ => Value::Null,
            }),
            (Self::Boolean, Value::Boolean(v)) => Ok(Value::Boolean(v)),
            (Self::Boolean, Value::Integer(v)) => Ok(Value::Boolean(v != 0)),
            (Self::Integer | Self::DateTime, Value::Integer(v)) => Ok(Value::Integer(v)),
            (Self::Integer | Self::DateTime, Value::Boolean(v)) => Ok(Value::Integer(i64::from(v))),
            (Self::Float, Value::Float(v)) => Ok(Value::Float(v)),
            (Self::Float, Value::Integer(v)) => Ok(Value::Float(v as f64)),
            (Self::Char | Self::Text, Value::Text(v)) => Ok(Value::Text(v)),
            (Self::Many2One { .. } | Self::Rev2One { .. }, Value::Integer(0)) => Ok(Value::Null),
            (Self::Many2One { .. } | Self::Rev2One { .. }, Value::Integer(id)) => {
                Ok(Value::Integer(id))
            }
            (Self::Many2One { .. } | Self::Rev2One { .. }, Value::Ids(ids)) => {
                Ok(ids.first().map_or(Value::Null, |id| Value::Integer(*id)))
            }
            (Self::One2Many { .. } | Self::Many2Many { .. }, Value::Ids(ids)) => Ok(Value::Ids(ids)),
            (Self::One2Many { .. } | Self::Many2Many { .. }, Value::Integer(id)) => {
                Ok(Value::Ids(vec![id]))
            }
            (field_type, value) => Err(format!("cannot store {value:?} in a {field_type:?} field")),
        }
    }

    /// Interprets a raw driver value read from this field's column.
    pub fn decode(&self, raw: Value) -> Value {
        match (self, raw) {
            (Self::Boolean, Value::Integer(v)) => Value::Boolean(v != 0),
            (Self::Float, Value::Integer(v)) => Value::Float(v as f64),
            (Self::Many2One { .. } | Self::Rev2One { .. }, Value::Integer(0)) => Value::Null,
            (_, raw) => raw,
        }
    }
}

/// Referential action of a many-to-one foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDelete {
    #[default]
    SetNull,
    Cascade,
    Restrict,
}

impl OnDelete {
    pub fn sql(self) -> &'static str {
        match self {
            Self::SetNull => "SET NULL",
            Self::Cascade => "CASCADE",
            Self::Restrict => "RESTRICT",
        }
    }
}

/// SQL aggregate applied to a numeric field in grouped queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupOperator {
    #[default]
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl GroupOperator {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Count => "COUNT",
        }
    }
}

/// Link table of a many-to-many field, seen from the declaring model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTable {
    pub table: String,
    pub our_column: String,
    pub their_column: String,
}

impl LinkTable {
    pub fn new(
        table: impl Into<String>,
        our_column: impl Into<String>,
        their_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            our_column: our_column.into(),
            their_column: their_column.into(),
        }
    }
}

/// Attribute descriptor of one model.
#[derive(Clone)]
pub struct Field {
    pub(crate) name: String,
    pub(crate) field_type: FieldType,
    pub(crate) stored: bool,
    pub(crate) required: bool,
    pub(crate) compute: Option<ComputeFn>,
    pub(crate) depends: Vec<String>,
    pub(crate) inverse: Option<InverseFn>,
    pub(crate) related: Option<String>,
    pub(crate) contexts: Vec<String>,
    pub(crate) default: Option<DefaultFn>,
    pub(crate) constraint: Option<String>,
    pub(crate) group_operator: GroupOperator,
    pub(crate) on_delete: OnDelete,
    pub(crate) link: Option<LinkTable>,
}

impl Field {
    fn with_type(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            stored: true,
            required: false,
            compute: None,
            depends: Vec::new(),
            inverse: None,
            related: None,
            contexts: Vec::new(),
            default: None,
            constraint: None,
            group_operator: GroupOperator::default(),
            on_delete: OnDelete::default(),
            link: None,
        }
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::with_type(name, FieldType::Boolean)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::with_type(name, FieldType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::with_type(name, FieldType::Float)
    }

    pub fn char(name: impl Into<String>) -> Self {
        Self::with_type(name, FieldType::Char)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::with_type(name, FieldType::Text)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::with_type(name, FieldType::DateTime)
    }

    pub fn many2one(name: impl Into<String>, comodel: impl Into<String>) -> Self {
        Self::with_type(
            name,
            FieldType::Many2One {
                comodel: comodel.into(),
            },
        )
    }

    pub fn one2many(
        name: impl Into<String>,
        comodel: impl Into<String>,
        reverse_fk: impl Into<String>,
    ) -> Self {
        Self::with_type(
            name,
            FieldType::One2Many {
                comodel: comodel.into(),
                reverse_fk: reverse_fk.into(),
            },
        )
    }

    pub fn many2many(name: impl Into<String>, comodel: impl Into<String>) -> Self {
        Self::with_type(
            name,
            FieldType::Many2Many {
                comodel: comodel.into(),
            },
        )
    }

    pub fn rev2one(
        name: impl Into<String>,
        comodel: impl Into<String>,
        reverse_fk: impl Into<String>,
    ) -> Self {
        Self::with_type(
            name,
            FieldType::Rev2One {
                comodel: comodel.into(),
                reverse_fk: reverse_fk.into(),
            },
        )
    }

    /// Field delegating to `path` through relations.
    ///
    /// The type is taken from the path target when the registry is sealed.
    pub fn related(name: impl Into<String>, path: impl Into<String>) -> Self {
        let mut field = Self::with_type(name, FieldType::Char);
        field.stored = false;
        field.related = Some(path.into());
        field
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Keeps a computed field in its own column.
    pub fn stored(mut self) -> Self {
        self.stored = true;
        self
    }

    /// Computes the value per record; `depends` lists the paths whose change
    /// triggers recomputation of stored computed fields.
    pub fn compute<F>(mut self, depends: &[&str], compute: F) -> Self
    where
        F: Fn(&RecordCollection<'_>) -> CoreResult<Value> + Send + Sync + 'static,
    {
        self.stored = false;
        self.compute = Some(Arc::new(compute));
        self.depends = depends.iter().map(|path| path.to_string()).collect();
        self
    }

    pub fn inverse<F>(mut self, inverse: F) -> Self
    where
        F: Fn(&RecordCollection<'_>, &Value) -> CoreResult<()> + Send + Sync + 'static,
    {
        self.inverse = Some(Arc::new(inverse));
        self
    }

    /// Stores one value per combination of the given context keys.
    pub fn contexted(mut self, keys: &[&str]) -> Self {
        self.contexts = keys.iter().map(|key| key.to_string()).collect();
        self
    }

    pub fn default_fn<F>(mut self, default: F) -> Self
    where
        F: Fn(&Environment<'_>) -> Value + Send + Sync + 'static,
    {
        self.default = Some(Arc::new(default));
        self
    }

    pub fn default_value(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.default_fn(move |_| value.clone())
    }

    /// Binds a constraint method run after every write touching this field.
    pub fn constraint(mut self, method: impl Into<String>) -> Self {
        self.constraint = Some(method.into());
        self
    }

    pub fn group_operator(mut self, operator: GroupOperator) -> Self {
        self.group_operator = operator;
        self
    }

    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        self.on_delete = on_delete;
        self
    }

    /// Overrides the generated many-to-many link table.
    pub fn link(
        mut self,
        table: impl Into<String>,
        our_column: impl Into<String>,
        their_column: impl Into<String>,
    ) -> Self {
        self.link = Some(LinkTable::new(table, our_column, their_column));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn link_table(&self) -> Option<&LinkTable> {
        self.link.as_ref()
    }

    pub fn related_path(&self) -> Option<&str> {
        self.related.as_deref()
    }

    pub fn context_keys(&self) -> &[String] {
        &self.contexts
    }

    pub fn depends(&self) -> &[String] {
        &self.depends
    }

    pub fn constraint_method(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    pub fn is_computed(&self) -> bool {
        self.compute.is_some()
    }

    pub fn is_related(&self) -> bool {
        self.related.is_some()
    }

    pub fn is_contexted(&self) -> bool {
        !self.contexts.is_empty()
    }

    /// Has a physical column on the model table.
    pub fn is_column(&self) -> bool {
        self.stored
            && !self.is_related()
            && !self.is_contexted()
            && !self.field_type.is_non_stored_relation()
    }

    /// Persisted somewhere: own column or contexted side table.
    pub fn is_stored(&self) -> bool {
        self.is_column() || (self.is_contexted() && !self.is_related())
    }

    pub fn is_settable(&self) -> bool {
        !self.is_computed() || self.inverse.is_some()
    }

    pub fn zero_value(&self) -> Value {
        self.field_type.zero_value()
    }
}

impl Debug for Field {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .field("stored", &self.stored)
            .field("computed", &self.is_computed())
            .field("related", &self.related)
            .field("contexts", &self.contexts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Field, FieldType};
    use crate::value::Value;

    #[test]
    fn many2one_coercion_drops_zero_ids() {
        let field_type = FieldType::Many2One {
            comodel: "Partner".to_string(),
        };
        assert_eq!(field_type.coerce(Value::Integer(0)), Ok(Value::Null));
        assert_eq!(
            field_type.coerce(Value::Ids(vec![7, 8])),
            Ok(Value::Integer(7))
        );
    }

    #[test]
    fn text_fields_reject_numbers() {
        assert!(FieldType::Char.coerce(Value::Integer(1)).is_err());
    }

    #[test]
    fn storage_classification() {
        assert!(Field::char("name").is_column());
        let computed = Field::float("total").compute(&[], |_| Ok(Value::Null));
        assert!(!computed.is_stored());
        assert!(!computed.is_settable());
        assert!(computed.stored().is_column());
        assert!(!Field::char("title").contexted(&["lang"]).is_column());
        assert!(Field::char("title").contexted(&["lang"]).is_stored());
        assert!(!Field::one2many("line_ids", "Line", "order_id").is_column());
    }
}
