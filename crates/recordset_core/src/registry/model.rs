//! Model descriptors and their registration builder.

use crate::error::CoreResult;
use crate::query::OrderPredicate;
use crate::registry::field::Field;
use crate::registry::method::{Method, MethodCall, MethodHandler};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Named SQL `CHECK` constraint with the message shown when it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlConstraint {
    pub name: String,
    pub check: String,
    pub message: String,
}

/// Sealed schema of one business model.
#[derive(Debug)]
pub struct Model {
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) fields: Vec<Field>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) default_order: Vec<OrderPredicate>,
    pub(crate) sql_constraints: Vec<SqlConstraint>,
    pub(crate) mixin: bool,
    pub(crate) inherits: Vec<String>,
    pub(crate) system: bool,
    pub(crate) methods: BTreeMap<String, Method>,
    pub(crate) context_keys: Vec<String>,
}

impl Model {
    pub fn builder(name: impl Into<String>) -> ModelBuilder {
        ModelBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index.get(name).map(|position| &self.fields[*position])
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name.clone()).collect()
    }

    /// Fields loaded by a plain `load()`: columns and contexted values.
    pub fn stored_field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|field| field.is_stored())
            .map(|field| field.name.clone())
            .collect()
    }

    pub fn default_order(&self) -> &[OrderPredicate] {
        &self.default_order
    }

    pub fn sql_constraints(&self) -> &[SqlConstraint] {
        &self.sql_constraints
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn is_mixin(&self) -> bool {
        self.mixin
    }

    /// System models carry no create/write bookkeeping fields.
    pub fn is_system(&self) -> bool {
        self.system
    }

    /// Sorted context keys used by any contexted field of this model.
    pub fn context_keys(&self) -> &[String] {
        &self.context_keys
    }

    /// Side table holding per-context values of `field`.
    pub fn context_table(&self, field: &str) -> String {
        format!("{}__{}_ctx", self.table, field)
    }
}

/// Registration-time description of a model.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    pub(crate) name: String,
    pub(crate) fields: Vec<Field>,
    pub(crate) order: Vec<String>,
    pub(crate) sql_constraints: Vec<SqlConstraint>,
    pub(crate) mixin: bool,
    pub(crate) inherits: Vec<String>,
    pub(crate) system: bool,
    pub(crate) methods: BTreeMap<String, Method>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            order: Vec::new(),
            sql_constraints: Vec::new(),
            mixin: false,
            inherits: Vec::new(),
            system: false,
            methods: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a field, replacing any previous field with the same name.
    pub fn field(mut self, field: Field) -> Self {
        match self.fields.iter_mut().find(|existing| existing.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    /// Default ordering, e.g. `["amount desc", "name"]`.
    pub fn order(mut self, exprs: &[&str]) -> Self {
        self.order = exprs.iter().map(|expr| expr.to_string()).collect();
        self
    }

    pub fn sql_constraint(
        mut self,
        name: impl Into<String>,
        check: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.sql_constraints.push(SqlConstraint {
            name: name.into(),
            check: check.into(),
            message: message.into(),
        });
        self
    }

    /// Abstract model whose fields and methods are copied into inheritors.
    pub fn mixin(mut self) -> Self {
        self.mixin = true;
        self
    }

    pub fn inherit(mut self, mixin: impl Into<String>) -> Self {
        self.inherits.push(mixin.into());
        self
    }

    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    /// Adds a layer on top of the method chain `name`.
    pub fn method<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&MethodCall<'_>, &[Value]) -> CoreResult<Value> + Send + Sync + 'static,
    {
        let handler: MethodHandler = Arc::new(handler);
        self.methods
            .entry(name.to_string())
            .or_insert_with(|| Method::new(name))
            .push_layer(handler);
        self
    }
}
