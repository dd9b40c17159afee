//! Model registry: bootstrap-time registration and the sealed, shared view.
//!
//! # Responsibility
//! - Collect model registrations and extensions from independent modules.
//! - Resolve mixins, automatic fields, relations, related paths and
//!   recomputation triggers in one `seal()` step.
//!
//! # Invariants
//! - A sealed [`Registry`] is never mutated; share it through `Arc`.
//! - Every relation target named by a sealed field exists.
//! - Mixins have no table and cannot back a record collection.

pub mod field;
pub mod method;
pub mod model;

use crate::error::{CoreError, CoreResult};
use crate::query::OrderPredicate;
use crate::value::Value;
use field::{Field, FieldType, LinkTable};
use log::info;
use model::{Model, ModelBuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub use field::{GroupOperator, OnDelete};
pub use method::{Method, MethodCall};
pub use model::SqlConstraint;

static MODEL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("valid model name regex"));
static FIELD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid field name regex"));
static ACRONYM_BOUNDARY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").expect("valid acronym boundary regex"));
static WORD_BOUNDARY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-z0-9])([A-Z])").expect("valid word boundary regex"));

const MAX_RELATED_DEPTH: usize = 8;

/// Registration and sealing errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidName(String),
    DuplicateModel(String),
    UnknownModel(String),
    UnknownMixin {
        model: String,
        mixin: String,
    },
    InvalidField {
        model: String,
        field: String,
        reason: String,
    },
    UnknownMethod {
        model: String,
        method: String,
    },
    InvalidOrder {
        model: String,
        expr: String,
    },
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid model or field name: {name}"),
            Self::DuplicateModel(name) => write!(f, "model already registered: {name}"),
            Self::UnknownModel(name) => write!(f, "unknown model: {name}"),
            Self::UnknownMixin { model, mixin } => {
                write!(f, "model {model} inherits unknown mixin {mixin}")
            }
            Self::InvalidField {
                model,
                field,
                reason,
            } => write!(f, "invalid field {model}.{field}: {reason}"),
            Self::UnknownMethod { model, method } => {
                write!(f, "model {model} has no method {method}")
            }
            Self::InvalidOrder { model, expr } => {
                write!(f, "invalid order expression for {model}: {expr}")
            }
        }
    }
}

impl Error for RegistryError {}

/// Stored computed field to refresh when a dependency changes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Trigger {
    /// Model owning the computed field.
    pub model: String,
    pub field: String,
    /// Path from `model` to the changed records; empty for the same record.
    pub path: String,
}

/// Collects model registrations before sealing.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    models: Vec<ModelBuilder>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: ModelBuilder) -> Result<(), RegistryError> {
        if !MODEL_NAME_RE.is_match(model.name()) {
            return Err(RegistryError::InvalidName(model.name().to_string()));
        }
        if self.models.iter().any(|existing| existing.name() == model.name()) {
            return Err(RegistryError::DuplicateModel(model.name().to_string()));
        }
        self.models.push(model);
        Ok(())
    }

    /// Lets another module add fields or method layers to a registered model.
    pub fn extend<F>(&mut self, name: &str, extension: F) -> Result<(), RegistryError>
    where
        F: FnOnce(ModelBuilder) -> ModelBuilder,
    {
        let position = self
            .models
            .iter()
            .position(|model| model.name() == name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))?;
        let current = std::mem::replace(&mut self.models[position], ModelBuilder::new(name));
        self.models[position] = extension(current);
        Ok(())
    }

    /// Resolves every registration and returns the read-only registry.
    pub fn seal(self) -> Result<Registry, RegistryError> {
        let mixins: BTreeMap<String, ModelBuilder> = self
            .models
            .iter()
            .filter(|model| model.mixin)
            .map(|model| (model.name.clone(), model.clone()))
            .collect();

        let mut models = BTreeMap::new();
        for builder in self.models.into_iter().filter(|model| !model.mixin) {
            let builder = apply_mixins(builder, &mixins)?;
            let model = build_model(builder)?;
            models.insert(model.name.clone(), model);
        }

        resolve_relations(&mut models)?;
        resolve_related_fields(&mut models)?;
        let triggers = build_triggers(&models)?;

        info!(
            "event=registry_seal module=registry status=ok models={} triggers={}",
            models.len(),
            triggers.values().map(Vec::len).sum::<usize>()
        );
        Ok(Registry { models, triggers })
    }
}

/// Sealed model registry.
#[derive(Debug)]
pub struct Registry {
    models: BTreeMap<String, Model>,
    triggers: HashMap<(String, String), Vec<Trigger>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    /// Returns the model or an invariant violation for unknown names.
    pub fn model(&self, name: &str) -> CoreResult<&Model> {
        self.models
            .get(name)
            .ok_or_else(|| CoreError::invariant(format!("unknown model `{name}`")))
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Stored computed fields depending on `model.field`.
    pub fn triggers(&self, model: &str, field: &str) -> &[Trigger] {
        self.triggers
            .get(&(model.to_string(), field.to_string()))
            .map_or(&[], Vec::as_slice)
    }
}

/// Converts `SaleOrderLine` to `sale_order_line`.
pub fn table_name(model: &str) -> String {
    let split = ACRONYM_BOUNDARY_RE.replace_all(model, "${1}_${2}");
    WORD_BOUNDARY_RE
        .replace_all(&split, "${1}_${2}")
        .to_ascii_lowercase()
}

fn invalid_field(model: &str, field: &str, reason: impl Into<String>) -> RegistryError {
    RegistryError::InvalidField {
        model: model.to_string(),
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn apply_mixins(
    mut builder: ModelBuilder,
    mixins: &BTreeMap<String, ModelBuilder>,
) -> Result<ModelBuilder, RegistryError> {
    for mixin_name in builder.inherits.clone() {
        let mixin = mixins
            .get(&mixin_name)
            .ok_or_else(|| RegistryError::UnknownMixin {
                model: builder.name.clone(),
                mixin: mixin_name.clone(),
            })?;
        for field in &mixin.fields {
            if !builder.fields.iter().any(|own| own.name == field.name) {
                builder.fields.push(field.clone());
            }
        }
        for (name, method) in &mixin.methods {
            match builder.methods.get_mut(name) {
                Some(own) => own.prepend_layers(method),
                None => {
                    builder.methods.insert(name.clone(), method.clone());
                }
            }
        }
        builder
            .sql_constraints
            .extend(mixin.sql_constraints.iter().cloned());
    }
    Ok(builder)
}

fn automatic_fields(system: bool) -> Vec<Field> {
    let mut fields = vec![
        Field::integer("id"),
        Field::char("external_id").default_fn(|_| Value::Text(Uuid::new_v4().to_string())),
    ];
    if !system {
        fields.push(Field::datetime("create_date"));
        fields.push(Field::integer("create_uid"));
        fields.push(Field::datetime("write_date"));
        fields.push(Field::integer("write_uid"));
    }
    fields
}

fn build_model(builder: ModelBuilder) -> Result<Model, RegistryError> {
    let mut fields = Vec::new();
    for automatic in automatic_fields(builder.system) {
        if !builder.fields.iter().any(|own| own.name == automatic.name) {
            fields.push(automatic);
        }
    }
    fields.extend(builder.fields);

    let mut index = HashMap::new();
    for (position, field) in fields.iter().enumerate() {
        if !FIELD_NAME_RE.is_match(&field.name) {
            return Err(RegistryError::InvalidName(format!(
                "{}.{}",
                builder.name, field.name
            )));
        }
        if field.is_contexted() && (field.field_type.is_relation() || field.is_computed()) {
            return Err(invalid_field(
                &builder.name,
                &field.name,
                "contexted fields must be plain stored values",
            ));
        }
        if let Some(method) = field.constraint.as_deref() {
            if !builder.methods.contains_key(method) {
                return Err(RegistryError::UnknownMethod {
                    model: builder.name.clone(),
                    method: method.to_string(),
                });
            }
        }
        index.insert(field.name.clone(), position);
    }

    let order_exprs = if builder.order.is_empty() {
        vec!["id".to_string()]
    } else {
        builder.order.clone()
    };
    let mut default_order = Vec::new();
    for expr in order_exprs {
        let predicate = OrderPredicate::parse(&expr).ok_or_else(|| RegistryError::InvalidOrder {
            model: builder.name.clone(),
            expr: expr.clone(),
        })?;
        default_order.push(predicate);
    }

    let mut context_keys: Vec<String> = fields
        .iter()
        .flat_map(|field| field.contexts.iter().cloned())
        .collect();
    context_keys.sort();
    context_keys.dedup();

    Ok(Model {
        table: table_name(&builder.name),
        name: builder.name,
        fields,
        index,
        default_order,
        sql_constraints: builder.sql_constraints,
        mixin: false,
        inherits: builder.inherits,
        system: builder.system,
        methods: builder.methods,
        context_keys,
    })
}

fn resolve_relations(models: &mut BTreeMap<String, Model>) -> Result<(), RegistryError> {
    let tables: BTreeMap<String, String> = models
        .values()
        .map(|model| (model.name.clone(), model.table.clone()))
        .collect();
    let mut links = Vec::new();

    for model in models.values() {
        for field in &model.fields {
            let Some(comodel_name) = field.field_type.comodel() else {
                continue;
            };
            let comodel = models.get(comodel_name).ok_or_else(|| {
                invalid_field(
                    &model.name,
                    &field.name,
                    format!("unknown comodel {comodel_name}"),
                )
            })?;
            match &field.field_type {
                FieldType::One2Many { reverse_fk, .. } | FieldType::Rev2One { reverse_fk, .. } => {
                    let points_back = comodel.field(reverse_fk).is_some_and(|fk| {
                        fk.field_type
                            == FieldType::Many2One {
                                comodel: model.name.clone(),
                            }
                    });
                    if !points_back {
                        return Err(invalid_field(
                            &model.name,
                            &field.name,
                            format!("{comodel_name}.{reverse_fk} is not a many2one to {}", model.name),
                        ));
                    }
                }
                FieldType::Many2Many { .. } if field.link.is_none() => {
                    let ours = &tables[&model.name];
                    let theirs = &tables[comodel_name];
                    if ours == theirs {
                        return Err(invalid_field(
                            &model.name,
                            &field.name,
                            "self-referencing many2many needs an explicit link table",
                        ));
                    }
                    let (first, second) = if ours < theirs {
                        (ours, theirs)
                    } else {
                        (theirs, ours)
                    };
                    links.push((
                        model.name.clone(),
                        field.name.clone(),
                        LinkTable::new(
                            format!("{first}_{second}_rel"),
                            format!("{ours}_id"),
                            format!("{theirs}_id"),
                        ),
                    ));
                }
                _ => {}
            }
        }
    }

    for (model_name, field_name, link) in links {
        if let Some(model) = models.get_mut(&model_name) {
            if let Some(position) = model.index.get(&field_name).copied() {
                model.fields[position].link = Some(link);
            }
        }
    }
    Ok(())
}

fn related_target<'m>(
    models: &'m BTreeMap<String, Model>,
    model: &'m Model,
    path: &str,
    depth: usize,
) -> Result<&'m Field, String> {
    if depth > MAX_RELATED_DEPTH {
        return Err(format!("related path `{path}` is too deep or cyclic"));
    }
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let field = model
        .field(head)
        .ok_or_else(|| format!("unknown field `{head}` on {}", model.name))?;
    if let Some(target) = field.related.as_deref() {
        let substituted = match rest {
            Some(rest) => format!("{target}.{rest}"),
            None => target.to_string(),
        };
        return related_target(models, model, &substituted, depth + 1);
    }
    match rest {
        None => Ok(field),
        Some(rest) => {
            let comodel = field
                .field_type
                .comodel()
                .and_then(|name| models.get(name))
                .ok_or_else(|| format!("`{head}` on {} is not a relation", model.name))?;
            related_target(models, comodel, rest, depth + 1)
        }
    }
}

fn resolve_related_fields(models: &mut BTreeMap<String, Model>) -> Result<(), RegistryError> {
    let mut resolved = Vec::new();
    for model in models.values() {
        for (position, field) in model.fields.iter().enumerate() {
            let Some(path) = field.related.as_deref() else {
                continue;
            };
            if !path.contains('.') {
                return Err(invalid_field(
                    &model.name,
                    &field.name,
                    "related path must cross a relation",
                ));
            }
            let target = related_target(models, model, path, 0)
                .map_err(|reason| invalid_field(&model.name, &field.name, reason))?;
            resolved.push((
                model.name.clone(),
                position,
                target.field_type.clone(),
                target.group_operator,
            ));
        }
    }
    for (model_name, position, field_type, group_operator) in resolved {
        if let Some(model) = models.get_mut(&model_name) {
            let field = &mut model.fields[position];
            field.field_type = field_type;
            field.group_operator = group_operator;
        }
    }
    Ok(())
}

fn build_triggers(
    models: &BTreeMap<String, Model>,
) -> Result<HashMap<(String, String), Vec<Trigger>>, RegistryError> {
    let mut triggers: HashMap<(String, String), Vec<Trigger>> = HashMap::new();
    for model in models.values() {
        for field in model.fields.iter().filter(|field| field.is_computed() && field.stored) {
            for dependency in &field.depends {
                let segments: Vec<&str> = dependency.split('.').collect();
                let mut current = model;
                for (position, segment) in segments.iter().enumerate() {
                    let changed = current.field(segment).ok_or_else(|| {
                        invalid_field(
                            &model.name,
                            &field.name,
                            format!("unknown dependency `{dependency}`"),
                        )
                    })?;
                    let trigger = Trigger {
                        model: model.name.clone(),
                        field: field.name.clone(),
                        path: segments[..position].join("."),
                    };
                    let entry = triggers
                        .entry((current.name.clone(), changed.name.clone()))
                        .or_default();
                    if !entry.contains(&trigger) {
                        entry.push(trigger);
                    }
                    if position + 1 < segments.len() {
                        current = changed
                            .field_type
                            .comodel()
                            .and_then(|name| models.get(name))
                            .ok_or_else(|| {
                                invalid_field(
                                    &model.name,
                                    &field.name,
                                    format!("dependency `{dependency}` crosses a non-relation"),
                                )
                            })?;
                    }
                }
            }
        }
    }
    Ok(triggers)
}
