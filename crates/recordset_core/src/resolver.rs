//! Field path resolution and condition compilation.
//!
//! # Responsibility
//! - Split dotted field paths into relation hops and a leaf.
//! - Substitute related fields by the stored paths they delegate to.
//! - Compile condition trees over paths into single-table SQL conditions
//!   whose relation hops become nested `IN (SELECT ...)` filters.
//! - Derive the context filter and fallback order of contexted fields.
//!
//! # Invariants
//! - Paths handed to the SQL builders only name columns of one table.
//! - Non-stored computed fields are never searched or sorted on.
//! - For contexted fields the exact-context row sorts last so that it wins
//!   over the default-context row when both are read.

use crate::env::Context;
use crate::error::{CoreError, CoreResult};
use crate::query::sql::{quote, SqlCondition};
use crate::query::{Condition, Operator, OrderPredicate, Query};
use crate::registry::field::{Field, FieldType};
use crate::registry::model::Model;
use crate::registry::Registry;
use crate::value::Value;

const MAX_SUBSTITUTIONS: usize = 16;

/// Splits `a.b.c` into (`["a", "b"]`, `"c"`).
pub fn split_path(path: &str) -> (Vec<&str>, &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or_default();
    (segments, leaf)
}

/// Rewrites every related field crossed by `path` into its stored path.
pub fn substitute_related(registry: &Registry, model: &Model, path: &str) -> CoreResult<String> {
    substitute_at_depth(registry, model, path, 0)
}

fn substitute_at_depth(
    registry: &Registry,
    model: &Model,
    path: &str,
    depth: usize,
) -> CoreResult<String> {
    if depth > MAX_SUBSTITUTIONS {
        return Err(CoreError::invariant(format!(
            "related path `{path}` on {} does not terminate",
            model.name()
        )));
    }
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let field = known_field(model, head)?;
    if let Some(target) = field.related_path() {
        let expanded = match rest {
            Some(rest) => format!("{target}.{rest}"),
            None => target.to_string(),
        };
        return substitute_at_depth(registry, model, &expanded, depth + 1);
    }
    match rest {
        None => Ok(head.to_string()),
        Some(rest) => {
            let comodel = comodel_of(registry, model, field)?;
            let tail = substitute_at_depth(registry, comodel, rest, depth + 1)?;
            Ok(format!("{head}.{tail}"))
        }
    }
}

/// Returns the model and field a path ends on, following relations and
/// related fields.
pub fn resolve_field<'r>(
    registry: &'r Registry,
    model: &'r Model,
    path: &str,
) -> CoreResult<(&'r Model, &'r Field)> {
    let path = substitute_related(registry, model, path)?;
    let (prefix, leaf) = split_path(&path);
    let mut current = model;
    for segment in prefix {
        let field = known_field(current, segment)?;
        current = comodel_of(registry, current, field)?;
    }
    Ok((current, known_field(current, leaf)?))
}

pub(crate) fn known_field<'m>(model: &'m Model, name: &str) -> CoreResult<&'m Field> {
    model.field(name).ok_or_else(|| {
        CoreError::invariant(format!("unknown field `{name}` on {}", model.name()))
    })
}

pub(crate) fn comodel_of<'r>(
    registry: &'r Registry,
    model: &Model,
    field: &Field,
) -> CoreResult<&'r Model> {
    let name = field.field_type().comodel().ok_or_else(|| {
        CoreError::invariant(format!(
            "field `{}` on {} is not a relation",
            field.name(),
            model.name()
        ))
    })?;
    registry.model(name)
}

/// Compiles `cond` against `model` into a single-table SQL condition.
pub fn compile_condition(
    registry: &Registry,
    model: &Model,
    cond: &Condition,
    context: &Context,
) -> CoreResult<SqlCondition> {
    match cond {
        Condition::And(items) => {
            let compiled = compile_all(registry, model, items, context)?;
            Ok(match compiled.len() {
                0 => SqlCondition::True,
                _ => SqlCondition::And(compiled),
            })
        }
        Condition::Or(items) => {
            let compiled = compile_all(registry, model, items, context)?;
            Ok(match compiled.len() {
                0 => SqlCondition::True,
                _ => SqlCondition::Or(compiled),
            })
        }
        Condition::Not(inner) => Ok(SqlCondition::Not(Box::new(compile_condition(
            registry, model, inner, context,
        )?))),
        Condition::Predicate {
            path,
            operator,
            value,
        } => {
            let path = substitute_related(registry, model, path)?;
            let segments: Vec<&str> = path.split('.').collect();
            compile_predicate(registry, model, &segments, *operator, value, context)
        }
    }
}

fn compile_all(
    registry: &Registry,
    model: &Model,
    items: &[Condition],
    context: &Context,
) -> CoreResult<Vec<SqlCondition>> {
    items
        .iter()
        .filter(|item| !item.is_empty())
        .map(|item| compile_condition(registry, model, item, context))
        .collect()
}

fn compare(column: &str, operator: Operator, value: &Value) -> SqlCondition {
    SqlCondition::Compare {
        column: column.to_string(),
        operator,
        value: value.clone(),
    }
}

fn in_select(column: &str, table: &str, select_column: &str, filter: SqlCondition) -> SqlCondition {
    SqlCondition::InSelect {
        column: column.to_string(),
        table: table.to_string(),
        select_column: select_column.to_string(),
        filter: Box::new(filter),
    }
}

fn compile_predicate(
    registry: &Registry,
    model: &Model,
    segments: &[&str],
    operator: Operator,
    value: &Value,
    context: &Context,
) -> CoreResult<SqlCondition> {
    let Some((head, rest)) = segments.split_first() else {
        return Err(CoreError::invariant("empty field path in condition"));
    };
    let field = known_field(model, head)?;

    if rest.is_empty() {
        return compile_leaf(registry, model, field, operator, value, context);
    }

    let comodel = comodel_of(registry, model, field)?;
    let inner = compile_predicate(registry, comodel, rest, operator, value, context)?;
    Ok(hop(comodel, field, inner))
}

/// Wraps a condition on `comodel` rows into a condition on `model` rows
/// reached through `field`.
fn hop(comodel: &Model, field: &Field, inner: SqlCondition) -> SqlCondition {
    match field.field_type() {
        FieldType::One2Many { reverse_fk, .. } | FieldType::Rev2One { reverse_fk, .. } => {
            in_select("id", comodel.table(), reverse_fk, inner)
        }
        FieldType::Many2Many { .. } => match field.link_table() {
            Some(link) => in_select(
                "id",
                &link.table,
                &link.our_column,
                in_select(&link.their_column, comodel.table(), "id", inner),
            ),
            None => SqlCondition::Compare {
                column: "id".to_string(),
                operator: Operator::In,
                value: Value::Ids(Vec::new()),
            },
        },
        _ => in_select(field.name(), comodel.table(), "id", inner),
    }
}

fn compile_leaf(
    registry: &Registry,
    model: &Model,
    field: &Field,
    operator: Operator,
    value: &Value,
    context: &Context,
) -> CoreResult<SqlCondition> {
    if field.is_computed() && !field.is_column() {
        return Err(CoreError::invariant(format!(
            "cannot search on non-stored computed field `{}` of {}",
            field.name(),
            model.name()
        )));
    }
    if field.is_contexted() {
        let (ctx_filter, _) = context_filter(model, field, context);
        let filter = compare("value", operator, value).and(ctx_filter);
        return Ok(in_select("id", &model.context_table(field.name()), "record_id", filter));
    }
    if !field.field_type().is_non_stored_relation() {
        return Ok(compare(field.name(), operator, value));
    }

    let comodel = comodel_of(registry, model, field)?;
    match operator {
        Operator::IsNull | Operator::IsNotNull => {
            let linked = hop(comodel, field, SqlCondition::True);
            Ok(if operator == Operator::IsNull {
                SqlCondition::Not(Box::new(linked))
            } else {
                linked
            })
        }
        _ => Ok(hop(comodel, field, compare("id", operator, value))),
    }
}

/// ORDER BY term for `order`; many-to-one hops become correlated subqueries.
pub fn order_expression(
    registry: &Registry,
    model: &Model,
    order: &OrderPredicate,
) -> CoreResult<String> {
    let path = substitute_related(registry, model, &order.field)?;
    let segments: Vec<&str> = path.split('.').collect();
    let expr = order_term(registry, model, &quote(model.table()), &segments, 1)?;
    Ok(format!("{expr} {}", if order.desc { "DESC" } else { "ASC" }))
}

fn order_term(
    registry: &Registry,
    model: &Model,
    alias: &str,
    segments: &[&str],
    depth: usize,
) -> CoreResult<String> {
    let Some((head, rest)) = segments.split_first() else {
        return Err(CoreError::invariant("empty order path"));
    };
    let field = known_field(model, head)?;
    if rest.is_empty() {
        if !field.is_column() {
            return Err(CoreError::invariant(format!(
                "cannot order {} by `{}`: not a stored column",
                model.name(),
                field.name()
            )));
        }
        return Ok(format!("{alias}.{}", quote(head)));
    }
    if !matches!(field.field_type(), FieldType::Many2One { .. }) {
        return Err(CoreError::invariant(format!(
            "cannot order {} through `{}`: only many2one hops are supported",
            model.name(),
            field.name()
        )));
    }
    let comodel = comodel_of(registry, model, field)?;
    let inner_alias = format!("\"t{depth}\"");
    let inner = order_term(registry, comodel, &inner_alias, rest, depth + 1)?;
    Ok(format!(
        "(SELECT {inner} FROM {} AS {inner_alias} WHERE {inner_alias}.\"id\" = {alias}.{})",
        quote(comodel.table()),
        quote(head)
    ))
}

/// GROUP BY column of a local stored field.
pub fn group_column(model: &Model, field: &str) -> CoreResult<String> {
    let descriptor = known_field(model, field)?;
    if !descriptor.is_column() {
        return Err(CoreError::invariant(format!(
            "cannot group {} by `{field}`: not a stored column",
            model.name()
        )));
    }
    Ok(quote(field))
}

/// Rebuilds the context condition and context orders of `query` for the
/// contexted fields of `model`.
///
/// Each context key contributes `<field>.<key> IS NULL OR <field>.<key> = v`
/// when the context sets it, and `<field>.<key> IS NULL` otherwise or when
/// `default_contexts` is set.
pub fn apply_contexts(query: &mut Query, model: &Model, context: &Context) {
    let default_only = context.is_true("default_contexts");
    let mut ctx_cond = Condition::new();
    let mut ctx_orders = Vec::new();
    for field in model.fields().filter(|field| field.is_contexted()) {
        for key in field.context_keys() {
            let path = format!("{}.{key}", field.name());
            let current = context.get(key).filter(|value| !value.is_null());
            let cond = match current {
                Some(value) if !default_only => Condition::field(path.as_str())
                    .is_null()
                    .or(Condition::field(path.as_str()).equals(value.to_string())),
                _ => Condition::field(path.as_str()).is_null(),
            };
            ctx_cond = ctx_cond.and(cond);
            ctx_orders.push(OrderPredicate::desc(path));
        }
    }
    query.ctx_cond = ctx_cond;
    query.ctx_orders = ctx_orders;
}

/// Side-table filter and ORDER BY terms of one contexted field, taken from
/// the context condition of `query`.
pub fn context_filter_for(query: &Query, field: &str) -> (SqlCondition, Vec<String>) {
    let prefix = format!("{field}.");
    let mut filter = SqlCondition::True;
    for conjunct in query.ctx_cond.conjuncts() {
        if conjunct.paths().iter().all(|path| path.starts_with(&prefix)) {
            let local = conjunct.map_paths(&|path: &str| path[prefix.len()..].to_string());
            filter = filter.and(side_condition(&local));
        }
    }
    let orders = query
        .ctx_orders
        .iter()
        .filter_map(|order| order.field.strip_prefix(&prefix))
        .map(|key| format!("({} IS NULL) DESC", quote(key)))
        .collect();
    (filter, orders)
}

fn context_filter(model: &Model, field: &Field, context: &Context) -> (SqlCondition, Vec<String>) {
    let mut query = Query::new();
    apply_contexts(&mut query, model, context);
    context_filter_for(&query, field.name())
}

fn side_condition(cond: &Condition) -> SqlCondition {
    match cond {
        Condition::And(items) => SqlCondition::And(items.iter().map(side_condition).collect()),
        Condition::Or(items) => SqlCondition::Or(items.iter().map(side_condition).collect()),
        Condition::Not(inner) => SqlCondition::Not(Box::new(side_condition(inner))),
        Condition::Predicate {
            path,
            operator,
            value,
        } => compare(path, *operator, value),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        apply_contexts, compile_condition, context_filter_for, order_expression, resolve_field,
        split_path, substitute_related,
    };
    use crate::env::Context;
    use crate::error::CoreError;
    use crate::query::{Condition, OrderPredicate, Query};
    use crate::registry::field::{Field, FieldType};
    use crate::registry::model::Model;
    use crate::registry::Registry;
    use crate::value::Value;

    fn registry() -> Registry {
        let mut builder = Registry::builder();
        builder
            .register(
                Model::builder("Partner")
                    .field(Field::char("name"))
                    .field(Field::text("bio").contexted(&["lang"]))
                    .field(Field::one2many("sale_ids", "Sale", "partner_id"))
                    .field(Field::many2many("tag_ids", "Tag"))
                    .field(Field::integer("score").compute(&[], |_| Ok(Value::Integer(1)))),
            )
            .unwrap();
        builder
            .register(Model::builder("Tag").field(Field::char("name")))
            .unwrap();
        builder
            .register(
                Model::builder("Sale")
                    .field(Field::float("amount"))
                    .field(Field::many2one("partner_id", "Partner"))
                    .field(Field::related("partner_name", "partner_id.name")),
            )
            .unwrap();
        builder.seal().unwrap()
    }

    #[test]
    fn paths_split_into_hops_and_leaf() {
        assert_eq!(split_path("a.b.c"), (vec!["a", "b"], "c"));
        assert_eq!(split_path("name"), (Vec::<&str>::new(), "name"));
    }

    #[test]
    fn related_fields_are_substituted() {
        let registry = registry();
        let sale = registry.model("Sale").unwrap();
        assert_eq!(
            substitute_related(&registry, sale, "partner_name").unwrap(),
            "partner_id.name"
        );
        let (model, field) = resolve_field(&registry, sale, "partner_id.tag_ids.name").unwrap();
        assert_eq!(model.name(), "Tag");
        assert_eq!(field.field_type(), &FieldType::Char);
    }

    #[test]
    fn relation_hops_compile_to_subqueries() {
        let registry = registry();
        let sale = registry.model("Sale").unwrap();
        let cond = Condition::field("partner_name").equals("Acme");
        let (sql, args) = compile_condition(&registry, sale, &cond, &Context::new())
            .unwrap()
            .render();
        assert_eq!(
            sql,
            "\"partner_id\" IN (SELECT \"id\" FROM \"partner\" WHERE \"name\" = ?)"
        );
        assert_eq!(args, vec![Value::from("Acme")]);

        let partner = registry.model("Partner").unwrap();
        let cond = Condition::field("tag_ids.name").equals("vip");
        let (sql, _) = compile_condition(&registry, partner, &cond, &Context::new())
            .unwrap()
            .render();
        assert_eq!(
            sql,
            "\"id\" IN (SELECT \"partner_id\" FROM \"partner_tag_rel\" WHERE \"tag_id\" IN (SELECT \"id\" FROM \"tag\" WHERE \"name\" = ?))"
        );

        let cond = Condition::field("sale_ids").is_in(vec![4]);
        let (sql, _) = compile_condition(&registry, partner, &cond, &Context::new())
            .unwrap()
            .render();
        assert_eq!(
            sql,
            "\"id\" IN (SELECT \"partner_id\" FROM \"sale\" WHERE \"id\" IN (?))"
        );
    }

    #[test]
    fn non_stored_computed_fields_are_not_searchable() {
        let registry = registry();
        let partner = registry.model("Partner").unwrap();
        let cond = Condition::field("score").equals(1);
        assert!(matches!(
            compile_condition(&registry, partner, &cond, &Context::new()),
            Err(CoreError::Invariant(_))
        ));
    }

    #[test]
    fn contexted_leaves_search_the_side_table() {
        let registry = registry();
        let partner = registry.model("Partner").unwrap();
        let cond = Condition::field("bio").contains("rust");
        let context = Context::new().with("lang", "fr");
        let (sql, args) = compile_condition(&registry, partner, &cond, &context)
            .unwrap()
            .render();
        assert_eq!(
            sql,
            "\"id\" IN (SELECT \"record_id\" FROM \"partner__bio_ctx\" WHERE \"value\" LIKE ? AND (\"lang\" IS NULL OR \"lang\" = ?))"
        );
        assert_eq!(args, vec![Value::from("%rust%"), Value::from("fr")]);
    }

    #[test]
    fn context_orders_put_exact_rows_last() {
        let registry = registry();
        let partner = registry.model("Partner").unwrap();
        let mut query = Query::new();
        apply_contexts(&mut query, partner, &Context::new().with("lang", "fr"));
        let (filter, orders) = context_filter_for(&query, "bio");
        assert_eq!(filter.render().0, "\"lang\" IS NULL OR \"lang\" = ?");
        assert_eq!(orders, vec!["(\"lang\" IS NULL) DESC".to_string()]);

        apply_contexts(
            &mut query,
            partner,
            &Context::new().with("lang", "fr").with("default_contexts", true),
        );
        let (filter, _) = context_filter_for(&query, "bio");
        assert_eq!(filter.render().0, "\"lang\" IS NULL");
    }

    #[test]
    fn many2one_orders_use_correlated_subqueries() {
        let registry = registry();
        let sale = registry.model("Sale").unwrap();
        let expr = order_expression(&registry, sale, &OrderPredicate::desc("partner_name")).unwrap();
        assert_eq!(
            expr,
            "(SELECT \"t1\".\"name\" FROM \"partner\" AS \"t1\" WHERE \"t1\".\"id\" = \"sale\".\"partner_id\") DESC"
        );
        let partner = registry.model("Partner").unwrap();
        assert!(order_expression(&registry, partner, &OrderPredicate::asc("bio")).is_err());
    }
}
