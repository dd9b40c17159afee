//! Grouped aggregate queries.

use super::RecordCollection;
use crate::error::{CoreError, CoreResult};
use crate::logging::COLLECTION_TARGET;
use crate::query::sql::{quote, SelectQuery};
use crate::query::{Condition, OrderPredicate};
use crate::resolver::{
    compile_condition, group_column, known_field, order_expression, substitute_related,
};
use crate::security::Operation;
use crate::value::{FieldMap, Value};
use log::debug;
use std::time::Instant;

const COUNT_COLUMN: &str = "__count";
const SKIPPED_BY_DEFAULT: [&str; 3] = ["id", "create_uid", "write_uid"];

/// One group of an aggregate query.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAggregateRow {
    /// Group-by values followed by the aggregated numeric fields.
    pub values: FieldMap,
    /// Rows in the group.
    pub count: usize,
    /// Condition selecting exactly the rows of this group.
    pub condition: Condition,
}

impl<'e> RecordCollection<'e> {
    /// Aggregates `fields` over the groups set with `group_by`.
    ///
    /// Only numeric fields are aggregated, each with its declared group
    /// operator; an empty list aggregates every numeric field. Fields the
    /// query orders by are added to the grouping.
    pub fn aggregates(&self, fields: &[&str]) -> CoreResult<Vec<GroupAggregateRow>> {
        let started_at = Instant::now();
        let env = self.env;
        let model = self.model;
        if self.query.groups.is_empty() {
            return Err(CoreError::invariant(format!(
                "aggregates on {} require a group_by",
                model.name()
            )));
        }
        env.access()
            .check_permission(env.uid(), model.name(), Operation::Read)?;

        let (groups, orders) = self.fix_group_by_orders()?;
        let mut columns = Vec::new();
        let mut group_exprs = Vec::new();
        for group in &groups {
            let column = group_column(model, group)?;
            columns.push(column.clone());
            group_exprs.push(column);
        }

        let requested: Vec<String> = if fields.is_empty() {
            model
                .fields()
                .filter(|field| !SKIPPED_BY_DEFAULT.contains(&field.name()))
                .map(|field| field.name().to_string())
                .collect()
        } else {
            fields.iter().map(|field| field.to_string()).collect()
        };
        let mut aggregated = Vec::new();
        for name in &requested {
            let field = known_field(model, name)?;
            if !field.field_type().is_numeric() || !field.is_column() || groups.contains(name) {
                continue;
            }
            columns.push(format!(
                "{}({}) AS {}",
                field.group_operator.sql(),
                quote(name),
                quote(name)
            ));
            aggregated.push(field);
        }
        columns.push(format!("COUNT(1) AS {}", quote(COUNT_COLUMN)));

        let mut cond = self.query.cond.clone();
        if let Some(rule) = env.access().record_rule(env.uid(), model.name(), Operation::Read) {
            cond = cond.and(rule);
        }
        let filter = compile_condition(self.registry(), model, &cond, &self.context)?;
        let mut select = SelectQuery::new(model.table(), columns, filter);
        select.groups = group_exprs;
        for order in &orders {
            select
                .orders
                .push(order_expression(self.registry(), model, order)?);
        }
        select.limit = self.query.limit;
        select.offset = self.query.offset;
        let (sql, args) = select.to_sql();
        let rows = env.query(&sql, &args)?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = FieldMap::new();
            let mut condition = Condition::new();
            for group in &groups {
                let field = known_field(model, group)?;
                let raw = row.get(group.as_str()).cloned().unwrap_or(Value::Null);
                let value = field.field_type().decode(raw);
                condition = condition.and(if value.is_null() {
                    Condition::field(group.as_str()).is_null()
                } else {
                    Condition::field(group.as_str()).equals(value.clone())
                });
                values.insert(group.clone(), value);
            }
            for field in &aggregated {
                let raw = row.get(field.name()).cloned().unwrap_or(Value::Null);
                values.insert(field.name().to_string(), field.field_type().decode(raw));
            }
            let count = row
                .get(COUNT_COLUMN)
                .and_then(Value::as_i64)
                .and_then(|count| usize::try_from(count).ok())
                .unwrap_or_default();
            result.push(GroupAggregateRow {
                values,
                count,
                condition: condition.and(self.query.cond.clone()),
            });
        }

        debug!(
            target: COLLECTION_TARGET,
            "event=aggregates module=collection status=ok model={} groups={} rows={} duration_ms={}",
            model.name(),
            groups.join(","),
            result.len(),
            started_at.elapsed().as_millis()
        );
        Ok(result)
    }

    /// Grouping extended with every ordered field, and the ordering to use:
    /// the query's own, or the grouping itself.
    ///
    /// An order through a relation path groups by the many-to-one it starts
    /// from; the ordered value depends on that key only.
    fn fix_group_by_orders(&self) -> CoreResult<(Vec<String>, Vec<OrderPredicate>)> {
        let mut groups = self.query.groups.clone();
        for order in &self.query.orders {
            let path = substitute_related(self.registry(), self.model, &order.field)?;
            let head = path.split('.').next().unwrap_or(path.as_str()).to_string();
            if !groups.contains(&head) {
                groups.push(head);
            }
        }
        let orders = if self.query.orders.is_empty() {
            groups.iter().map(|group| OrderPredicate::asc(group.as_str())).collect()
        } else {
            self.query.orders.clone()
        };
        Ok((groups, orders))
    }
}
