//! SQL statement builders over literal columns of one table.
//!
//! # Responsibility
//! - Render resolved conditions to a WHERE clause plus positional arguments.
//! - Build select, count, grouped, insert, update and delete statements.
//!
//! # Invariants
//! - Identifiers are always double-quoted; values are always bound.
//! - Cross-table access only appears as nested `IN (SELECT ...)` filters.

use crate::query::Operator;
use crate::value::{FieldMap, Value};

/// Quotes an SQL identifier.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Condition over columns of a single table.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlCondition {
    True,
    And(Vec<SqlCondition>),
    Or(Vec<SqlCondition>),
    Not(Box<SqlCondition>),
    Compare {
        column: String,
        operator: Operator,
        value: Value,
    },
    /// `column IN (SELECT select_column FROM table WHERE filter)`.
    InSelect {
        column: String,
        table: String,
        select_column: String,
        filter: Box<SqlCondition>,
    },
}

impl SqlCondition {
    pub fn and(self, other: SqlCondition) -> SqlCondition {
        match (self, other) {
            (Self::True, other) => other,
            (current, Self::True) => current,
            (Self::And(mut items), other) => {
                items.push(other);
                Self::And(items)
            }
            (current, other) => Self::And(vec![current, other]),
        }
    }

    pub fn render(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut args = Vec::new();
        self.write(&mut sql, &mut args, false);
        (sql, args)
    }

    fn write(&self, sql: &mut String, args: &mut Vec<Value>, nested: bool) {
        match self {
            Self::True => sql.push_str("1 = 1"),
            Self::And(items) => write_joined(items, " AND ", sql, args, nested),
            Self::Or(items) => write_joined(items, " OR ", sql, args, nested),
            Self::Not(inner) => {
                sql.push_str("NOT (");
                inner.write(sql, args, false);
                sql.push(')');
            }
            Self::Compare {
                column,
                operator,
                value,
            } => write_compare(&quote(column), *operator, value, sql, args),
            Self::InSelect {
                column,
                table,
                select_column,
                filter,
            } => {
                sql.push_str(&format!(
                    "{} IN (SELECT {} FROM {} WHERE ",
                    quote(column),
                    quote(select_column),
                    quote(table)
                ));
                filter.write(sql, args, false);
                sql.push(')');
            }
        }
    }
}

fn write_joined(
    items: &[SqlCondition],
    separator: &str,
    sql: &mut String,
    args: &mut Vec<Value>,
    nested: bool,
) {
    match items {
        [] => sql.push_str("1 = 1"),
        [single] => single.write(sql, args, nested),
        _ => {
            if nested {
                sql.push('(');
            }
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    sql.push_str(separator);
                }
                item.write(sql, args, true);
            }
            if nested {
                sql.push(')');
            }
        }
    }
}

fn write_compare(
    column: &str,
    operator: Operator,
    value: &Value,
    sql: &mut String,
    args: &mut Vec<Value>,
) {
    match (operator, value) {
        (Operator::IsNull, _) | (Operator::Equals, Value::Null) => {
            sql.push_str(&format!("{column} IS NULL"));
        }
        (Operator::IsNotNull, _) | (Operator::NotEquals, Value::Null) => {
            sql.push_str(&format!("{column} IS NOT NULL"));
        }
        (Operator::Equals | Operator::In, Value::Ids(ids)) => write_id_list(column, "IN", ids, sql, args),
        (Operator::NotEquals | Operator::NotIn, Value::Ids(ids)) => {
            write_id_list(column, "NOT IN", ids, sql, args)
        }
        (Operator::In, value) => {
            sql.push_str(&format!("{column} = ?"));
            args.push(value.clone());
        }
        (Operator::NotIn, value) => {
            sql.push_str(&format!("{column} != ?"));
            args.push(value.clone());
        }
        (Operator::ILike, value) => {
            sql.push_str(&format!("LOWER({column}) LIKE LOWER(?)"));
            args.push(value.clone());
        }
        (Operator::Contains, value) => {
            sql.push_str(&format!("{column} LIKE ?"));
            args.push(Value::Text(format!("%{value}%")));
        }
        (operator, value) => {
            sql.push_str(&format!("{column} {} ?", operator.sql()));
            args.push(value.clone());
        }
    }
}

fn write_id_list(column: &str, keyword: &str, ids: &[i64], sql: &mut String, args: &mut Vec<Value>) {
    if ids.is_empty() {
        sql.push_str(if keyword == "IN" { "0 = 1" } else { "1 = 1" });
        return;
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    sql.push_str(&format!("{column} {keyword} ({placeholders})"));
    args.extend(ids.iter().map(|id| Value::Integer(*id)));
}

/// Plain or grouped SELECT over one table.
#[derive(Debug, Clone)]
pub struct SelectQuery<'a> {
    pub table: &'a str,
    /// Rendered select-list expressions.
    pub columns: Vec<String>,
    pub filter: SqlCondition,
    /// Rendered GROUP BY expressions.
    pub groups: Vec<String>,
    /// Rendered ORDER BY terms.
    pub orders: Vec<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl<'a> SelectQuery<'a> {
    pub fn new(table: &'a str, columns: Vec<String>, filter: SqlCondition) -> Self {
        Self {
            table,
            columns,
            filter,
            groups: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let (where_sql, args) = self.filter.render();
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {}",
            self.columns.join(", "),
            quote(self.table),
            where_sql
        );
        if !self.groups.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", self.groups.join(", ")));
        }
        if !self.orders.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.orders.join(", ")));
        }
        match (self.limit, self.offset) {
            (Some(limit), 0) => sql.push_str(&format!(" LIMIT {limit}")),
            (Some(limit), offset) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (None, 0) => {}
            (None, offset) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
        }
        (sql, args)
    }
}

pub fn count_query(table: &str, filter: &SqlCondition) -> (String, Vec<Value>) {
    let (where_sql, args) = filter.render();
    (
        format!("SELECT COUNT(*) FROM {} WHERE {}", quote(table), where_sql),
        args,
    )
}

/// INSERT returning the new row id.
pub fn insert_query(table: &str, values: &FieldMap) -> (String, Vec<Value>) {
    if values.is_empty() {
        return (
            format!("INSERT INTO {} DEFAULT VALUES RETURNING \"id\"", quote(table)),
            Vec::new(),
        );
    }
    let columns: Vec<String> = values.keys().map(|column| quote(column)).collect();
    let placeholders = vec!["?"; values.len()].join(", ");
    (
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING \"id\"",
            quote(table),
            columns.join(", "),
            placeholders
        ),
        values.values().cloned().collect(),
    )
}

pub fn update_query(table: &str, values: &FieldMap, ids: &[i64]) -> (String, Vec<Value>) {
    let assignments: Vec<String> = values
        .keys()
        .map(|column| format!("{} = ?", quote(column)))
        .collect();
    let mut args: Vec<Value> = values.values().cloned().collect();
    let mut where_sql = String::new();
    write_id_list("\"id\"", "IN", ids, &mut where_sql, &mut args);
    (
        format!(
            "UPDATE {} SET {} WHERE {}",
            quote(table),
            assignments.join(", "),
            where_sql
        ),
        args,
    )
}

pub fn delete_query(table: &str, ids: &[i64]) -> (String, Vec<Value>) {
    let mut args = Vec::new();
    let mut where_sql = String::new();
    write_id_list("\"id\"", "IN", ids, &mut where_sql, &mut args);
    (
        format!("DELETE FROM {} WHERE {}", quote(table), where_sql),
        args,
    )
}

#[cfg(test)]
mod tests {
    use super::{delete_query, insert_query, update_query, SelectQuery, SqlCondition};
    use crate::query::Operator;
    use crate::value::{FieldMap, Value};

    fn compare(column: &str, operator: Operator, value: Value) -> SqlCondition {
        SqlCondition::Compare {
            column: column.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn nested_disjunctions_are_parenthesized() {
        let filter = SqlCondition::And(vec![
            compare("dept", Operator::Equals, Value::from("A")),
            SqlCondition::Or(vec![
                compare("amount", Operator::Greater, Value::from(10)),
                compare("amount", Operator::IsNull, Value::Null),
            ]),
        ]);
        let (sql, args) = filter.render();
        assert_eq!(sql, "\"dept\" = ? AND (\"amount\" > ? OR \"amount\" IS NULL)");
        assert_eq!(args, vec![Value::from("A"), Value::from(10)]);
    }

    #[test]
    fn id_lists_expand_and_empty_lists_match_nothing() {
        let (sql, args) = compare("id", Operator::In, Value::Ids(vec![3, 5])).render();
        assert_eq!(sql, "\"id\" IN (?, ?)");
        assert_eq!(args.len(), 2);
        let (sql, _) = compare("id", Operator::In, Value::Ids(vec![])).render();
        assert_eq!(sql, "0 = 1");
    }

    #[test]
    fn subquery_filters_render_inline() {
        let filter = SqlCondition::InSelect {
            column: "partner_id".to_string(),
            table: "partner".to_string(),
            select_column: "id".to_string(),
            filter: Box::new(compare("name", Operator::Equals, Value::from("Acme"))),
        };
        let (sql, args) = filter.render();
        assert_eq!(
            sql,
            "\"partner_id\" IN (SELECT \"id\" FROM \"partner\" WHERE \"name\" = ?)"
        );
        assert_eq!(args, vec![Value::from("Acme")]);
    }

    #[test]
    fn select_with_offset_only_uses_unbounded_limit() {
        let mut query = SelectQuery::new("sale", vec!["\"id\"".to_string()], SqlCondition::True);
        query.offset = 2;
        let (sql, _) = query.to_sql();
        assert_eq!(sql, "SELECT \"id\" FROM \"sale\" WHERE 1 = 1 LIMIT -1 OFFSET 2");
    }

    #[test]
    fn write_statements_bind_values_in_key_order() {
        let mut values = FieldMap::new();
        values.insert("name".to_string(), Value::from("x"));
        values.insert("amount".to_string(), Value::from(2.5));

        let (sql, args) = insert_query("sale", &values);
        assert_eq!(
            sql,
            "INSERT INTO \"sale\" (\"amount\", \"name\") VALUES (?, ?) RETURNING \"id\""
        );
        assert_eq!(args, vec![Value::from(2.5), Value::from("x")]);

        let (sql, args) = update_query("sale", &values, &[4]);
        assert_eq!(
            sql,
            "UPDATE \"sale\" SET \"amount\" = ?, \"name\" = ? WHERE \"id\" IN (?)"
        );
        assert_eq!(args.len(), 3);

        let (sql, _) = delete_query("sale", &[1, 2]);
        assert_eq!(sql, "DELETE FROM \"sale\" WHERE \"id\" IN (?, ?)");
    }
}
