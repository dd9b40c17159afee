//! Accumulating filter state of a record collection.
//!
//! # Responsibility
//! - Model conditions, orderings, groupings and pagination as plain values.
//! - Stay copy-on-write: narrowing a collection clones its query.
//!
//! # Invariants
//! - Field references are dotted paths; they are resolved to columns by
//!   `resolver` before reaching the SQL builders in [`sql`].
//! - An empty query (no condition, no fetch-all flag) never loads rows.

pub mod sql;

use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;

static ORDER_EXPR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*([a-z][a-z0-9_]*(?:\.[a-z][a-z0-9_]*)*)(?:\s+(asc|desc))?\s*$")
        .expect("valid order expression regex")
});

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Greater,
    GreaterOrEqual,
    Lower,
    LowerOrEqual,
    Like,
    ILike,
    Contains,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Equals => "=",
            Self::NotEquals => "!=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::Lower => "<",
            Self::LowerOrEqual => "<=",
            Self::Like | Self::ILike | Self::Contains => "LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }
}

/// Condition tree over field paths.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Predicate {
        path: String,
        operator: Operator,
        value: Value,
    },
}

impl Default for Condition {
    fn default() -> Self {
        Self::And(Vec::new())
    }
}

impl Condition {
    /// Empty condition, matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(path: impl Into<String>) -> ConditionField {
        ConditionField { path: path.into() }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(items) | Self::Or(items) => items.iter().all(Condition::is_empty),
            Self::Not(inner) => inner.is_empty(),
            Self::Predicate { .. } => false,
        }
    }

    /// Conjunction; empty operands are dropped.
    pub fn and(self, other: Condition) -> Condition {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }
        match self {
            Self::And(mut items) => {
                items.push(other);
                Self::And(items)
            }
            current => Self::And(vec![current, other]),
        }
    }

    /// Disjunction. An empty side is treated as "no condition yet", so
    /// `Condition::new().or(c)` builds `c`.
    pub fn or(self, other: Condition) -> Condition {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }
        match self {
            Self::Or(mut items) => {
                items.push(other);
                Self::Or(items)
            }
            current => Self::Or(vec![current, other]),
        }
    }

    pub fn negate(self) -> Condition {
        if self.is_empty() {
            return self;
        }
        Self::Not(Box::new(self))
    }

    /// All predicate paths, in tree order.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        self.collect_paths(&mut paths);
        paths
    }

    fn collect_paths<'c>(&'c self, paths: &mut Vec<&'c str>) {
        match self {
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.collect_paths(paths);
                }
            }
            Self::Not(inner) => inner.collect_paths(paths),
            Self::Predicate { path, .. } => paths.push(path.as_str()),
        }
    }

    /// Rewrites every predicate path with `rewrite`.
    pub fn map_paths<F>(&self, rewrite: &F) -> Condition
    where
        F: Fn(&str) -> String,
    {
        match self {
            Self::And(items) => Self::And(items.iter().map(|item| item.map_paths(rewrite)).collect()),
            Self::Or(items) => Self::Or(items.iter().map(|item| item.map_paths(rewrite)).collect()),
            Self::Not(inner) => Self::Not(Box::new(inner.map_paths(rewrite))),
            Self::Predicate {
                path,
                operator,
                value,
            } => Self::Predicate {
                path: rewrite(path),
                operator: *operator,
                value: value.clone(),
            },
        }
    }

    /// Top-level conjuncts of this condition.
    pub fn conjuncts(&self) -> Vec<&Condition> {
        match self {
            Self::And(items) => items.iter().filter(|item| !item.is_empty()).collect(),
            other if other.is_empty() => Vec::new(),
            other => vec![other],
        }
    }
}

/// Predicate builder returned by [`Condition::field`].
#[derive(Debug, Clone)]
pub struct ConditionField {
    path: String,
}

impl ConditionField {
    fn predicate(self, operator: Operator, value: Value) -> Condition {
        Condition::Predicate {
            path: self.path,
            operator,
            value,
        }
    }

    pub fn equals(self, value: impl Into<Value>) -> Condition {
        self.predicate(Operator::Equals, value.into())
    }

    pub fn not_equals(self, value: impl Into<Value>) -> Condition {
        self.predicate(Operator::NotEquals, value.into())
    }

    pub fn greater(self, value: impl Into<Value>) -> Condition {
        self.predicate(Operator::Greater, value.into())
    }

    pub fn greater_or_equal(self, value: impl Into<Value>) -> Condition {
        self.predicate(Operator::GreaterOrEqual, value.into())
    }

    pub fn lower(self, value: impl Into<Value>) -> Condition {
        self.predicate(Operator::Lower, value.into())
    }

    pub fn lower_or_equal(self, value: impl Into<Value>) -> Condition {
        self.predicate(Operator::LowerOrEqual, value.into())
    }

    pub fn like(self, pattern: impl Into<String>) -> Condition {
        self.predicate(Operator::Like, Value::Text(pattern.into()))
    }

    pub fn ilike(self, pattern: impl Into<String>) -> Condition {
        self.predicate(Operator::ILike, Value::Text(pattern.into()))
    }

    /// Case-sensitive substring match.
    pub fn contains(self, needle: impl Into<String>) -> Condition {
        self.predicate(Operator::Contains, Value::Text(needle.into()))
    }

    pub fn is_in(self, ids: impl Into<Vec<i64>>) -> Condition {
        self.predicate(Operator::In, Value::Ids(ids.into()))
    }

    pub fn not_in(self, ids: impl Into<Vec<i64>>) -> Condition {
        self.predicate(Operator::NotIn, Value::Ids(ids.into()))
    }

    pub fn is_null(self) -> Condition {
        self.predicate(Operator::IsNull, Value::Null)
    }

    pub fn is_not_null(self) -> Condition {
        self.predicate(Operator::IsNotNull, Value::Null)
    }
}

/// One ORDER BY term on a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPredicate {
    pub field: String,
    pub desc: bool,
}

impl OrderPredicate {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            desc: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            desc: true,
        }
    }

    /// Parses `"path [asc|desc]"`.
    pub fn parse(expr: &str) -> Option<Self> {
        let captures = ORDER_EXPR_RE.captures(expr)?;
        let field = captures.get(1)?.as_str().to_string();
        let desc = captures
            .get(2)
            .is_some_and(|direction| direction.as_str().eq_ignore_ascii_case("desc"));
        Some(Self { field, desc })
    }
}

/// Filter specification carried by a record collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub(crate) cond: Condition,
    /// Per-context filters on `<field>.<context key>` paths.
    pub(crate) ctx_cond: Condition,
    pub(crate) orders: Vec<OrderPredicate>,
    pub(crate) ctx_orders: Vec<OrderPredicate>,
    pub(crate) groups: Vec<String>,
    pub(crate) limit: Option<usize>,
    pub(crate) offset: usize,
    pub(crate) fetch_all: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cond.is_empty() && !self.fetch_all
    }

    pub fn condition(&self) -> &Condition {
        &self.cond
    }

    pub fn context_condition(&self) -> &Condition {
        &self.ctx_cond
    }

    pub fn orders(&self) -> &[OrderPredicate] {
        &self.orders
    }

    pub fn context_orders(&self) -> &[OrderPredicate] {
        &self.ctx_orders
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_grouped(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Restricts the query to `ids`, clearing pagination.
    pub(crate) fn restrict_to_ids(&mut self, ids: &[i64]) {
        self.cond = Condition::field("id").is_in(ids.to_vec());
        self.fetch_all = false;
        self.limit = None;
        self.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{Condition, Operator, OrderPredicate, Query};
    use crate::value::Value;

    #[test]
    fn empty_operands_are_dropped() {
        let cond = Condition::new().and(Condition::field("name").equals("x"));
        assert!(matches!(
            cond,
            Condition::Predicate { ref path, operator: Operator::Equals, .. } if path == "name"
        ));
        assert!(Condition::new().and(Condition::new()).is_empty());
    }

    #[test]
    fn conjunctions_flatten() {
        let cond = Condition::field("a")
            .equals(1)
            .and(Condition::field("b").equals(2))
            .and(Condition::field("c").equals(3));
        assert_eq!(cond.conjuncts().len(), 3);
        assert_eq!(cond.paths(), vec!["a", "b", "c"]);
    }

    #[test]
    fn order_expressions_parse() {
        assert_eq!(
            OrderPredicate::parse("amount DESC"),
            Some(OrderPredicate::desc("amount"))
        );
        assert_eq!(
            OrderPredicate::parse(" partner_id.name "),
            Some(OrderPredicate::asc("partner_id.name"))
        );
        assert_eq!(OrderPredicate::parse("amount; DROP"), None);
    }

    #[test]
    fn queries_without_condition_are_empty() {
        let mut query = Query::new();
        assert!(query.is_empty());
        query.fetch_all = true;
        assert!(!query.is_empty());
        query.restrict_to_ids(&[3]);
        assert_eq!(
            query.cond,
            Condition::Predicate {
                path: "id".to_string(),
                operator: Operator::In,
                value: Value::Ids(vec![3]),
            }
        );
    }
}
