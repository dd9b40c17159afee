//! Table installation for registered models.
//!
//! # Responsibility
//! - Render `CREATE TABLE` statements for model tables, many-to-many link
//!   tables and contexted-value side tables.
//!
//! # Invariants
//! - Installation is idempotent (`IF NOT EXISTS`); existing tables are never
//!   altered.
//! - Link and side tables cascade on deletion of their owning records.

use crate::db::DbResult;
use crate::query::sql::quote;
use crate::registry::field::FieldType;
use crate::registry::model::Model;
use crate::registry::Registry;
use rusqlite::Connection;
use std::collections::BTreeMap;

/// Installs missing tables for every model of `registry` atomically.
pub fn install_schema(conn: &mut Connection, registry: &Registry) -> DbResult<()> {
    let tx = conn.transaction()?;
    for statement in schema_statements(registry) {
        tx.execute_batch(&statement)?;
    }
    tx.commit()?;
    Ok(())
}

/// All DDL statements, model tables first.
pub fn schema_statements(registry: &Registry) -> Vec<String> {
    let mut statements = Vec::new();
    let mut links = BTreeMap::new();
    for model in registry.models() {
        statements.push(model_table(registry, model));
        for field in model.fields() {
            if field.is_contexted() {
                statements.push(context_table(
                    model,
                    field.name(),
                    field.context_keys(),
                    field.field_type().sql_type(),
                ));
            }
            if let (FieldType::Many2Many { comodel }, Some(link)) =
                (field.field_type(), field.link_table())
            {
                let their_table = registry
                    .get(comodel)
                    .map_or_else(|| comodel.clone(), |target| target.table().to_string());
                links.entry(link.table.clone()).or_insert_with(|| {
                    format!(
                        "CREATE TABLE IF NOT EXISTS {table} (\n    {ours} INTEGER NOT NULL REFERENCES {our_table}(\"id\") ON DELETE CASCADE,\n    {theirs} INTEGER NOT NULL REFERENCES {their_table}(\"id\") ON DELETE CASCADE,\n    PRIMARY KEY ({ours}, {theirs})\n);",
                        table = quote(&link.table),
                        ours = quote(&link.our_column),
                        theirs = quote(&link.their_column),
                        our_table = quote(model.table()),
                        their_table = quote(&their_table),
                    )
                });
            }
        }
    }
    statements.extend(links.into_values());
    statements
}

fn model_table(registry: &Registry, model: &Model) -> String {
    let mut columns = vec!["\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
    for field in model.fields().filter(|field| field.is_column() && field.name() != "id") {
        let mut column = format!("{} {}", quote(field.name()), field.field_type().sql_type());
        if field.required {
            column.push_str(" NOT NULL");
        }
        if field.name() == "external_id" {
            column.push_str(" UNIQUE");
        }
        if let FieldType::Many2One { comodel } = field.field_type() {
            if let Some(target) = registry.get(comodel) {
                column.push_str(&format!(
                    " REFERENCES {}(\"id\") ON DELETE {}",
                    quote(target.table()),
                    field.on_delete.sql()
                ));
            }
        }
        columns.push(column);
    }
    for constraint in model.sql_constraints() {
        columns.push(format!(
            "CONSTRAINT {} CHECK ({})",
            quote(&constraint.name),
            constraint.check
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
        quote(model.table()),
        columns.join(",\n    ")
    )
}

fn context_table(model: &Model, field: &str, keys: &[String], sql_type: &str) -> String {
    let mut columns = vec![
        "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        format!(
            "\"record_id\" INTEGER NOT NULL REFERENCES {}(\"id\") ON DELETE CASCADE",
            quote(model.table())
        ),
    ];
    columns.extend(keys.iter().map(|key| format!("{} TEXT", quote(key))));
    columns.push(format!("\"value\" {sql_type}"));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
        quote(&model.context_table(field)),
        columns.join(",\n    ")
    )
}

#[cfg(test)]
mod tests {
    use super::schema_statements;
    use crate::registry::field::Field;
    use crate::registry::model::Model;
    use crate::registry::{OnDelete, Registry};

    fn registry() -> Registry {
        let mut builder = Registry::builder();
        builder
            .register(
                Model::builder("Partner")
                    .field(Field::char("name").required())
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
        builder
            .register(
                Model::builder("Sale")
                    .field(Field::many2one("partner_id", "Partner").on_delete(OnDelete::Cascade))
                    .field(Field::float("amount"))
                    .sql_constraint("sale_amount_limit", "\"amount\" < 1000000", "too large"),
            )
            .unwrap();
        builder.seal().unwrap()
    }

    #[test]
    fn model_tables_carry_foreign_keys_and_checks() {
        let statements = schema_statements(&registry());
        let sale = statements
            .iter()
            .find(|sql| sql.contains("EXISTS \"sale\""))
            .unwrap();
        assert!(sale.contains("\"partner_id\" INTEGER REFERENCES \"partner\"(\"id\") ON DELETE CASCADE"));
        assert!(sale.contains("CONSTRAINT \"sale_amount_limit\" CHECK (\"amount\" < 1000000)"));

        let partner = statements
            .iter()
            .find(|sql| sql.contains("EXISTS \"partner\" "))
            .unwrap();
        assert!(partner.contains("\"name\" TEXT NOT NULL"));
        assert!(!partner.contains("\"bio\""));
        assert!(!partner.contains("\"tag_ids\""));
    }

    #[test]
    fn shared_link_tables_are_created_once() {
        let statements = schema_statements(&registry());
        let links: Vec<_> = statements
            .iter()
            .filter(|sql| sql.contains("\"partner_tag_rel\""))
            .collect();
        assert_eq!(links.len(), 1);
        assert!(statements
            .iter()
            .any(|sql| sql.contains("\"partner__bio_ctx\"") && sql.contains("\"lang\" TEXT")));
    }

    #[test]
    fn statements_execute_on_sqlite() {
        let registry = registry();
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        super::install_schema(&mut conn, &registry).unwrap();
        super::install_schema(&mut conn, &registry).unwrap();
    }
}
