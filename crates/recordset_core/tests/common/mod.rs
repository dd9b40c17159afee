#![allow(dead_code)]

use recordset_core::{
    open_db_in_memory, CoreError, Field, Model, OnDelete, Registry, Value,
};
use rusqlite::Connection;
use std::sync::Arc;

/// Partner / Sale / Tag registry shared by the integration tests.
pub fn registry() -> Arc<Registry> {
    let mut builder = Registry::builder();
    builder
        .register(
            Model::builder("Describable")
                .mixin()
                .field(Field::text("notes"))
                .method("describe", |call, _args| {
                    let name = call.records().get("name")?;
                    Ok(Value::Text(format!("record {name}")))
                }),
        )
        .unwrap();
    builder
        .register(
            Model::builder("Partner")
                .inherit("Describable")
                .order(&["name"])
                .field(Field::char("name").required())
                .field(Field::char("email").constraint("check_email"))
                .field(Field::text("description").contexted(&["lang"]))
                .field(Field::one2many("sale_ids", "Sale", "partner_id"))
                .field(Field::many2many("tag_ids", "Tag"))
                .field(Field::rev2one("profile_id", "Profile", "partner_id"))
                .field(
                    Field::float("total_sales")
                        .compute(&["sale_ids.amount"], |records| {
                            let sales = records.get("sale_ids")?.to_ids();
                            let sales = records.env().browse("Sale", &sales)?;
                            let mut total = 0.0;
                            for sale in sales.records()? {
                                total += sale.get("amount")?.as_f64().unwrap_or_default();
                            }
                            Ok(Value::Float(total))
                        })
                        .stored(),
                )
                .field(Field::integer("sale_count").compute(&["sale_ids"], |records| {
                    Ok(Value::Integer(records.get("sale_ids")?.to_ids().len() as i64))
                }))
                .method("check_email", |call, _args| {
                    let email = call.records().get("email")?;
                    match email.as_str() {
                        Some(email) if !email.is_empty() && !email.contains('@') => {
                            Err(CoreError::validation(format!("invalid email `{email}`")))
                        }
                        _ => Ok(Value::Null),
                    }
                })
                .method("describe", |call, args| {
                    let base = call.super_call(args)?;
                    Ok(Value::Text(format!("partner {base}")))
                }),
        )
        .unwrap();
    builder
        .register(
            Model::builder("Sale")
                .field(Field::char("name"))
                .field(
                    Field::float("amount")
                        .constraint("check_amount")
                        .default_value(0.0),
                )
                .field(Field::integer("quantity").default_value(1))
                .field(Field::many2one("partner_id", "Partner").on_delete(OnDelete::Cascade))
                .field(Field::related("partner_name", "partner_id.name"))
                .field(
                    Field::float("doubled")
                        .compute(&["amount"], |records| {
                            let amount = records.get("amount")?.as_f64().unwrap_or_default();
                            Ok(Value::Float(amount * 2.0))
                        })
                        .stored(),
                )
                .sql_constraint("sale_amount_limit", "\"amount\" < 1000000", "Amount is too large")
                .method("check_amount", |call, _args| {
                    let amount = call.records().get("amount")?.as_f64().unwrap_or_default();
                    if amount < 0.0 {
                        return Err(CoreError::validation("amount must not be negative"));
                    }
                    Ok(Value::Null)
                }),
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
            Model::builder("Profile")
                .field(Field::char("bio"))
                .field(Field::many2one("partner_id", "Partner").on_delete(OnDelete::Cascade)),
        )
        .unwrap();
    Arc::new(builder.seal().unwrap())
}

/// Registry plus a fresh in-memory database with every table installed.
pub fn setup() -> (Arc<Registry>, Connection) {
    let registry = registry();
    let conn = open_db_in_memory(&registry).unwrap();
    (registry, conn)
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
        row.get(0)
    })
    .unwrap()
}
