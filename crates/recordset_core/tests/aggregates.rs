mod common;

use recordset_core::{Condition, CoreError, Environment, RecordCollection, RecordData, Value};

fn seed<'e>(env: &'e Environment<'e>) -> (i64, i64, RecordCollection<'e>) {
    let partners = env.pool("Partner").unwrap();
    let acme = partners
        .create(RecordData::new().set("name", "Acme"))
        .unwrap()
        .ensure_one()
        .unwrap();
    let bolt = partners
        .create(RecordData::new().set("name", "Bolt"))
        .unwrap()
        .ensure_one()
        .unwrap();
    let sales = env.pool("Sale").unwrap();
    for (name, amount, partner) in [
        ("A1", 10.0, Some(acme)),
        ("A2", 20.0, Some(acme)),
        ("B1", 5.0, Some(bolt)),
        ("O1", 7.0, None),
    ] {
        let mut data = RecordData::new().set("name", name).set("amount", amount);
        if let Some(partner) = partner {
            data = data.set("partner_id", partner);
        }
        sales.create(data).unwrap();
    }
    (acme, bolt, sales)
}

#[test]
fn groups_sum_and_count_rows() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let (acme, bolt, sales) = seed(&env);

    let rows = sales
        .search_all()
        .group_by(&["partner_id"])
        .aggregates(&["amount"])
        .unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].values.get("partner_id"), Some(&Value::Null));
    assert_eq!(rows[0].values.get("amount"), Some(&Value::Float(7.0)));
    assert_eq!(rows[0].count, 1);
    assert_eq!(rows[1].values.get("partner_id"), Some(&Value::Integer(acme)));
    assert_eq!(rows[1].values.get("amount"), Some(&Value::Float(30.0)));
    assert_eq!(rows[1].count, 2);
    assert_eq!(rows[2].values.get("partner_id"), Some(&Value::Integer(bolt)));
    assert_eq!(rows[2].count, 1);
}

#[test]
fn group_conditions_select_the_group_rows() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let (_, _, sales) = seed(&env);

    let filtered = sales.search(Condition::field("amount").greater(6.0));
    let rows = filtered
        .group_by(&["partner_id"])
        .aggregates(&["amount"])
        .unwrap();

    assert_eq!(rows.len(), 2);
    for row in &rows {
        let members = sales.search(row.condition.clone());
        assert_eq!(members.search_count().unwrap(), row.count);
    }
}

#[test]
fn aggregates_without_grouping_are_rejected() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let (_, _, sales) = seed(&env);

    let err = sales.search_all().aggregates(&["amount"]).unwrap_err();
    assert!(matches!(err, CoreError::Invariant(_)));
}

#[test]
fn every_numeric_field_is_aggregated_by_default() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let (acme, _, sales) = seed(&env);

    let rows = sales
        .search(Condition::field("partner_id").equals(acme))
        .group_by(&["partner_id"])
        .aggregates(&[])
        .unwrap();

    assert_eq!(rows.len(), 1);
    let values = &rows[0].values;
    assert_eq!(values.get("amount"), Some(&Value::Float(30.0)));
    assert_eq!(values.get("doubled"), Some(&Value::Float(60.0)));
    assert_eq!(values.get("quantity"), Some(&Value::Integer(2)));
    assert!(values.get("name").is_none());
    assert!(values.get("id").is_none());
}

#[test]
fn explicit_ordering_drives_group_order() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let (acme, bolt, sales) = seed(&env);

    let rows = sales
        .search_all()
        .group_by(&["partner_id"])
        .order_by(&["partner_id desc"])
        .unwrap()
        .aggregates(&["amount"])
        .unwrap();

    let groups: Vec<Value> = rows
        .iter()
        .map(|row| row.values.get("partner_id").cloned().unwrap_or_default())
        .collect();
    assert_eq!(groups, vec![Value::Integer(bolt), Value::Integer(acme), Value::Null]);
}

#[test]
fn ordering_through_a_relation_groups_by_its_key() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let (acme, bolt, sales) = seed(&env);

    let rows = sales
        .search_all()
        .group_by(&["quantity"])
        .order_by(&["partner_id.name desc"])
        .unwrap()
        .aggregates(&["amount"])
        .unwrap();

    let groups: Vec<Value> = rows
        .iter()
        .map(|row| row.values.get("partner_id").cloned().unwrap_or_default())
        .collect();
    assert_eq!(groups, vec![Value::Integer(bolt), Value::Integer(acme), Value::Null]);
    assert_eq!(rows[1].values.get("quantity"), Some(&Value::Integer(1)));
    assert_eq!(rows[1].values.get("amount"), Some(&Value::Float(30.0)));
    assert_eq!(rows[1].count, 2);
}

#[test]
fn ordering_by_a_related_field_groups_by_its_relation() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let (acme, bolt, sales) = seed(&env);

    let rows = sales
        .search(Condition::field("partner_id").is_not_null())
        .group_by(&["partner_id"])
        .order_by(&["partner_name"])
        .unwrap()
        .aggregates(&["amount"])
        .unwrap();

    let groups: Vec<Value> = rows
        .iter()
        .map(|row| row.values.get("partner_id").cloned().unwrap_or_default())
        .collect();
    assert_eq!(groups, vec![Value::Integer(acme), Value::Integer(bolt)]);
}
