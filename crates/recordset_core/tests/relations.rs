mod common;

use recordset_core::{Condition, CoreError, Environment, RecordData, Value};
use rusqlite::Connection;

fn link_rowid(conn: &Connection, partner: i64, tag: i64) -> i64 {
    conn.query_row(
        "SELECT rowid FROM partner_tag_rel WHERE partner_id = ?1 AND tag_id = ?2",
        [partner, tag],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn many2many_sync_only_touches_changed_links() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let tags = env.pool("Tag").unwrap();
    let vip = tags.create(RecordData::new().set("name", "vip")).unwrap().ensure_one().unwrap();
    let new = tags.create(RecordData::new().set("name", "new")).unwrap().ensure_one().unwrap();
    let old = tags.create(RecordData::new().set("name", "old")).unwrap().ensure_one().unwrap();
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(RecordData::new().set("name", "Acme").set("tag_ids", vec![vip, old]))
        .unwrap();
    let acme_id = acme.ensure_one().unwrap();
    let vip_rowid = link_rowid(&conn, acme_id, vip);

    acme.set("tag_ids", vec![vip, new]).unwrap();

    assert_eq!(link_rowid(&conn, acme_id, vip), vip_rowid);
    assert_eq!(common::count_rows(&conn, "partner_tag_rel"), 2);
    let mut linked = acme.get("tag_ids").unwrap().to_ids();
    linked.sort_unstable();
    assert_eq!(linked, vec![vip, new]);
}

#[test]
fn many2many_links_are_visible_from_both_sides() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let vip = env
        .pool("Tag")
        .unwrap()
        .create(RecordData::new().set("name", "vip"))
        .unwrap();
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(RecordData::new().set("name", "Acme"))
        .unwrap();

    acme.set("tag_ids", vec![vip.ensure_one().unwrap()]).unwrap();

    assert_eq!(
        vip.get("partner_ids").unwrap(),
        Value::Ids(vec![acme.ensure_one().unwrap()])
    );
    vip.set("partner_ids", Vec::<i64>::new()).unwrap();
    assert_eq!(acme.get("tag_ids").unwrap(), Value::Ids(Vec::new()));
}

#[test]
fn one2many_assignment_moves_children() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(RecordData::new().set("name", "Acme"))
        .unwrap();
    let sales = env.pool("Sale").unwrap();
    let first = sales.create(RecordData::new().set("name", "S1")).unwrap();
    let second = sales.create(RecordData::new().set("name", "S2")).unwrap();
    let (first_id, second_id) = (first.ensure_one().unwrap(), second.ensure_one().unwrap());
    let acme_id = acme.ensure_one().unwrap();

    acme.set("sale_ids", vec![first_id, second_id]).unwrap();
    assert_eq!(first.get("partner_id").unwrap(), Value::Integer(acme_id));
    assert_eq!(acme.get("sale_ids").unwrap().to_ids().len(), 2);

    acme.set("sale_ids", vec![second_id]).unwrap();
    assert_eq!(first.get("partner_id").unwrap(), Value::Null);
    assert_eq!(second.get("partner_id").unwrap(), Value::Integer(acme_id));
    assert_eq!(acme.get("sale_ids").unwrap(), Value::Ids(vec![second_id]));

    acme.set("sale_ids", Vec::<i64>::new()).unwrap();
    assert_eq!(acme.get("sale_ids").unwrap(), Value::Ids(Vec::new()));
    assert_eq!(second.get("partner_id").unwrap(), Value::Null);
}

#[test]
fn moving_a_foreign_key_refreshes_parent_lists() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let partners = env.pool("Partner").unwrap();
    let acme = partners.create(RecordData::new().set("name", "Acme")).unwrap();
    let bolt = partners.create(RecordData::new().set("name", "Bolt")).unwrap();
    let sale = env
        .pool("Sale")
        .unwrap()
        .create(RecordData::new().set("name", "S1").set("partner_id", acme.ensure_one().unwrap()))
        .unwrap();
    assert_eq!(acme.get("sale_ids").unwrap().to_ids().len(), 1);

    sale.set("partner_id", bolt.ensure_one().unwrap()).unwrap();

    assert_eq!(acme.get("sale_ids").unwrap(), Value::Ids(Vec::new()));
    assert_eq!(bolt.get("sale_ids").unwrap(), Value::Ids(sale.ids().unwrap().to_vec()));
}

#[test]
fn nested_directives_create_and_link_records() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(
            RecordData::new()
                .set("name", "Acme")
                .create_related("sale_ids", RecordData::new().set("name", "S1").set("amount", 10.0))
                .create_related("sale_ids", RecordData::new().set("name", "S2").set("amount", 5.0))
                .create_related("tag_ids", RecordData::new().set("name", "vip")),
        )
        .unwrap();

    assert_eq!(acme.get("sale_ids").unwrap().to_ids().len(), 2);
    assert_eq!(acme.get("tag_ids").unwrap().to_ids().len(), 1);
    assert_eq!(common::count_rows(&conn, "sale"), 2);
    assert_eq!(common::count_rows(&conn, "partner_tag_rel"), 1);

    let sale = env
        .pool("Sale")
        .unwrap()
        .create(
            RecordData::new()
                .set("name", "S3")
                .create_related("partner_id", RecordData::new().set("name", "Fresh")),
        )
        .unwrap();
    assert_eq!(sale.get("partner_name").unwrap(), Value::from("Fresh"));
}

#[test]
fn related_fields_read_and_write_through() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(RecordData::new().set("name", "Acme"))
        .unwrap();
    let sale = env
        .pool("Sale")
        .unwrap()
        .create(RecordData::new().set("name", "S1").set("partner_id", acme.ensure_one().unwrap()))
        .unwrap();

    assert_eq!(sale.get("partner_name").unwrap(), Value::from("Acme"));
    assert_eq!(sale.get("partner_id.name").unwrap(), Value::from("Acme"));

    sale.set("partner_name", "Acme Corp").unwrap();
    assert_eq!(acme.get("name").unwrap(), Value::from("Acme Corp"));
}

#[test]
fn writing_a_related_field_without_target_creates_it() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let sale = env
        .pool("Sale")
        .unwrap()
        .create(RecordData::new().set("name", "Orphan"))
        .unwrap();
    assert_eq!(sale.get("partner_id").unwrap(), Value::Null);
    assert_eq!(sale.get("partner_name").unwrap(), Value::Text(String::new()));

    sale.set("partner_name", "New Co").unwrap();

    assert!(sale.get("partner_id").unwrap().as_i64().is_some());
    assert_eq!(sale.get("partner_name").unwrap(), Value::from("New Co"));
    assert_eq!(common::count_rows(&conn, "partner"), 1);
}

#[test]
fn reverse_one_fields_resolve_and_create_targets() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(RecordData::new().set("name", "Acme"))
        .unwrap();
    assert_eq!(acme.get("profile_id").unwrap(), Value::Null);

    acme.write(RecordData::new().set("profile_id.bio", "Since 1949"))
        .unwrap();

    let profile = acme.get("profile_id").unwrap();
    assert!(profile.as_i64().is_some());
    assert_eq!(acme.get("profile_id.bio").unwrap(), Value::from("Since 1949"));
    assert_eq!(common::count_rows(&conn, "profile"), 1);

    acme.write(RecordData::new().set("profile_id.bio", "Since 1950"))
        .unwrap();
    assert_eq!(acme.get("profile_id").unwrap(), profile);
    assert_eq!(common::count_rows(&conn, "profile"), 1);
}

#[test]
fn writing_through_a_to_many_path_is_rejected() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(RecordData::new().set("name", "Acme"))
        .unwrap();

    let err = acme
        .write(RecordData::new().set("sale_ids.name", "x"))
        .unwrap_err();
    assert!(matches!(err, CoreError::Invariant(_)));
}

#[test]
fn conditions_follow_relations() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let partners = env.pool("Partner").unwrap();
    let acme = partners
        .create(
            RecordData::new()
                .set("name", "Acme")
                .create_related("sale_ids", RecordData::new().set("name", "Big").set("amount", 500.0))
                .create_related("tag_ids", RecordData::new().set("name", "vip")),
        )
        .unwrap();
    partners
        .create(
            RecordData::new()
                .set("name", "Bolt")
                .create_related("sale_ids", RecordData::new().set("name", "Small").set("amount", 5.0)),
        )
        .unwrap();
    let sales = env.pool("Sale").unwrap();

    let acme_sales = sales.search(Condition::field("partner_id.name").equals("Acme"));
    assert_eq!(acme_sales.len().unwrap(), 1);
    assert_eq!(acme_sales.get("name").unwrap(), Value::from("Big"));

    let big_buyers = partners.search(Condition::field("sale_ids.amount").greater(100.0));
    assert_eq!(big_buyers.ids().unwrap(), acme.ids().unwrap());

    let vips = partners.search(Condition::field("tag_ids.name").equals("vip"));
    assert_eq!(vips.ids().unwrap(), acme.ids().unwrap());

    let by_related = sales.search(Condition::field("partner_name").equals("Bolt"));
    assert_eq!(by_related.get("name").unwrap(), Value::from("Small"));
}

#[test]
fn ordering_by_a_related_path() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let partners = env.pool("Partner").unwrap();
    let zed = partners.create(RecordData::new().set("name", "Zed")).unwrap();
    let abe = partners.create(RecordData::new().set("name", "Abe")).unwrap();
    let sales = env.pool("Sale").unwrap();
    let to_zed = sales
        .create(RecordData::new().set("name", "A").set("partner_id", zed.ensure_one().unwrap()))
        .unwrap()
        .ensure_one()
        .unwrap();
    let to_abe = sales
        .create(RecordData::new().set("name", "B").set("partner_id", abe.ensure_one().unwrap()))
        .unwrap()
        .ensure_one()
        .unwrap();

    let ordered = sales.search_all().order_by(&["partner_id.name"]).unwrap();
    assert_eq!(ordered.ids().unwrap(), &[to_abe, to_zed]);
    let reversed = sales.search_all().order_by(&["partner_id.name desc"]).unwrap();
    assert_eq!(reversed.ids().unwrap(), &[to_zed, to_abe]);
}

#[test]
fn unlinking_a_parent_cascades_to_children() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(
            RecordData::new()
                .set("name", "Acme")
                .create_related("sale_ids", RecordData::new().set("name", "S1"))
                .create_related("tag_ids", RecordData::new().set("name", "vip")),
        )
        .unwrap();
    let sale = env
        .pool("Sale")
        .unwrap()
        .search_all()
        .fetch()
        .unwrap();
    assert_eq!(sale.get("partner_name").unwrap(), Value::from("Acme"));

    assert_eq!(acme.unlink().unwrap(), 1);

    assert_eq!(common::count_rows(&conn, "sale"), 0);
    assert_eq!(common::count_rows(&conn, "partner_tag_rel"), 0);
    assert_eq!(common::count_rows(&conn, "tag"), 1);
    let tag = env.pool("Tag").unwrap().search_all().fetch().unwrap();
    assert_eq!(tag.get("partner_ids").unwrap(), Value::Ids(Vec::new()));
}
