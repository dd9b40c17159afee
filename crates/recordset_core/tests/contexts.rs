mod common;

use recordset_core::{Condition, Context, Environment, RecordData, Value};

#[test]
fn contexted_values_fall_back_to_the_default_context() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(RecordData::new().set("name", "Acme").set("description", "Hello"))
        .unwrap();

    let french = acme.with_context("lang", "fr");
    assert_eq!(french.get("description").unwrap(), Value::from("Hello"));

    french.set("description", "Bonjour").unwrap();

    assert_eq!(french.get("description").unwrap(), Value::from("Bonjour"));
    assert_eq!(acme.get("description").unwrap(), Value::from("Hello"));
    let german = acme.with_context("lang", "de");
    assert_eq!(german.get("description").unwrap(), Value::from("Hello"));
    assert_eq!(common::count_rows(&conn, "partner__description_ctx"), 2);
}

#[test]
fn values_survive_a_fresh_environment_per_context() {
    let (registry, conn) = common::setup();
    let id = {
        let env = Environment::builder(registry.clone()).build(&conn);
        let acme = env
            .pool("Partner")
            .unwrap()
            .create(RecordData::new().set("name", "Acme").set("description", "Hello"))
            .unwrap();
        acme.with_context("lang", "fr")
            .set("description", "Bonjour")
            .unwrap();
        acme.ensure_one().unwrap()
    };

    let env = Environment::builder(registry)
        .context(Context::new().with("lang", "fr"))
        .build(&conn);
    let acme = env.browse("Partner", &[id]).unwrap();
    assert_eq!(acme.get("description").unwrap(), Value::from("Bonjour"));
}

#[test]
fn default_contexts_flag_reads_default_values() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let acme = env
        .pool("Partner")
        .unwrap()
        .create(RecordData::new().set("name", "Acme").set("description", "Hello"))
        .unwrap();
    let french = acme.with_context("lang", "fr");
    french.set("description", "Bonjour").unwrap();
    assert_eq!(french.get("description").unwrap(), Value::from("Bonjour"));

    let defaults = french.with_context("default_contexts", true);
    assert_eq!(defaults.get("description").unwrap(), Value::from("Hello"));
}

#[test]
fn first_write_in_a_context_seeds_the_default() {
    let (registry, conn) = common::setup();
    let french_env = Environment::builder(registry.clone())
        .context(Context::new().with("lang", "fr"))
        .build(&conn);
    let id = french_env
        .pool("Partner")
        .unwrap()
        .create(RecordData::new().set("name", "Acme").set("description", "Bonjour"))
        .unwrap()
        .ensure_one()
        .unwrap();

    let env = Environment::builder(registry).build(&conn);
    let acme = env.browse("Partner", &[id]).unwrap();
    assert_eq!(acme.get("description").unwrap(), Value::from("Bonjour"));
}

#[test]
fn search_matches_values_visible_in_the_context() {
    let (registry, conn) = common::setup();
    let env = Environment::builder(registry).build(&conn);
    let partners = env.pool("Partner").unwrap();
    let acme = partners
        .create(RecordData::new().set("name", "Acme").set("description", "Hello"))
        .unwrap();
    acme.with_context("lang", "fr")
        .set("description", "Bonjour")
        .unwrap();
    partners
        .create(RecordData::new().set("name", "Bolt").set("description", "Hi"))
        .unwrap();

    let bonjour = Condition::field("description").equals("Bonjour");
    assert_eq!(partners.search(bonjour.clone()).search_count().unwrap(), 0);
    let french = partners.with_context("lang", "fr").search(bonjour);
    assert_eq!(french.ids().unwrap(), acme.ids().unwrap());
}
