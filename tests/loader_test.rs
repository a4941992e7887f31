use std::fs;
use std::path::Path;

use anyhow::Result;
use deriva_datapack::{create_offline_client, ClientOptions};
use rusqlite::Connection;
use tempfile::TempDir;

fn write_bundle(dir: &Path, descriptor: &str, files: &[(&str, &str)]) -> Result<()> {
    fs::write(dir.join("datapackage.json"), descriptor)?;
    for (name, contents) in files {
        fs::write(dir.join(name), contents)?;
    }
    Ok(())
}

fn options(cache: &TempDir) -> ClientOptions {
    ClientOptions::new().with_cachedir(cache.path())
}

/// Index names created by the loader for one table, excluding SQLite's
/// automatic primary-key indexes.
fn loader_indexes(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'index' AND tbl_name = ?1 AND name LIKE 'idx_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

fn index_columns(conn: &Connection, index: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_info(\"{}\")", index))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(2))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(columns)
}

const ITEM_DESCRIPTOR: &str = r#"{
    "name": "inventory",
    "resources": [{
        "name": "item",
        "path": "item.csv",
        "schema": {
            "fields": [
                {"name": "id", "type": "number"},
                {"name": "name", "type": "string"}
            ],
            "primaryKey": "id"
        }
    }]
}"#;

#[test]
fn test_two_row_resource_counts_and_entities() -> Result<()> {
    let bundle = TempDir::new()?;
    let cache = TempDir::new()?;
    write_bundle(bundle.path(), ITEM_DESCRIPTOR, &[("item.csv", "id,name\n1,Widget\n2,Gadget\n")])?;

    let client = create_offline_client(&[bundle.path()], options(&cache))?;
    let item = client.table("item").unwrap();
    assert_eq!(item.count()?, 2);

    let entities: Vec<_> = item.entities()?.collect();
    assert_eq!(entities.len(), 2);
    for record in &entities {
        assert!(record.contains_key("id"));
        assert!(record.contains_key("name"));
    }
    assert_eq!(entities[0]["id"], "1");
    assert_eq!(entities[0]["name"], "Widget");
    Ok(())
}

#[test]
fn test_primary_key_gets_exactly_one_index() -> Result<()> {
    let bundle = TempDir::new()?;
    let cache = TempDir::new()?;
    write_bundle(bundle.path(), ITEM_DESCRIPTOR, &[("item.csv", "id,name\n1,Widget\n")])?;

    let client = create_offline_client(&[bundle.path()], options(&cache))?;
    let conn = Connection::open(client.session().db_path())?;

    let indexes = loader_indexes(&conn, "item")?;
    assert_eq!(indexes, vec!["idx_item_id"]);
    assert_eq!(index_columns(&conn, "idx_item_id")?, vec!["id"]);
    Ok(())
}

#[test]
fn test_foreign_key_groups_each_get_an_index() -> Result<()> {
    let bundle = TempDir::new()?;
    let cache = TempDir::new()?;
    let descriptor = r#"{
        "resources": [{
            "name": "item",
            "path": "item.csv",
            "schema": {
                "fields": [
                    {"name": "id", "type": "number"},
                    {"name": "category_id", "type": "number"},
                    {"name": "site", "type": "string"},
                    {"name": "shelf", "type": "string"}
                ],
                "primaryKey": "id",
                "foreignKeys": [
                    {"fields": "category_id",
                     "reference": {"resource": "category", "fields": "id"}},
                    {"fields": ["site", "shelf"],
                     "reference": {"resource": "location", "fields": ["site", "shelf"]}}
                ]
            }
        }]
    }"#;
    write_bundle(
        bundle.path(),
        descriptor,
        &[("item.csv", "id,category_id,site,shelf\n1,2,north,a\n")],
    )?;

    let client = create_offline_client(&[bundle.path()], options(&cache))?;
    let conn = Connection::open(client.session().db_path())?;

    let indexes = loader_indexes(&conn, "item")?;
    assert_eq!(
        indexes,
        vec!["idx_item_category_id", "idx_item_id", "idx_item_site_shelf"]
    );
    assert_eq!(
        index_columns(&conn, "idx_item_site_shelf")?,
        vec!["site", "shelf"]
    );
    Ok(())
}

#[test]
fn test_same_name_resources_concatenate_across_bundles() -> Result<()> {
    let first = TempDir::new()?;
    let second = TempDir::new()?;
    let cache = TempDir::new()?;
    write_bundle(first.path(), ITEM_DESCRIPTOR, &[("item.csv", "id,name\n1,Widget\n2,Gadget\n")])?;
    write_bundle(
        second.path(),
        ITEM_DESCRIPTOR,
        &[("item.csv", "id,name\n3,Doohickey\n4,Sprocket\n5,Cog\n")],
    )?;

    let client = create_offline_client(&[first.path(), second.path()], options(&cache))?;
    assert_eq!(client.table("item").unwrap().count()?, 5);
    Ok(())
}

#[test]
fn test_empty_resource_creates_table_without_key_or_index() -> Result<()> {
    let bundle = TempDir::new()?;
    let cache = TempDir::new()?;
    write_bundle(bundle.path(), ITEM_DESCRIPTOR, &[("item.csv", "id,name\n")])?;

    let client = create_offline_client(&[bundle.path()], options(&cache))?;
    let item = client.table("item").unwrap();
    assert_eq!(item.count()?, 0);
    assert_eq!(item.entities()?.count(), 0);

    let conn = Connection::open(client.session().db_path())?;
    assert!(loader_indexes(&conn, "item")?.is_empty());

    // Declared columns exist, none marked as primary key.
    let mut stmt = conn.prepare("PRAGMA table_info(item)")?;
    let info = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    assert_eq!(info.len(), 2);
    assert!(info.iter().all(|(_, pk)| *pk == 0));
    Ok(())
}

#[test]
fn test_tsv_resource_without_dialect_reads_tab_separated() -> Result<()> {
    let bundle = TempDir::new()?;
    let cache = TempDir::new()?;
    // The declared format does not matter: the injected TSV dialect
    // drives the reader.
    let descriptor = r#"{
        "resources": [{
            "name": "item",
            "path": "item.tsv",
            "format": "csv",
            "schema": {
                "fields": [
                    {"name": "id", "type": "number"},
                    {"name": "name", "type": "string"}
                ],
                "primaryKey": "id"
            }
        }]
    }"#;
    write_bundle(
        bundle.path(),
        descriptor,
        &[("item.tsv", "id\tname\n1\tWidget\n2\tGadget, the second\n")],
    )?;

    let client = create_offline_client(&[bundle.path()], options(&cache))?;
    let item = client.table("item").unwrap();
    assert_eq!(item.count()?, 2);

    let entities: Vec<_> = item.entities()?.collect();
    assert_eq!(entities[1]["name"], "Gadget, the second");
    Ok(())
}

#[test]
fn test_datetime_and_array_coercion() -> Result<()> {
    let bundle = TempDir::new()?;
    let cache = TempDir::new()?;
    let descriptor = r#"{
        "resources": [{
            "name": "event",
            "path": "event.csv",
            "schema": {
                "fields": [
                    {"name": "id", "type": "integer"},
                    {"name": "at", "type": "datetime"},
                    {"name": "tags", "type": "array"}
                ],
                "primaryKey": "id"
            }
        }]
    }"#;
    write_bundle(
        bundle.path(),
        descriptor,
        &[("event.csv", "id,at,tags\n1,2024-01-02 03:04:05,\"[1, 2]\"\n")],
    )?;

    let client = create_offline_client(&[bundle.path()], options(&cache))?;
    let entities: Vec<_> = client.table("event").unwrap().entities()?.collect();
    assert_eq!(entities[0]["at"], "2024-01-02T03:04:05+00:00");
    assert_eq!(entities[0]["tags"], "[1,2]");
    Ok(())
}

#[test]
fn test_failing_resource_aborts_but_keeps_earlier_tables() -> Result<()> {
    let bundle = TempDir::new()?;
    let cache = TempDir::new()?;
    let descriptor = r#"{
        "resources": [
            {"name": "alpha", "path": "alpha.csv",
             "schema": {"fields": [{"name": "id", "type": "number"}],
                        "primaryKey": "id"}},
            {"name": "beta", "path": "beta.csv",
             "schema": {"fields": [{"name": "id", "type": "number"}],
                        "primaryKey": "id"}}
        ]
    }"#;
    write_bundle(
        bundle.path(),
        descriptor,
        &[("alpha.csv", "id\n1\n"), ("beta.csv", "id\nnot-a-number\n")],
    )?;

    let err = create_offline_client(&[bundle.path()], options(&cache)).unwrap_err();
    assert!(err.to_string().contains("beta"), "unexpected error: {err:#}");

    // Each resource commits independently; alpha survived.
    let conn = Connection::open(cache.path().join(deriva_datapack::session::DATABASE_FILE))?;
    let alpha_rows: i64 = conn.query_row("SELECT COUNT(*) FROM alpha", [], |row| row.get(0))?;
    assert_eq!(alpha_rows, 1);
    let beta_exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'beta'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(beta_exists, 0);
    Ok(())
}

#[test]
fn test_reload_replaces_existing_tables() -> Result<()> {
    let bundle = TempDir::new()?;
    let cache = TempDir::new()?;
    write_bundle(bundle.path(), ITEM_DESCRIPTOR, &[("item.csv", "id,name\n1,Widget\n2,Gadget\n")])?;
    let client = create_offline_client(&[bundle.path()], options(&cache))?;
    assert_eq!(client.table("item").unwrap().count()?, 2);
    drop(client);

    fs::write(bundle.path().join("item.csv"), "id,name\n9,Only\n")?;
    let client = create_offline_client(&[bundle.path()], options(&cache))?;
    assert_eq!(client.table("item").unwrap().count()?, 1);
    Ok(())
}
