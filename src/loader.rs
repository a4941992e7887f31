use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use csv::{ReaderBuilder, Terminator, Trim};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::datapackage::{Bundle, FieldType, Resource, TableSchema};
use crate::session::quote_ident;

/// All sources contributing rows to one logical table. The first
/// contributor's schema governs columns and keys; later contributors
/// only add rows.
struct ResourceGroup {
    schema: TableSchema,
    sources: Vec<(PathBuf, Resource)>,
}

/// Materialize every resource of every bundle into the store. Resources
/// sharing a name are concatenated. Dialect patching mutates the bundle
/// descriptors in place before any rows are read.
pub fn load_bundles(conn: &Connection, bundles: &mut [Bundle]) -> Result<()> {
    let mut groups: Vec<(String, ResourceGroup)> = Vec::new();
    for bundle in bundles.iter_mut() {
        let base_dir = bundle.base_dir().to_path_buf();
        for resource in &mut bundle.descriptor.resources {
            resource.apply_format_patch();
            let source = (base_dir.join(&resource.path), resource.clone());
            match groups.iter_mut().find(|(name, _)| name == &resource.name) {
                Some((_, group)) => group.sources.push(source),
                None => groups.push((
                    resource.name.clone(),
                    ResourceGroup {
                        schema: resource.schema.clone(),
                        sources: vec![source],
                    },
                )),
            }
        }
    }

    for (name, group) in &groups {
        load_resource(conn, name, group)
            .with_context(|| format!("failed to load resource '{}'", name))?;
    }
    Ok(())
}

/// Create, fill, and index one table inside its own transaction, so a
/// failure here leaves previously loaded resources committed.
fn load_resource(conn: &Connection, name: &str, group: &ResourceGroup) -> Result<()> {
    let schema = &group.schema;
    let mut rows: Vec<Vec<SqlValue>> = Vec::new();
    for (path, resource) in &group.sources {
        let mut source_rows = read_rows(path, resource, schema)?;
        debug!(target: "loader", "read {} rows for '{}' from {:?}", source_rows.len(), name, path);
        rows.append(&mut source_rows);
    }
    let empty = rows.is_empty();

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
    tx.execute_batch(&create_table_sql(name, schema, empty))?;

    {
        let placeholders = vec!["?"; schema.fields.len()].join(", ");
        let columns = schema
            .fields
            .iter()
            .map(|f| quote_ident(&f.name))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(name),
            columns,
            placeholders
        );
        let mut stmt = tx.prepare(&insert_sql)?;
        for row in &rows {
            stmt.execute(rusqlite::params_from_iter(row.iter()))?;
        }
    }

    // Empty tables get neither a primary key nor indexes.
    if !empty {
        if let Some(pk) = schema.primary_key_fields() {
            tx.execute_batch(&create_index_sql(name, &pk))?;
        }
        for fk in &schema.foreign_keys {
            tx.execute_batch(&create_index_sql(name, &fk.fields.as_vec()))?;
        }
    }
    tx.commit()?;
    info!(target: "loader", "materialized table '{}' ({} rows)", name, rows.len());
    Ok(())
}

fn create_table_sql(name: &str, schema: &TableSchema, skip_pk: bool) -> String {
    let mut parts: Vec<String> = schema
        .fields
        .iter()
        .map(|f| format!("{} {}", quote_ident(&f.name), sql_type(f.field_type())))
        .collect();
    if !skip_pk {
        if let Some(pk) = schema.primary_key_fields() {
            let cols = pk.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
            parts.push(format!("PRIMARY KEY ({})", cols));
        }
    }
    format!("CREATE TABLE {} ({})", quote_ident(name), parts.join(", "))
}

fn create_index_sql(table: &str, fields: &[&str]) -> String {
    let index_name = format!("idx_{}_{}", table, fields.join("_"));
    let cols = fields.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&index_name),
        quote_ident(table),
        cols
    )
}

fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Integer | FieldType::Boolean => "INTEGER",
        FieldType::Number => "REAL",
        _ => "TEXT",
    }
}

/// Read one source file into coerced rows, schema field order. Any read
/// or coercion failure aborts the whole resource.
fn read_rows(path: &Path, resource: &Resource, schema: &TableSchema) -> Result<Vec<Vec<SqlValue>>> {
    let file =
        File::open(path).with_context(|| format!("failed to open resource file {:?}", path))?;
    let dialect = resource.dialect.clone().unwrap_or_default();

    let mut builder = ReaderBuilder::new();
    builder
        .has_headers(dialect.header)
        .delimiter(dialect.delimiter_byte())
        .double_quote(dialect.double_quote);
    if dialect.skip_initial_space {
        builder.trim(Trim::Fields);
    }
    match dialect.line_terminator.as_str() {
        // The reader's default terminator already covers both.
        "\n" | "\r\n" => {}
        other => {
            if let Some(&byte) = other.as_bytes().first() {
                builder.terminator(Terminator::Any(byte));
            }
        }
    }
    let mut reader = builder.from_reader(file);

    // Keyed access: map each schema field to its header position. With
    // no header row, fields bind by position.
    let positions: Vec<Option<usize>> = if dialect.header {
        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("failed to read header row of {:?}", path))?
            .iter()
            .map(|h| h.to_string())
            .collect();
        schema
            .fields
            .iter()
            .map(|f| headers.iter().position(|h| h == &f.name))
            .collect()
    } else {
        (0..schema.fields.len()).map(Some).collect()
    };

    let mut rows = Vec::new();
    for (record_idx, result) in reader.records().enumerate() {
        let record = result
            .with_context(|| format!("read error in {:?} at record {}", path, record_idx + 1))?;
        let mut values = Vec::with_capacity(schema.fields.len());
        for (field, position) in schema.fields.iter().zip(&positions) {
            let raw = position.and_then(|i| record.get(i)).unwrap_or("");
            let value = coerce_value(raw, field.field_type()).with_context(|| {
                format!(
                    "cannot coerce field '{}' value {:?} in {:?} at record {}",
                    field.name,
                    raw,
                    path,
                    record_idx + 1
                )
            })?;
            values.push(value);
        }
        rows.push(values);
    }
    Ok(rows)
}

/// Coerce one cell per its declared type. Empty cells are NULL for
/// every type.
fn coerce_value(raw: &str, field_type: FieldType) -> Result<SqlValue> {
    if raw.is_empty() {
        return Ok(SqlValue::Null);
    }
    Ok(match field_type {
        FieldType::String | FieldType::Any => SqlValue::Text(raw.to_string()),
        FieldType::Integer => SqlValue::Integer(
            raw.parse::<i64>()
                .with_context(|| format!("not an integer: {:?}", raw))?,
        ),
        FieldType::Number => SqlValue::Real(
            raw.parse::<f64>()
                .with_context(|| format!("not a number: {:?}", raw))?,
        ),
        FieldType::Boolean => SqlValue::Integer(parse_bool(raw)? as i64),
        FieldType::Datetime => SqlValue::Text(parse_datetime(raw)?.to_rfc3339()),
        FieldType::Array | FieldType::Object => {
            let value: serde_json::Value = serde_json::from_str(raw)
                .with_context(|| format!("not valid JSON: {:?}", raw))?;
            SqlValue::Text(serde_json::to_string(&value)?)
        }
    })
}

fn parse_bool(raw: &str) -> Result<bool> {
    if raw.eq_ignore_ascii_case("true") || raw == "1" || raw.eq_ignore_ascii_case("yes") {
        Ok(true)
    } else if raw.eq_ignore_ascii_case("false") || raw == "0" || raw.eq_ignore_ascii_case("no") {
        Ok(false)
    } else {
        bail!("not a boolean: {:?}", raw)
    }
}

/// Parse a datetime cell as a timezone-aware timestamp. Naive inputs
/// are taken as UTC.
fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
    }
    bail!("unrecognized datetime: {:?}", raw)
}
