use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::debug;

/// File name of the materialized store inside the cache directory.
pub const DATABASE_FILE: &str = "datapackage.sqlite";

/// Double-quote an identifier for SQLite.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Reflected metadata for one materialized table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<String>,
}

/// Connection to the locally materialized database. All writes happen
/// during construction; everything afterwards is read-only.
#[derive(Debug)]
pub struct Session {
    conn: Connection,
    db_path: PathBuf,
    tables: BTreeMap<String, TableInfo>,
    progress: bool,
}

impl Session {
    /// Open (creating if needed) the store under `cachedir`.
    pub fn open<P: AsRef<Path>>(cachedir: P) -> Result<Self> {
        let cachedir = cachedir.as_ref();
        fs::create_dir_all(cachedir)
            .with_context(|| format!("failed to create cache directory {:?}", cachedir))?;
        let db_path = cachedir.join(DATABASE_FILE);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open database {:?}", db_path))?;
        Ok(Self {
            conn,
            db_path,
            tables: BTreeMap::new(),
            progress: false,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn progress_enabled(&self) -> bool {
        self.progress
    }

    pub(crate) fn set_progress(&mut self, progress: bool) {
        self.progress = progress;
    }

    /// Reflect the store's schema into per-table column metadata,
    /// discovering every materialized table.
    pub fn reflect(&mut self) -> Result<()> {
        let names: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut tables = BTreeMap::new();
        for name in names {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
            let columns: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<rusqlite::Result<_>>()?;
            debug!(target: "session", "reflected table '{}' ({} columns)", name, columns.len());
            tables.insert(name.clone(), TableInfo { name, columns });
        }
        self.tables = tables;
        Ok(())
    }

    /// All reflected tables, keyed by name.
    pub fn tables(&self) -> &BTreeMap<String, TableInfo> {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }
}
