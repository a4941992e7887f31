use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use crate::datapackage::Bundle;
use crate::loader;
use crate::query::TableHandle;
use crate::session::Session;

/// Construction options for the offline adapter.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub cachedir: PathBuf,
    pub progress: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cachedir: PathBuf::from(".cached"),
            progress: false,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cachedir(mut self, cachedir: impl Into<PathBuf>) -> Self {
        self.cachedir = cachedir.into();
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}

/// Offline adapter over one or more datapackages, materialized into a
/// local SQLite store at construction time. Table handles borrow the
/// session and are cheap to create per navigation step.
#[derive(Debug)]
pub struct OfflineClient {
    session: Session,
}

impl OfflineClient {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn table(&self, name: &str) -> Option<TableHandle<'_>> {
        self.session
            .table(name)
            .map(|info| TableHandle::new(&self.session, info))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.session.tables().keys().map(String::as_str).collect()
    }

    pub fn tables(&self) -> impl Iterator<Item = TableHandle<'_>> {
        self.session
            .tables()
            .values()
            .map(|info| TableHandle::new(&self.session, info))
    }
}

/// Build the offline adapter: open every bundle, materialize all
/// resources into the cache store, and reflect the result. Loading is
/// synchronous and replaces any prior materialization of the same
/// tables.
pub fn create_offline_client<P: AsRef<Path>>(
    paths: &[P],
    options: ClientOptions,
) -> Result<OfflineClient> {
    let mut bundles = paths
        .iter()
        .map(Bundle::open)
        .collect::<Result<Vec<_>>>()?;
    let mut session = Session::open(&options.cachedir)?;
    session.set_progress(options.progress);
    loader::load_bundles(session.connection(), &mut bundles)?;
    session.reflect()?;
    info!(target: "client", "offline client ready ({} tables)", session.tables().len());
    Ok(OfflineClient { session })
}
