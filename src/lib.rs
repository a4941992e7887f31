pub mod client;
pub mod datapackage;
pub mod loader;
pub mod logging;
pub mod online;
pub mod query;
pub mod session;

pub use client::{create_offline_client, ClientOptions, OfflineClient};
pub use datapackage::{Bundle, Dialect, FieldType, Resource};
pub use online::create_online_client;
pub use query::{filter_any, ColumnHandle, Entities, JoinKind, Predicate, QueryHandle, TableHandle};
pub use session::Session;
