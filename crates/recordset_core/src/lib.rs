//! Business-object persistence layer over SQLite.
//! Models are declared once in a sealed registry; record collections read
//! and write them through a per-request environment and its cache.

pub mod cache;
pub mod collection;
mod constraint;
pub mod data;
pub mod db;
pub mod env;
pub mod error;
pub mod i18n;
pub mod logging;
pub mod query;
pub mod registry;
mod relation;
pub mod resolver;
pub mod security;
pub mod value;

pub use collection::{GroupAggregateRow, RecordCollection};
pub use data::{ModelData, RecordData};
pub use db::{open_db, open_db_in_memory, DbError, DbResult, Storage};
pub use env::{with_transaction, Context, Environment, EnvironmentBuilder};
pub use error::{CoreError, CoreResult};
pub use i18n::{Catalog, Translate};
pub use logging::{
    default_log_level, init_logging, init_logging_with, logging_status, LoggingConfig, LoggingStatus,
};
pub use query::{Condition, Operator, OrderPredicate, Query};
pub use registry::field::{Field, FieldType, LinkTable};
pub use registry::model::{Model, ModelBuilder};
pub use registry::{GroupOperator, MethodCall, OnDelete, Registry, RegistryBuilder, RegistryError};
pub use security::{AccessControl, AccessPolicy, AllowAll, Operation, SUPERUSER_ID};
pub use value::{FieldMap, Value};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
