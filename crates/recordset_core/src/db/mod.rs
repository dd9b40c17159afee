//! SQLite storage bootstrap and the storage driver seam.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the record layer.
//! - Install tables for every registered model before first use.
//! - Expose the four driver calls record collections are written against.
//!
//! # Invariants
//! - Arguments are always bound positionally; SQL text never embeds values.
//! - Core code must not read/write records before the schema is installed.

use crate::value::{FieldMap, Value};
use rusqlite::{params_from_iter, Connection};
use std::error::Error;
use std::fmt::{Display, Formatter};

mod open;
pub mod schema;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// Storage driver used by record collections.
///
/// Implementations run every call inside the ambient transaction of the
/// handle they wrap.
pub trait Storage {
    /// Runs a statement and returns the number of affected rows.
    fn execute(&self, sql: &str, args: &[Value]) -> DbResult<usize>;

    /// Runs a query and returns every row keyed by column name.
    fn query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<FieldMap>>;

    /// Returns the first column of the first row, if any.
    fn get(&self, sql: &str, args: &[Value]) -> DbResult<Option<Value>>;

    /// Returns the first column of every row.
    fn select(&self, sql: &str, args: &[Value]) -> DbResult<Vec<Value>>;
}

impl Storage for Connection {
    fn execute(&self, sql: &str, args: &[Value]) -> DbResult<usize> {
        let mut stmt = self.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(args.iter()))?)
    }

    fn query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<FieldMap>> {
        let mut stmt = self.prepare_cached(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = FieldMap::new();
            for (position, column) in columns.iter().enumerate() {
                values.insert(column.clone(), Value::from_sql_ref(row.get_ref(position)?));
            }
            result.push(values);
        }
        Ok(result)
    }

    fn get(&self, sql: &str, args: &[Value]) -> DbResult<Option<Value>> {
        let mut stmt = self.prepare_cached(sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        match rows.next()? {
            Some(row) => Ok(Some(Value::from_sql_ref(row.get_ref(0)?))),
            None => Ok(None),
        }
    }

    fn select(&self, sql: &str, args: &[Value]) -> DbResult<Vec<Value>> {
        let mut stmt = self.prepare_cached(sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            result.push(Value::from_sql_ref(row.get_ref(0)?));
        }
        Ok(result)
    }
}
