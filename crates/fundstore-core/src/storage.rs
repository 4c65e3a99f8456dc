use std::time::Duration;

use thiserror::Error;

use crate::{
    schema::{ColumnDef, ColumnInfo, IndexDef, TableDef, TableName},
    search::Filter,
    validate::ValidationReport,
    value::Value,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record type already registered: {0}")]
    DuplicateType(String),
    #[error("field {field} declared more than once on record type {record_type}")]
    DuplicateField { record_type: String, field: String },
    #[error("unknown record type: {0}")]
    UnknownType(String),
    #[error("field {field} is not a known field of record type {record_type}")]
    UnknownField { record_type: String, field: String },
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid key for record type {record_type}: {reason}")]
    InvalidKey { record_type: String, reason: String },
    #[error("field {field} of record type {record_type} references unknown record type {target}")]
    DanglingReference {
        record_type: String,
        field: String,
        target: String,
    },
    #[error("record type registry is sealed")]
    RegistrySealed,
    #[error("record type registry must be sealed before use")]
    RegistryNotSealed,
    #[error("invalid {record_type} record: {reason}")]
    InvalidRecord { record_type: String, reason: String },
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),
    #[error("failed to commit transaction: {0}")]
    Commit(String),
    #[error("failed to create schema {schema}: {source}")]
    SchemaCreation {
        schema: String,
        #[source]
        source: Box<StorageError>,
    },
    #[error("cannot add required column {table}.{column} without a default to a table that already has rows")]
    MissingDefault { table: String, column: String },
    #[error("schema deployment failed for record type {record_type}: {source}")]
    SchemaDeployment {
        record_type: String,
        #[source]
        source: Box<StorageError>,
    },
    #[error("schema validation failed:\n{0}")]
    SchemaValidation(ValidationReport),
    #[error("{0}")]
    Backend(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// True for failures a caller may retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::ConnectionUnavailable(_))
    }
}

/// Pool sizing shared by every backend that pools connections.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: u32,
    /// Upper bound on how long `begin_transaction` waits for a free connection.
    pub connection_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            connection_timeout: Duration::from_secs(2),
        }
    }
}

/// A database engine that can hand out transactions.
///
/// Implementations own their connection pool and must be safe for concurrent
/// `begin_transaction` calls. All names passed to the returned transaction are
/// already in physical form.
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn begin_transaction(&self) -> Result<Box<dyn BackendTransaction>, StorageError>;
}

/// One open transaction bound to exactly one connection.
///
/// Catalog methods mirror what a JDBC `DatabaseMetaData` offers; row methods
/// are the minimum the record store needs. `commit` must leave the transaction
/// rolled back when it fails, and both terminal methods must return the
/// connection to a clean state.
pub trait BackendTransaction: Send {
    fn schema_exists(&mut self, schema: &str) -> Result<bool, StorageError>;
    fn create_schema(&mut self, schema: &str) -> Result<(), StorageError>;
    fn tables(&mut self, schema: Option<&str>) -> Result<Vec<String>, StorageError>;
    fn columns(&mut self, table: &TableName) -> Result<Vec<ColumnInfo>, StorageError>;
    fn indexes(&mut self, table: &TableName) -> Result<Vec<String>, StorageError>;
    fn create_table(&mut self, table: &TableName, def: &TableDef) -> Result<(), StorageError>;
    fn add_column(&mut self, table: &TableName, column: &ColumnDef) -> Result<(), StorageError>;
    fn create_index(&mut self, table: &TableName, index: &IndexDef) -> Result<(), StorageError>;

    /// Inserts one row. When `returning` names an auto-increment column the
    /// backend assigns its value and returns it.
    fn insert_row(
        &mut self,
        table: &TableName,
        row: &[(ColumnDef, Value)],
        returning: Option<&ColumnDef>,
    ) -> Result<Option<Value>, StorageError>;
    fn update_rows(
        &mut self,
        table: &TableName,
        filter: &Filter,
        values: &[(ColumnDef, Value)],
    ) -> Result<u64, StorageError>;
    fn select_rows(
        &mut self,
        table: &TableName,
        columns: &[ColumnDef],
        filter: Option<&Filter>,
    ) -> Result<Vec<Vec<Value>>, StorageError>;
    fn count_rows(&mut self, table: &TableName) -> Result<u64, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::SchemaDeployment {
            record_type: "account_code".to_string(),
            source: Box::new(StorageError::Backend("disk full".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("account_code"));
        assert!(msg.contains("disk full"));

        let err = StorageError::MissingDefault {
            table: "account_code".to_string(),
            column: "fund".to_string(),
        };
        assert!(err.to_string().contains("account_code.fund"));
    }

    #[test]
    fn test_transient_errors() {
        assert!(StorageError::ConnectionUnavailable("timed out".into()).is_transient());
        assert!(!StorageError::Commit("conflict".into()).is_transient());
    }
}
