//! Storage management for FundStore: a sealed record type registry, the
//! physical schema derived from it, deployment and validation of that schema
//! against a live database, and the transactional store every reader and
//! writer goes through.

pub mod deploy;
pub mod registry;
pub mod schema;
pub mod search;
pub mod storage;
pub mod store;
pub mod validate;
pub mod value;
pub mod variant;

pub use deploy::{DeploymentReport, SchemaChange, SchemaDeploymentTask};
pub use registry::{canonical_name, Field, FieldType, RecordType, RecordTypeRegistry};
pub use schema::{
    quote_ident, sql_literal, ColumnDef, ColumnInfo, ColumnType, IndexDef, SchemaModel, TableDef,
    TableName,
};
pub use search::{Filter, SearchOperator, SearchTerm};
pub use storage::{BackendTransaction, PoolOptions, StorageBackend, StorageError};
pub use store::{Record, Store, Transaction};
pub use validate::{SchemaDiscrepancy, SchemaValidator, ValidationOptions, ValidationReport};
pub use value::Value;
pub use variant::{
    variant_for, DatabaseVariantHandler, PostgresVariant, SqliteVariant, UpperCaseVariant,
    VariantKind,
};
