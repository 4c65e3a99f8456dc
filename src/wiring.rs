use std::sync::Arc;

use fundstore_core::{
    variant_for, RecordTypeRegistry, SchemaDeploymentTask, SchemaValidator, StorageBackend,
    StorageError, Store, ValidationOptions,
};
use fundstore_memory::MemoryStorage;
use fundstore_postgres::PostgresStorage;
use fundstore_sqlite::SqliteStorage;

use crate::{
    bootstrap::Bootstrapper,
    config::{BackendKind, Config},
    types,
};

/// Everything the tools and the application need, built in dependency
/// order: registry, variant, backend, store.
pub struct Environment {
    store: Store,
}

impl Environment {
    pub fn open(config: &Config) -> Result<Self, StorageError> {
        Self::open_with(config, types::registry()?)
    }

    pub fn open_with(config: &Config, registry: Arc<RecordTypeRegistry>) -> Result<Self, StorageError> {
        let database = &config.database;
        let variant = variant_for(database.variant_kind());
        let options = database.pool_options();
        let backend: Arc<dyn StorageBackend> = match database.backend {
            BackendKind::Memory => Arc::new(MemoryStorage::new(&options)),
            BackendKind::Sqlite => Arc::new(SqliteStorage::new(&database.url, &options)?),
            BackendKind::Postgres => Arc::new(PostgresStorage::new(&database.url, &options)?),
        };
        let store = Store::new(backend, variant, registry, &database.schema)?;
        tracing::info!(
            backend = store.backend_name(),
            variant = ?database.variant_kind(),
            schema = store.schema_name(),
            "storage environment ready"
        );
        Ok(Self { store })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn deployment(&self) -> SchemaDeploymentTask {
        SchemaDeploymentTask::new(&self.store)
    }

    pub fn validator(&self, options: ValidationOptions) -> SchemaValidator {
        SchemaValidator::with_options(&self.store, options)
    }

    pub fn bootstrapper(&self) -> Bootstrapper {
        Bootstrapper::new(&self.store)
    }
}
