use std::sync::Arc;

use crate::{
    registry::{canonical_name, RecordTypeRegistry},
    schema::{ColumnDef, SchemaModel, TableDef, TableName},
    search::{Filter, SearchTerm},
    storage::{BackendTransaction, StorageBackend, StorageError},
    value::Value,
    variant::DatabaseVariantHandler,
};

/// A record read back from the store, keyed by canonical field names.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    record_type: String,
    values: Vec<(String, Value)>,
}

impl Record {
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, v)| v)
    }

    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }
}

/// Transaction factory bound to one backend.
///
/// Cloning is cheap; every clone shares the backend pool, the sealed registry
/// and the variant handler.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
    variant: Arc<dyn DatabaseVariantHandler>,
    registry: Arc<RecordTypeRegistry>,
    model: Arc<SchemaModel>,
    schema: String,
}

impl Store {
    /// `schema` is the canonical name of the schema tables live in when the
    /// variant requires schema creation. Otherwise it is ignored.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        variant: Arc<dyn DatabaseVariantHandler>,
        registry: Arc<RecordTypeRegistry>,
        schema: &str,
    ) -> Result<Self, StorageError> {
        let model = SchemaModel::build(&registry)?;
        Ok(Self {
            backend,
            variant,
            registry,
            model: Arc::new(model),
            schema: canonical_name(schema)?,
        })
    }

    pub fn registry(&self) -> &Arc<RecordTypeRegistry> {
        &self.registry
    }

    pub fn variant(&self) -> &Arc<dyn DatabaseVariantHandler> {
        &self.variant
    }

    pub fn model(&self) -> &SchemaModel {
        &self.model
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    /// Physical schema name, or `None` when tables live in the default schema.
    pub fn physical_schema(&self) -> Option<String> {
        if self.variant.requires_schema_creation() {
            Some(self.variant.to_physical_form(&self.schema))
        } else {
            None
        }
    }

    pub fn table_name(&self, physical_table: &str) -> TableName {
        TableName::new(self.physical_schema().as_deref(), physical_table)
    }

    pub fn start_transaction(&self) -> Result<Transaction, StorageError> {
        let inner = self.backend.begin_transaction()?;
        Ok(Transaction {
            inner,
            store: self.clone(),
        })
    }
}

/// A unit of work on one connection.
///
/// `commit` and `rollback` consume the transaction. Dropping it while still
/// open rolls it back.
pub struct Transaction {
    inner: Box<dyn BackendTransaction>,
    store: Store,
}

impl Transaction {
    /// Direct access to catalog and row operations, in physical names.
    pub fn backend_mut(&mut self) -> &mut (dyn BackendTransaction + 'static) {
        &mut *self.inner
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn commit(self) -> Result<(), StorageError> {
        let backend = self.store.backend_name();
        match self.inner.commit() {
            Ok(()) => {
                tracing::debug!(backend, "transaction committed");
                Ok(())
            }
            Err(StorageError::Commit(reason)) => Err(StorageError::Commit(reason)),
            Err(e) => Err(StorageError::Commit(e.to_string())),
        }
    }

    pub fn rollback(self) -> Result<(), StorageError> {
        let backend = self.store.backend_name();
        let result = self.inner.rollback();
        tracing::debug!(backend, "transaction rolled back");
        result
    }

    /// Inserts a record and returns its key: the generated value for an
    /// auto-numbered key, the supplied one otherwise, `Null` for a type
    /// without a key.
    pub fn insert(&mut self, record_type: &str, values: &[(&str, Value)]) -> Result<Value, StorageError> {
        let values = self.store.registry.validate_values(record_type, values)?;
        let key = self
            .store
            .registry
            .get(record_type)?
            .key()
            .map(|k| (k.name().to_string(), k.is_auto_numbered()));
        let table = self.physical_table(record_type)?;
        let row = self.physical_row(&table, values)?;
        let name = self.store.table_name(&table.name);
        match key {
            Some((field, true)) => {
                let column = self.physical_column(&table, &field)?;
                self.inner
                    .insert_row(&name, &row, Some(&column))?
                    .ok_or_else(|| {
                        StorageError::Backend(format!("no key was generated for a new {} row", name))
                    })
            }
            Some((field, false)) => {
                let physical = self.store.variant.to_physical_form(&field);
                let key = row
                    .iter()
                    .find(|(column, _)| column.name == physical)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null);
                self.inner.insert_row(&name, &row, None)?;
                Ok(key)
            }
            None => {
                self.inner.insert_row(&name, &row, None)?;
                Ok(Value::Null)
            }
        }
    }

    /// Updates the record with the given key. Returns false when no record
    /// has that key.
    pub fn update(
        &mut self,
        record_type: &str,
        key: &Value,
        values: &[(&str, Value)],
    ) -> Result<bool, StorageError> {
        let values = self.store.registry.validate_partial(record_type, values)?;
        let table = self.physical_table(record_type)?;
        let filter = self.key_filter(record_type, &table, key)?;
        let row = self.physical_row(&table, values)?;
        if row.is_empty() {
            return Ok(self.get(record_type, key)?.is_some());
        }
        let name = self.store.table_name(&table.name);
        let updated = self.inner.update_rows(&name, &filter, &row)?;
        Ok(updated > 0)
    }

    pub fn get(&mut self, record_type: &str, key: &Value) -> Result<Option<Record>, StorageError> {
        let table = self.physical_table(record_type)?;
        let filter = self.key_filter(record_type, &table, key)?;
        let mut records = self.select(record_type, &table, Some(&filter))?;
        Ok(records.pop())
    }

    pub fn list(&mut self, record_type: &str) -> Result<Vec<Record>, StorageError> {
        let table = self.physical_table(record_type)?;
        self.select(record_type, &table, None)
    }

    /// Records whose `field` equals `value`.
    pub fn find(
        &mut self,
        record_type: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>, StorageError> {
        self.search(record_type, &[SearchTerm::equals(field, value.clone())])
    }

    /// Records matching every term. Operands are coerced to the field types
    /// the same way inserted values are.
    pub fn search(&mut self, record_type: &str, terms: &[SearchTerm]) -> Result<Vec<Record>, StorageError> {
        let table = self.physical_table(record_type)?;
        let filter = Filter::And(
            terms
                .iter()
                .map(|term| self.resolve_term(record_type, &table, term))
                .collect::<Result<_, _>>()?,
        );
        self.select(record_type, &table, Some(&filter))
    }

    fn resolve_term(
        &self,
        record_type: &str,
        table: &TableDef,
        term: &SearchTerm,
    ) -> Result<Filter, StorageError> {
        match term {
            SearchTerm::Field {
                field,
                operator,
                value,
            } => {
                let (canonical, value) =
                    self.store
                        .registry
                        .validate_field_value(record_type, field, value.clone())?;
                Ok(Filter::Compare {
                    column: self.physical_column(table, &canonical)?,
                    operator: *operator,
                    value,
                })
            }
            SearchTerm::Or(terms) => Ok(Filter::Or(
                terms
                    .iter()
                    .map(|term| self.resolve_term(record_type, table, term))
                    .collect::<Result<_, _>>()?,
            )),
        }
    }

    fn select(
        &mut self,
        record_type: &str,
        table: &TableDef,
        filter: Option<&Filter>,
    ) -> Result<Vec<Record>, StorageError> {
        let canonical_type = self.store.registry.get(record_type)?.name().to_string();
        let name = self.store.table_name(&table.name);
        let rows = self.inner.select_rows(&name, &table.columns, filter)?;
        let variant = self.store.variant.clone();
        Ok(rows
            .into_iter()
            .map(|row| Record {
                record_type: canonical_type.clone(),
                values: table
                    .columns
                    .iter()
                    .map(|c| variant.to_canonical_form(&c.name))
                    .zip(row)
                    .collect(),
            })
            .collect())
    }

    fn physical_table(&self, record_type: &str) -> Result<TableDef, StorageError> {
        let canonical = self.store.registry.get(record_type)?.name();
        let table = self
            .store
            .model
            .table(canonical)
            .ok_or_else(|| StorageError::UnknownType(record_type.to_string()))?;
        Ok(table.to_physical(self.store.variant.as_ref()))
    }

    fn physical_column(&self, table: &TableDef, canonical: &str) -> Result<ColumnDef, StorageError> {
        let physical = self.store.variant.to_physical_form(canonical);
        table
            .column(&physical)
            .cloned()
            .ok_or_else(|| StorageError::UnknownField {
                record_type: table.name.clone(),
                field: canonical.to_string(),
            })
    }

    fn key_filter(&self, record_type: &str, table: &TableDef, key: &Value) -> Result<Filter, StorageError> {
        let key_field = self
            .store
            .registry
            .get(record_type)?
            .key()
            .ok_or_else(|| StorageError::InvalidKey {
                record_type: record_type.to_string(),
                reason: "record type has no key field".to_string(),
            })?;
        let (canonical, key) =
            self.store
                .registry
                .validate_field_value(record_type, key_field.name(), key.clone())?;
        Ok(Filter::equals(self.physical_column(table, &canonical)?, key))
    }

    fn physical_row(
        &self,
        table: &TableDef,
        values: Vec<(String, Value)>,
    ) -> Result<Vec<(ColumnDef, Value)>, StorageError> {
        values
            .into_iter()
            .map(|(field, value)| Ok((self.physical_column(table, &field)?, value)))
            .collect()
    }
}
