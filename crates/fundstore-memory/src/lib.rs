//! In-memory storage backend.
//!
//! Every transaction works on a private snapshot of the catalog. Commit
//! publishes the tables the transaction touched, failing if another
//! transaction committed changes to any of them in the meantime.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use fundstore_core::{
    BackendTransaction, ColumnDef, ColumnInfo, ColumnType, Filter, IndexDef, PoolOptions,
    StorageBackend, StorageError, TableDef, TableName, Value,
};

type TableKey = (Option<String>, String);

fn key_of(name: &TableName) -> TableKey {
    (name.schema.clone(), name.table.clone())
}

#[derive(Debug, Clone)]
struct MemTable {
    columns: Vec<ColumnInfo>,
    defaults: Vec<Option<Value>>,
    primary_key: Option<usize>,
    indexes: BTreeSet<String>,
    rows: Vec<Vec<Value>>,
    version: u64,
}

impl MemTable {
    fn position(&self, table: &TableName, column: &str) -> Result<usize, StorageError> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| StorageError::Backend(format!("no such column: {}.{}", table, column)))
    }

    /// Column positions for every column a filter reads, by column name.
    fn filter_positions(
        &self,
        table: &TableName,
        filter: &Filter,
    ) -> Result<BTreeMap<String, usize>, StorageError> {
        let mut positions = BTreeMap::new();
        for column in filter.columns() {
            positions.insert(column.name.clone(), self.position(table, &column.name)?);
        }
        Ok(positions)
    }

    fn check_row(&self, table: &TableName, row: &[Value], skip: Option<usize>) -> Result<(), StorageError> {
        for (column, value) in self.columns.iter().zip(row) {
            if value.is_null() && !column.nullable {
                return Err(StorageError::Backend(format!(
                    "NOT NULL constraint failed: {}.{}",
                    table, column.name
                )));
            }
            if let Some(column_type) = column.column_type {
                if !fits(column_type, value) {
                    return Err(StorageError::Backend(format!(
                        "column {}.{} cannot hold a {} value",
                        table,
                        column.name,
                        value.type_name()
                    )));
                }
            }
        }
        if let Some(pk) = self.primary_key {
            let duplicate = self
                .rows
                .iter()
                .enumerate()
                .any(|(i, existing)| Some(i) != skip && existing[pk] == row[pk]);
            if duplicate {
                return Err(StorageError::Backend(format!(
                    "UNIQUE constraint failed: {}.{}",
                    table, self.columns[pk].name
                )));
            }
        }
        Ok(())
    }
}

fn row_matches(filter: &Filter, positions: &BTreeMap<String, usize>, row: &[Value]) -> bool {
    filter.matches(&|column: &ColumnDef| positions.get(&column.name).map(|p| &row[*p]))
}

fn fits(column_type: ColumnType, value: &Value) -> bool {
    matches!(
        (column_type, value),
        (_, Value::Null)
            | (ColumnType::Integer, Value::Integer(_))
            | (ColumnType::Text, Value::String(_))
            | (ColumnType::Decimal, Value::Decimal(_))
            | (ColumnType::Timestamp, Value::Timestamp(_))
            | (ColumnType::Boolean, Value::Boolean(_))
    )
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    schemas: BTreeSet<String>,
    tables: BTreeMap<TableKey, MemTable>,
}

pub struct MemoryStorage {
    state: Arc<RwLock<Catalog>>,
    version_counter: Arc<AtomicU64>,
    open_transactions: Arc<AtomicUsize>,
    max_transactions: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(&PoolOptions::default())
    }
}

impl MemoryStorage {
    pub fn new(options: &PoolOptions) -> Self {
        Self {
            state: Arc::new(RwLock::new(Catalog::default())),
            version_counter: Arc::new(AtomicU64::new(1)),
            open_transactions: Arc::new(AtomicUsize::new(0)),
            max_transactions: options.max_connections.max(1) as usize,
        }
    }

    pub fn open_transactions(&self) -> usize {
        self.open_transactions.load(Ordering::SeqCst)
    }
}

impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn begin_transaction(&self) -> Result<Box<dyn BackendTransaction>, StorageError> {
        let open = self.open_transactions.fetch_add(1, Ordering::SeqCst);
        if open >= self.max_transactions {
            self.open_transactions.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::ConnectionUnavailable(format!(
                "all {} connections are in use",
                self.max_transactions
            )));
        }
        let slot = Slot(self.open_transactions.clone());

        let snapshot = self
            .state
            .read()
            .map_err(|_| StorageError::Backend("memory catalog lock poisoned".to_string()))?
            .clone();
        let tx_id = self.version_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "memory transaction started");
        Ok(Box::new(MemoryTransaction {
            tx_id,
            state: self.state.clone(),
            version_counter: self.version_counter.clone(),
            snapshot,
            base_versions: BTreeMap::new(),
            created_schemas: BTreeSet::new(),
            _slot: slot,
        }))
    }
}

/// Holds one of the backend's connection slots until dropped.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemoryTransaction {
    tx_id: u64,
    state: Arc<RwLock<Catalog>>,
    version_counter: Arc<AtomicU64>,
    snapshot: Catalog,
    /// Version each touched table had when this transaction first wrote it;
    /// `None` for tables the transaction created.
    base_versions: BTreeMap<TableKey, Option<u64>>,
    created_schemas: BTreeSet<String>,
    _slot: Slot,
}

impl MemoryTransaction {
    fn touch(&mut self, key: &TableKey) {
        if !self.base_versions.contains_key(key) {
            let base = self.snapshot.tables.get(key).map(|t| t.version);
            self.base_versions.insert(key.clone(), base);
        }
    }

    fn table(&self, name: &TableName) -> Result<&MemTable, StorageError> {
        self.snapshot
            .tables
            .get(&key_of(name))
            .ok_or_else(|| StorageError::Backend(format!("no such table: {}", name)))
    }

    fn table_mut(&mut self, name: &TableName) -> Result<&mut MemTable, StorageError> {
        let key = key_of(name);
        if !self.snapshot.tables.contains_key(&key) {
            return Err(StorageError::Backend(format!("no such table: {}", name)));
        }
        self.touch(&key);
        self.snapshot
            .tables
            .get_mut(&key)
            .ok_or_else(|| StorageError::Backend(format!("no such table: {}", name)))
    }
}

impl BackendTransaction for MemoryTransaction {
    fn schema_exists(&mut self, schema: &str) -> Result<bool, StorageError> {
        Ok(self.snapshot.schemas.contains(schema))
    }

    fn create_schema(&mut self, schema: &str) -> Result<(), StorageError> {
        if !self.snapshot.schemas.insert(schema.to_string()) {
            return Err(StorageError::Backend(format!("schema {} already exists", schema)));
        }
        self.created_schemas.insert(schema.to_string());
        Ok(())
    }

    fn tables(&mut self, schema: Option<&str>) -> Result<Vec<String>, StorageError> {
        Ok(self
            .snapshot
            .tables
            .keys()
            .filter(|(s, _)| s.as_deref() == schema)
            .map(|(_, t)| t.clone())
            .collect())
    }

    fn columns(&mut self, table: &TableName) -> Result<Vec<ColumnInfo>, StorageError> {
        Ok(self.table(table)?.columns.clone())
    }

    fn indexes(&mut self, table: &TableName) -> Result<Vec<String>, StorageError> {
        Ok(self.table(table)?.indexes.iter().cloned().collect())
    }

    fn create_table(&mut self, table: &TableName, def: &TableDef) -> Result<(), StorageError> {
        if let Some(schema) = &table.schema {
            if !self.snapshot.schemas.contains(schema) {
                return Err(StorageError::Backend(format!("schema {} does not exist", schema)));
            }
        }
        let key = key_of(table);
        if self.snapshot.tables.contains_key(&key) {
            return Err(StorageError::Backend(format!("table {} already exists", table)));
        }
        let primary_key = match &def.primary_key {
            Some(pk) => Some(
                def.columns
                    .iter()
                    .position(|c| &c.name == pk)
                    .ok_or_else(|| StorageError::Backend(format!("no such column: {}", pk)))?,
            ),
            None => None,
        };
        self.touch(&key);
        self.snapshot.tables.insert(
            key,
            MemTable {
                columns: def.columns.iter().map(column_info).collect(),
                defaults: def.columns.iter().map(|c| c.default.clone()).collect(),
                primary_key,
                indexes: BTreeSet::new(),
                rows: Vec::new(),
                version: 0,
            },
        );
        Ok(())
    }

    fn add_column(&mut self, table: &TableName, column: &ColumnDef) -> Result<(), StorageError> {
        let mem = self.table_mut(table)?;
        if mem.columns.iter().any(|c| c.name == column.name) {
            return Err(StorageError::Backend(format!(
                "duplicate column name: {}",
                column.name
            )));
        }
        let fill = column.default.clone().unwrap_or(Value::Null);
        if fill.is_null() && !column.nullable && !mem.rows.is_empty() {
            return Err(StorageError::Backend(format!(
                "cannot add NOT NULL column {} without a default to non-empty table {}",
                column.name, table
            )));
        }
        mem.columns.push(column_info(column));
        mem.defaults.push(column.default.clone());
        for row in &mut mem.rows {
            row.push(fill.clone());
        }
        Ok(())
    }

    fn create_index(&mut self, table: &TableName, index: &IndexDef) -> Result<(), StorageError> {
        let mem = self.table_mut(table)?;
        mem.position(table, &index.column)?;
        if !mem.indexes.insert(index.name.clone()) {
            return Err(StorageError::Backend(format!("index {} already exists", index.name)));
        }
        Ok(())
    }

    fn insert_row(
        &mut self,
        table: &TableName,
        row: &[(ColumnDef, Value)],
        returning: Option<&ColumnDef>,
    ) -> Result<Option<Value>, StorageError> {
        let mem = self.table_mut(table)?;
        let mut values: Vec<Value> = mem
            .defaults
            .iter()
            .map(|d| d.clone().unwrap_or(Value::Null))
            .collect();
        for (column, value) in row {
            let position = mem.position(table, &column.name)?;
            values[position] = value.clone();
        }
        let generated = match returning {
            Some(column) => {
                let position = mem.position(table, &column.name)?;
                let next = mem
                    .rows
                    .iter()
                    .filter_map(|r| r[position].as_i64())
                    .max()
                    .unwrap_or(0)
                    + 1;
                values[position] = Value::Integer(next);
                Some(Value::Integer(next))
            }
            None => None,
        };
        mem.check_row(table, &values, None)?;
        mem.rows.push(values);
        Ok(generated)
    }

    fn update_rows(
        &mut self,
        table: &TableName,
        filter: &Filter,
        values: &[(ColumnDef, Value)],
    ) -> Result<u64, StorageError> {
        let mem = self.table_mut(table)?;
        let filter_positions = mem.filter_positions(table, filter)?;
        let mut assignments = Vec::with_capacity(values.len());
        for (column, value) in values {
            assignments.push((mem.position(table, &column.name)?, value.clone()));
        }

        let matching: Vec<usize> = mem
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row_matches(filter, &filter_positions, row))
            .map(|(i, _)| i)
            .collect();
        for &i in &matching {
            let mut updated = mem.rows[i].clone();
            for (position, value) in &assignments {
                updated[*position] = value.clone();
            }
            mem.check_row(table, &updated, Some(i))?;
            mem.rows[i] = updated;
        }
        Ok(matching.len() as u64)
    }

    fn select_rows(
        &mut self,
        table: &TableName,
        columns: &[ColumnDef],
        filter: Option<&Filter>,
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        let mem = self.table(table)?;
        let positions = columns
            .iter()
            .map(|c| mem.position(table, &c.name))
            .collect::<Result<Vec<_>, _>>()?;
        let filter = match filter {
            Some(filter) => Some((filter, mem.filter_positions(table, filter)?)),
            None => None,
        };
        Ok(mem
            .rows
            .iter()
            .filter(|row| {
                filter
                    .as_ref()
                    .map_or(true, |(filter, positions)| row_matches(filter, positions, row))
            })
            .map(|row| positions.iter().map(|p| row[*p].clone()).collect())
            .collect())
    }

    fn count_rows(&mut self, table: &TableName) -> Result<u64, StorageError> {
        Ok(self.table(table)?.rows.len() as u64)
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let tx = *self;
        let mut live = tx
            .state
            .write()
            .map_err(|_| StorageError::Commit("memory catalog lock poisoned".to_string()))?;

        for schema in &tx.created_schemas {
            if live.schemas.contains(schema) {
                return Err(StorageError::Commit(format!(
                    "schema {} was created concurrently",
                    schema
                )));
            }
        }
        for (key, base) in &tx.base_versions {
            let current = live.tables.get(key).map(|t| t.version);
            if current != *base {
                return Err(StorageError::Commit(format!(
                    "write conflict on table {}",
                    TableName::new(key.0.as_deref(), &key.1)
                )));
            }
        }

        let version = tx.version_counter.fetch_add(1, Ordering::SeqCst);
        live.schemas.extend(tx.created_schemas.iter().cloned());
        let mut snapshot = tx.snapshot;
        for key in tx.base_versions.keys() {
            if let Some(mut table) = snapshot.tables.remove(key) {
                table.version = version;
                live.tables.insert(key.clone(), table);
            }
        }
        tracing::debug!(tx_id = tx.tx_id, "memory transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        tracing::debug!(tx_id = self.tx_id, "memory transaction rolled back");
        Ok(())
    }
}

fn column_info(def: &ColumnDef) -> ColumnInfo {
    ColumnInfo {
        name: def.name.clone(),
        column_type: Some(def.column_type),
        declared_type: def.column_type.to_string(),
        nullable: def.nullable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundstore_core::{
        Field, FieldType, RecordType, RecordTypeRegistry, SchemaChange, SchemaDeploymentTask,
        SchemaDiscrepancy, SchemaValidator, SearchOperator, SearchTerm, Store, UpperCaseVariant,
        ValidationOptions,
    };
    use rust_decimal::Decimal;

    fn registry() -> Arc<RecordTypeRegistry> {
        RecordTypeRegistry::from_types(vec![
            RecordType::builder("AccountCode")
                .field(Field::required("id", FieldType::Integer))
                .field(Field::required("title", FieldType::String))
                .key("id")
                .build()
                .unwrap(),
            RecordType::builder("BankAccount")
                .field(Field::required("id", FieldType::Integer))
                .field(Field::required("account_code", FieldType::Reference("account_code".into())))
                .field(Field::optional("interest_rate", FieldType::Decimal))
                .key("id")
                .build()
                .unwrap(),
        ])
        .unwrap()
    }

    fn store_with(backend: Arc<MemoryStorage>) -> Store {
        Store::new(backend, Arc::new(UpperCaseVariant), registry(), "oakfunds").unwrap()
    }

    fn store() -> Store {
        store_with(Arc::new(MemoryStorage::default()))
    }

    #[test]
    fn test_deploy_then_validate() {
        let store = store();
        let report = SchemaDeploymentTask::new(&store).deploy().unwrap();
        assert_eq!(
            report.changes,
            vec![
                SchemaChange::CreatedSchema { schema: "oakfunds".into() },
                SchemaChange::CreatedTable { table: "account_code".into() },
                SchemaChange::CreatedTable { table: "bank_account".into() },
                SchemaChange::CreatedIndex {
                    table: "bank_account".into(),
                    index: "idx_bank_account_account_code".into(),
                },
            ]
        );
        let validation = SchemaValidator::new(&store).validate_schema().unwrap();
        assert!(validation.is_clean());
    }

    #[test]
    fn test_deploy_is_idempotent() {
        let store = store();
        let task = SchemaDeploymentTask::new(&store);
        task.deploy().unwrap();
        let second = task.deploy().unwrap();
        assert!(second.is_unchanged());
        assert!(second.flagged.is_empty());
    }

    #[test]
    fn test_physical_names_use_variant() {
        let store = store();
        SchemaDeploymentTask::new(&store).deploy().unwrap();
        let mut tx = store.start_transaction().unwrap();
        let mut tables = tx.backend_mut().tables(Some("OAKFUNDS")).unwrap();
        tables.sort();
        assert_eq!(tables, vec!["ACCOUNT_CODE", "BANK_ACCOUNT"]);
        tx.rollback().unwrap();
    }

    #[test]
    fn test_validation_reports_every_discrepancy() {
        let store = store();
        let mut tx = store.start_transaction().unwrap();
        let backend = tx.backend_mut();
        backend.create_schema("OAKFUNDS").unwrap();
        backend
            .create_table(
                &TableName::new(Some("OAKFUNDS"), "BANK_ACCOUNT"),
                &TableDef {
                    name: "BANK_ACCOUNT".into(),
                    columns: vec![ColumnDef {
                        name: "ID".into(),
                        column_type: ColumnType::Integer,
                        nullable: false,
                        default: None,
                        auto_increment: false,
                    }],
                    primary_key: Some("ID".into()),
                    indexes: vec![],
                },
            )
            .unwrap();
        tx.commit().unwrap();

        let err = SchemaValidator::new(&store).validate_schema().unwrap_err();
        let report = match err {
            StorageError::SchemaValidation(report) => report,
            other => panic!("expected validation error, got {:?}", other),
        };
        assert_eq!(
            report.discrepancies(),
            &[
                SchemaDiscrepancy::MissingTable { table: "account_code".into() },
                SchemaDiscrepancy::MissingColumn {
                    table: "bank_account".into(),
                    column: "account_code".into(),
                },
                SchemaDiscrepancy::MissingColumn {
                    table: "bank_account".into(),
                    column: "interest_rate".into(),
                },
            ]
        );
    }

    #[test]
    fn test_missing_schema_reported() {
        let report = SchemaValidator::new(&store()).discrepancies().unwrap();
        assert_eq!(
            report.discrepancies()[0],
            SchemaDiscrepancy::MissingSchema { schema: "oakfunds".into() }
        );
        assert_eq!(report.len(), 3);
    }

    #[test]
    fn test_deploy_is_additive_only() {
        let store = store();
        let mut tx = store.start_transaction().unwrap();
        let backend = tx.backend_mut();
        backend.create_schema("OAKFUNDS").unwrap();
        let table = TableName::new(Some("OAKFUNDS"), "ACCOUNT_CODE");
        backend
            .create_table(
                &table,
                &TableDef {
                    name: "ACCOUNT_CODE".into(),
                    columns: vec![
                        ColumnDef {
                            name: "ID".into(),
                            column_type: ColumnType::Integer,
                            nullable: false,
                            default: None,
                            auto_increment: false,
                        },
                        ColumnDef {
                            name: "LEGACY_FLAG".into(),
                            column_type: ColumnType::Boolean,
                            nullable: true,
                            default: None,
                            auto_increment: false,
                        },
                    ],
                    primary_key: Some("ID".into()),
                    indexes: vec![],
                },
            )
            .unwrap();
        tx.commit().unwrap();

        let report = SchemaDeploymentTask::new(&store).deploy().unwrap();
        assert!(report.changes.contains(&SchemaChange::AddedColumn {
            table: "account_code".into(),
            column: "title".into(),
        }));
        assert_eq!(
            report.flagged,
            vec![SchemaDiscrepancy::ExtraColumn {
                table: "account_code".into(),
                column: "legacy_flag".into(),
            }]
        );

        let mut tx = store.start_transaction().unwrap();
        let columns = tx.backend_mut().columns(&table).unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ID", "LEGACY_FLAG", "TITLE"]);
        tx.rollback().unwrap();

        assert!(SchemaValidator::new(&store).validate_schema().is_ok());
        let strict = SchemaValidator::with_options(&store, ValidationOptions { flag_extra: true });
        assert_eq!(strict.discrepancies().unwrap().len(), 1);
    }

    #[test]
    fn test_insert_and_read_back() {
        let store = store();
        SchemaDeploymentTask::new(&store).deploy().unwrap();

        let mut tx = store.start_transaction().unwrap();
        tx.insert("AccountCode", &[("id", Value::Integer(80000)), ("title", Value::from("Operating"))])
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.start_transaction().unwrap();
        let record = tx.get("AccountCode", &Value::Integer(80000)).unwrap().unwrap();
        assert_eq!(record.record_type(), "account_code");
        assert_eq!(record.get("id"), Some(&Value::Integer(80000)));
        assert_eq!(record.get("title"), Some(&Value::from("Operating")));
        tx.rollback().unwrap();
    }

    #[test]
    fn test_update_and_find() {
        let store = store();
        SchemaDeploymentTask::new(&store).deploy().unwrap();

        let mut tx = store.start_transaction().unwrap();
        tx.insert("account_code", &[("id", Value::Integer(1)), ("title", Value::from("Operating"))])
            .unwrap();
        tx.insert(
            "bank_account",
            &[
                ("id", Value::Integer(10)),
                ("account_code", Value::Integer(1)),
                ("interest_rate", Value::from("0.025")),
            ],
        )
        .unwrap();
        assert!(tx
            .update("account_code", &Value::Integer(1), &[("title", Value::from("Reserve"))])
            .unwrap());
        assert!(!tx
            .update("account_code", &Value::Integer(2), &[("title", Value::from("Nothing"))])
            .unwrap());
        tx.commit().unwrap();

        let mut tx = store.start_transaction().unwrap();
        let accounts = tx.find("bank_account", "account_code", &Value::Integer(1)).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(
            accounts[0].get("interest_rate"),
            Some(&Value::Decimal(Decimal::new(25, 3)))
        );
        let codes = tx.list("account_code").unwrap();
        assert_eq!(codes[0].get("title"), Some(&Value::from("Reserve")));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let store = store();
        SchemaDeploymentTask::new(&store).deploy().unwrap();

        let mut tx = store.start_transaction().unwrap();
        tx.insert("account_code", &[("id", Value::Integer(1)), ("title", Value::from("Operating"))])
            .unwrap();
        tx.rollback().unwrap();

        {
            let mut tx = store.start_transaction().unwrap();
            tx.insert("account_code", &[("id", Value::Integer(2)), ("title", Value::from("Dropped"))])
                .unwrap();
        }

        let mut tx = store.start_transaction().unwrap();
        assert!(tx.list("account_code").unwrap().is_empty());
    }

    #[test]
    fn test_failed_commit_leaves_no_partial_writes() {
        let store = store();
        SchemaDeploymentTask::new(&store).deploy().unwrap();

        let mut first = store.start_transaction().unwrap();
        let mut second = store.start_transaction().unwrap();
        first
            .insert("account_code", &[("id", Value::Integer(1)), ("title", Value::from("First"))])
            .unwrap();
        second
            .insert("account_code", &[("id", Value::Integer(1)), ("title", Value::from("Second"))])
            .unwrap();
        second
            .insert("account_code", &[("id", Value::Integer(2)), ("title", Value::from("Extra"))])
            .unwrap();
        first.commit().unwrap();

        let err = second.commit().unwrap_err();
        assert!(matches!(err, StorageError::Commit(_)));

        let mut tx = store.start_transaction().unwrap();
        let codes = tx.list("account_code").unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].get("title"), Some(&Value::from("First")));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let store = store();
        SchemaDeploymentTask::new(&store).deploy().unwrap();

        let mut tx = store.start_transaction().unwrap();
        tx.insert("account_code", &[("id", Value::Integer(1)), ("title", Value::from("A"))])
            .unwrap();
        let err = tx
            .insert("account_code", &[("id", Value::Integer(1)), ("title", Value::from("B"))])
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend(msg) if msg.contains("UNIQUE")));
    }

    #[test]
    fn test_pool_exhaustion_fails_fast() {
        let backend = Arc::new(MemoryStorage::new(&PoolOptions {
            max_connections: 2,
            ..PoolOptions::default()
        }));
        let store = store_with(backend.clone());
        let first = store.start_transaction().unwrap();
        let _second = store.start_transaction().unwrap();
        let err = store.start_transaction().err().unwrap();
        assert!(err.is_transient());

        first.rollback().unwrap();
        assert_eq!(backend.open_transactions(), 1);
        assert!(store.start_transaction().is_ok());
    }

    #[test]
    fn test_concurrent_transactions_from_threads() {
        let store = store();
        SchemaDeploymentTask::new(&store).deploy().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut tx = store.start_transaction().unwrap();
                    tx.list("account_code").unwrap();
                    tx.rollback().unwrap();
                    i
                })
            })
            .collect();
        let finished: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(finished.len(), 4);
    }

    #[test]
    fn test_partial_deploy_failure_names_record_type() {
        let store = store();
        let mut tx = store.start_transaction().unwrap();
        let backend = tx.backend_mut();
        backend.create_schema("OAKFUNDS").unwrap();
        let table = TableName::new(Some("OAKFUNDS"), "BANK_ACCOUNT");
        backend
            .create_table(
                &table,
                &TableDef {
                    name: "BANK_ACCOUNT".into(),
                    columns: vec![ColumnDef {
                        name: "ID".into(),
                        column_type: ColumnType::Integer,
                        nullable: false,
                        default: None,
                        auto_increment: false,
                    }],
                    primary_key: Some("ID".into()),
                    indexes: vec![],
                },
            )
            .unwrap();
        backend
            .insert_row(
                &table,
                &[(
                    ColumnDef {
                        name: "ID".into(),
                        column_type: ColumnType::Integer,
                        nullable: false,
                        default: None,
                        auto_increment: false,
                    },
                    Value::Integer(1),
                )],
                None,
            )
            .unwrap();
        tx.commit().unwrap();

        // account_code deploys, bank_account cannot gain a required column
        let err = SchemaDeploymentTask::new(&store).deploy().unwrap_err();
        match &err {
            StorageError::SchemaDeployment { record_type, source } => {
                assert_eq!(record_type, "bank_account");
                assert!(matches!(
                    source.as_ref(),
                    StorageError::MissingDefault { column, .. } if column == "ACCOUNT_CODE"
                ));
            }
            other => panic!("expected deployment error, got {:?}", other),
        }

        let report = SchemaValidator::new(&store).discrepancies().unwrap();
        assert!(!report
            .discrepancies()
            .contains(&SchemaDiscrepancy::MissingTable { table: "account_code".into() }));
    }

    #[test]
    fn test_required_column_added_to_empty_table() {
        let store = store();
        let mut tx = store.start_transaction().unwrap();
        let backend = tx.backend_mut();
        backend.create_schema("OAKFUNDS").unwrap();
        let table = TableName::new(Some("OAKFUNDS"), "ACCOUNT_CODE");
        backend
            .create_table(
                &table,
                &TableDef {
                    name: "ACCOUNT_CODE".into(),
                    columns: vec![ColumnDef {
                        name: "ID".into(),
                        column_type: ColumnType::Integer,
                        nullable: false,
                        default: None,
                        auto_increment: false,
                    }],
                    primary_key: Some("ID".into()),
                    indexes: vec![],
                },
            )
            .unwrap();
        tx.commit().unwrap();

        let report = SchemaDeploymentTask::new(&store).deploy().unwrap();
        assert!(report.changes.contains(&SchemaChange::AddedColumn {
            table: "account_code".into(),
            column: "title".into(),
        }));
        assert!(SchemaValidator::new(&store).validate_schema().is_ok());
    }

    #[test]
    fn test_search_with_operators_and_alternatives() {
        let store = store();
        SchemaDeploymentTask::new(&store).deploy().unwrap();

        let mut tx = store.start_transaction().unwrap();
        tx.insert("account_code", &[("id", Value::Integer(1)), ("title", Value::from("Operating"))])
            .unwrap();
        for (id, rate) in [(10, Some("0.01")), (11, Some("0.035")), (12, None)] {
            let rate = rate.map_or(Value::Null, Value::from);
            tx.insert(
                "bank_account",
                &[
                    ("id", Value::Integer(id)),
                    ("account_code", Value::Integer(1)),
                    ("interest_rate", rate),
                ],
            )
            .unwrap();
        }

        let ids = |records: Vec<fundstore_core::Record>| -> Vec<Value> {
            records.iter().map(|r| r.get("id").cloned().unwrap()).collect()
        };
        let above = tx
            .search(
                "bank_account",
                &[SearchTerm::field("interest_rate", SearchOperator::GreaterThan, "0.02")],
            )
            .unwrap();
        assert_eq!(ids(above), vec![Value::Integer(11)]);

        let either = tx
            .search(
                "bank_account",
                &[
                    SearchTerm::equals("account_code", 1),
                    SearchTerm::or([
                        SearchTerm::equals("interest_rate", Value::Null),
                        SearchTerm::field("id", SearchOperator::LessThanOrEqual, 10),
                    ]),
                ],
            )
            .unwrap();
        assert_eq!(ids(either), vec![Value::Integer(10), Value::Integer(12)]);

        let not_null = tx
            .search(
                "bank_account",
                &[SearchTerm::field("interest_rate", SearchOperator::NotEquals, Value::Null)],
            )
            .unwrap();
        assert_eq!(not_null.len(), 2);

        let err = tx
            .search("bank_account", &[SearchTerm::equals("colour", "red")])
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownField { .. }));
    }

    #[test]
    fn test_auto_numbered_keys() {
        let registry = RecordTypeRegistry::from_types(vec![RecordType::builder("journal_line")
            .field(Field::auto_numbered("id"))
            .field(Field::required("memo", FieldType::String))
            .key("id")
            .build()
            .unwrap()])
        .unwrap();
        let store = Store::new(
            Arc::new(MemoryStorage::default()),
            Arc::new(UpperCaseVariant),
            registry,
            "oakfunds",
        )
        .unwrap();
        SchemaDeploymentTask::new(&store).deploy().unwrap();

        let mut tx = store.start_transaction().unwrap();
        let first = tx.insert("journal_line", &[("memo", Value::from("opening"))]).unwrap();
        let second = tx.insert("journal_line", &[("memo", Value::from("transfer"))]).unwrap();
        assert_eq!(first, Value::Integer(1));
        assert_eq!(second, Value::Integer(2));
        tx.commit().unwrap();

        let mut tx = store.start_transaction().unwrap();
        let record = tx.get("journal_line", &second).unwrap().unwrap();
        assert_eq!(record.get("memo"), Some(&Value::from("transfer")));
        let err = tx
            .insert("journal_line", &[("id", Value::Integer(9)), ("memo", Value::from("manual"))])
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord { .. }));
    }
}
