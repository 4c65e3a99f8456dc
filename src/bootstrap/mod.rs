//! Seed data loading.
//!
//! Every record is checked against the registry before anything is written.
//! Tasks then run in priority order, each in its own transaction. Re-running
//! the same file is a no-op: records whose key already exists with the same
//! values are skipped, and an existing key with different values is a
//! conflict.

mod reader;

pub use reader::BootstrapConfigReader;

use fundstore_core::{StorageError, Store, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid {record_type} record in task {task}: {reason}")]
    Validation {
        task: String,
        record_type: String,
        reason: String,
    },
    #[error("{record_type} with key {key} already exists with different values (task {task})")]
    Conflict {
        task: String,
        record_type: String,
        key: String,
    },
    #[error("bootstrap configuration error: {0}")]
    Config(String),
    #[error("failed to read bootstrap file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapRecord {
    pub record_type: String,
    pub values: Vec<(String, Value)>,
}

impl BootstrapRecord {
    pub fn new(record_type: &str) -> Self {
        Self {
            record_type: record_type.to_string(),
            values: Vec::new(),
        }
    }

    pub fn value(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.values.push((field.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapTask {
    pub name: String,
    /// Lower runs first; ties keep file order.
    pub priority: i32,
    pub records: Vec<BootstrapRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapSummary {
    pub tasks: usize,
    pub inserted: usize,
    pub skipped: usize,
}

/// A record that passed validation: canonical type, key and full values.
struct PreparedRecord {
    record_type: String,
    key: Value,
    values: Vec<(String, Value)>,
}

struct PreparedTask {
    name: String,
    priority: i32,
    records: Vec<PreparedRecord>,
}

pub struct Bootstrapper {
    store: Store,
}

impl Bootstrapper {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
        }
    }

    pub fn bootstrap(&self, tasks: Vec<BootstrapTask>) -> Result<BootstrapSummary, BootstrapError> {
        self.store.registry().ensure_sealed()?;

        let mut prepared = tasks
            .into_iter()
            .map(|task| self.prepare(task))
            .collect::<Result<Vec<_>, _>>()?;
        prepared.sort_by_key(|task| task.priority);

        let mut summary = BootstrapSummary::default();
        for task in &prepared {
            tracing::info!(task = %task.name, priority = task.priority, "bootstrapping");
            let (inserted, skipped) = self.run_task(task).map_err(|e| {
                tracing::error!(task = %task.name, error = %e, "bootstrap task failed");
                e
            })?;
            summary.tasks += 1;
            summary.inserted += inserted;
            summary.skipped += skipped;
        }
        tracing::info!(
            tasks = summary.tasks,
            inserted = summary.inserted,
            skipped = summary.skipped,
            "bootstrapping complete"
        );
        Ok(summary)
    }

    fn prepare(&self, task: BootstrapTask) -> Result<PreparedTask, BootstrapError> {
        let registry = self.store.registry();
        let mut records = Vec::with_capacity(task.records.len());
        for record in task.records {
            let invalid = |reason: String| BootstrapError::Validation {
                task: task.name.clone(),
                record_type: record.record_type.clone(),
                reason,
            };
            let record_type = registry
                .get(&record.record_type)
                .map_err(|e| invalid(e.to_string()))?;
            let key_field = record_type
                .key()
                .ok_or_else(|| invalid("record type has no key field".to_string()))?;
            if key_field.is_auto_numbered() {
                return Err(invalid(format!(
                    "key field {} is assigned by the store, so records cannot be bootstrapped",
                    key_field.name()
                )));
            }
            let values: Vec<(&str, Value)> = record
                .values
                .iter()
                .map(|(field, value)| (field.as_str(), value.clone()))
                .collect();
            let values = registry
                .validate_values(record_type.name(), &values)
                .map_err(|e| invalid(e.to_string()))?;
            let key = values
                .iter()
                .find(|(field, _)| field == key_field.name())
                .map(|(_, value)| value.clone())
                .ok_or_else(|| invalid(format!("missing key field {}", key_field.name())))?;
            records.push(PreparedRecord {
                record_type: record_type.name().to_string(),
                key,
                values,
            });
        }
        Ok(PreparedTask {
            name: task.name,
            priority: task.priority,
            records,
        })
    }

    /// Returns (inserted, skipped). The transaction is rolled back on any
    /// error when it is dropped.
    fn run_task(&self, task: &PreparedTask) -> Result<(usize, usize), BootstrapError> {
        let mut tx = self.store.start_transaction()?;
        let (mut inserted, mut skipped) = (0, 0);
        for record in &task.records {
            match tx.get(&record.record_type, &record.key)? {
                Some(existing) if existing.values() == record.values.as_slice() => {
                    tracing::debug!(record_type = %record.record_type, key = %record.key, "record exists, skipping");
                    skipped += 1;
                }
                Some(_) => {
                    return Err(BootstrapError::Conflict {
                        task: task.name.clone(),
                        record_type: record.record_type.clone(),
                        key: record.key.to_string(),
                    });
                }
                None => {
                    let values: Vec<(&str, Value)> = record
                        .values
                        .iter()
                        .map(|(field, value)| (field.as_str(), value.clone()))
                        .collect();
                    tx.insert(&record.record_type, &values)?;
                    inserted += 1;
                }
            }
        }
        tx.commit()?;
        Ok((inserted, skipped))
    }
}
