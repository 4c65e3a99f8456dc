use std::{
    collections::HashSet,
    fmt::{self, Display},
};

use crate::{
    schema::TableDef,
    storage::StorageError,
    store::{Store, Transaction},
    validate::{compare_columns, SchemaDiscrepancy, SchemaValidator, ValidationReport},
};

/// A physical change made by a deployment. Names are canonical.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    CreatedSchema { schema: String },
    CreatedTable { table: String },
    AddedColumn { table: String, column: String },
    CreatedIndex { table: String, index: String },
}

impl Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::CreatedSchema { schema } => write!(f, "created schema {}", schema),
            SchemaChange::CreatedTable { table } => write!(f, "created table {}", table),
            SchemaChange::AddedColumn { table, column } => {
                write!(f, "added column {}.{}", table, column)
            }
            SchemaChange::CreatedIndex { table, index } => {
                write!(f, "created index {} on {}", index, table)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentReport {
    /// Changes applied, in the order they were committed.
    pub changes: Vec<SchemaChange>,
    /// Differences deployment will not fix: extra columns and drift on
    /// existing columns.
    pub flagged: Vec<SchemaDiscrepancy>,
}

impl DeploymentReport {
    pub fn is_unchanged(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Brings a live database up to the registry, additively.
///
/// Each record type is applied in its own transaction. A failure stops the
/// run but keeps the types already applied; running again is always safe.
pub struct SchemaDeploymentTask {
    store: Store,
}

impl SchemaDeploymentTask {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
        }
    }

    pub fn deploy(&self) -> Result<DeploymentReport, StorageError> {
        let mut report = DeploymentReport::default();

        if let Some(schema) = self.store.physical_schema() {
            self.ensure_schema(&schema, &mut report)
                .map_err(|e| StorageError::SchemaCreation {
                    schema: self.store.schema_name().to_string(),
                    source: Box::new(e),
                })?;
        }

        for table in self.store.model().tables() {
            let mut changes = Vec::new();
            let mut flagged = Vec::new();
            self.deploy_table(table, &mut changes, &mut flagged)
                .map_err(|e| {
                    tracing::error!(record_type = %table.name, error = %e, "schema deployment failed");
                    StorageError::SchemaDeployment {
                        record_type: table.name.clone(),
                        source: Box::new(e),
                    }
                })?;
            report.changes.extend(changes);
            report.flagged.extend(flagged);
        }

        tracing::info!(
            backend = self.store.backend_name(),
            changes = report.changes.len(),
            flagged = report.flagged.len(),
            "schema deployment complete"
        );
        Ok(report)
    }

    /// Deploys, then validates what is left. Returns the remaining
    /// discrepancies, which are empty after a successful update.
    pub fn update_schema(&self) -> Result<(DeploymentReport, ValidationReport), StorageError> {
        let report = self.deploy()?;
        let remaining = SchemaValidator::new(&self.store).discrepancies()?;
        Ok((report, remaining))
    }

    fn ensure_schema(&self, schema: &str, report: &mut DeploymentReport) -> Result<(), StorageError> {
        let mut tx = self.store.start_transaction()?;
        if tx.backend_mut().schema_exists(schema)? {
            return tx.rollback();
        }
        tx.backend_mut().create_schema(schema)?;
        tx.commit()?;
        tracing::info!(schema, "schema was created");
        report.changes.push(SchemaChange::CreatedSchema {
            schema: self.store.schema_name().to_string(),
        });
        Ok(())
    }

    fn deploy_table(
        &self,
        table: &TableDef,
        changes: &mut Vec<SchemaChange>,
        flagged: &mut Vec<SchemaDiscrepancy>,
    ) -> Result<(), StorageError> {
        let mut tx = self.store.start_transaction()?;
        let variant = self.store.variant().clone();
        let physical = table.to_physical(variant.as_ref());
        let name = self.store.table_name(&physical.name);

        let exists = tx
            .backend_mut()
            .tables(name.schema.as_deref())?
            .iter()
            .any(|t| variant.to_canonical_form(t) == table.name);

        if !exists {
            tx.backend_mut().create_table(&name, &physical)?;
            tracing::info!(table = %name, "table was created");
            changes.push(SchemaChange::CreatedTable {
                table: table.name.clone(),
            });
        } else {
            let columns = tx.backend_mut().columns(&name)?;
            let mut discrepancies = Vec::new();
            compare_columns(variant.as_ref(), table, &columns, true, &mut discrepancies);
            for discrepancy in discrepancies {
                match discrepancy {
                    SchemaDiscrepancy::MissingColumn { column, .. } => {
                        self.add_column(&mut tx, table, &column)?;
                        changes.push(SchemaChange::AddedColumn {
                            table: table.name.clone(),
                            column,
                        });
                    }
                    SchemaDiscrepancy::ExtraColumn { .. } => {
                        // Columns are never dropped automatically.
                        tracing::warn!(discrepancy = %discrepancy, "extra column was detected");
                        flagged.push(discrepancy);
                    }
                    other => {
                        tracing::warn!(discrepancy = %other, "column differs from registry, leaving as is");
                        flagged.push(other);
                    }
                }
            }
        }

        self.ensure_indexes(&mut tx, table, changes)?;
        tx.commit()
    }

    fn add_column(&self, tx: &mut Transaction, table: &TableDef, column: &str) -> Result<(), StorageError> {
        let variant = self.store.variant().clone();
        let physical = table.to_physical(variant.as_ref());
        let name = self.store.table_name(&physical.name);
        let def = physical
            .column(&variant.to_physical_form(column))
            .ok_or_else(|| StorageError::UnknownField {
                record_type: table.name.clone(),
                field: column.to_string(),
            })?;
        if !def.nullable && def.default.is_none() && tx.backend_mut().count_rows(&name)? > 0 {
            return Err(StorageError::MissingDefault {
                table: name.to_string(),
                column: def.name.clone(),
            });
        }
        tx.backend_mut().add_column(&name, def)?;
        tracing::info!(table = %name, column, "column was added");
        Ok(())
    }

    fn ensure_indexes(
        &self,
        tx: &mut Transaction,
        table: &TableDef,
        changes: &mut Vec<SchemaChange>,
    ) -> Result<(), StorageError> {
        if table.indexes.is_empty() {
            return Ok(());
        }
        let variant = self.store.variant().clone();
        let physical = table.to_physical(variant.as_ref());
        let name = self.store.table_name(&physical.name);
        let existing: HashSet<String> = tx
            .backend_mut()
            .indexes(&name)?
            .iter()
            .map(|i| variant.to_canonical_form(i))
            .collect();
        for (index, physical_index) in table.indexes.iter().zip(&physical.indexes) {
            if existing.contains(&index.name) {
                continue;
            }
            tx.backend_mut().create_index(&name, physical_index)?;
            tracing::info!(table = %name, index = %physical_index.name, "index was created");
            changes.push(SchemaChange::CreatedIndex {
                table: table.name.clone(),
                index: index.name.clone(),
            });
        }
        Ok(())
    }
}
