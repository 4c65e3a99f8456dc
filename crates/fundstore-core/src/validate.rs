use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use crate::{
    schema::{ColumnInfo, ColumnType, TableDef},
    storage::StorageError,
    store::{Store, Transaction},
};

/// One difference between the registry and a live database. Names are
/// canonical.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDiscrepancy {
    MissingSchema {
        schema: String,
    },
    MissingTable {
        table: String,
    },
    MissingColumn {
        table: String,
        column: String,
    },
    TypeMismatch {
        table: String,
        column: String,
        expected: ColumnType,
        actual: String,
    },
    NullabilityMismatch {
        table: String,
        column: String,
        expected_nullable: bool,
    },
    ExtraTable {
        table: String,
    },
    ExtraColumn {
        table: String,
        column: String,
    },
}

impl Display for SchemaDiscrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaDiscrepancy::MissingSchema { schema } => write!(f, "missing schema {}", schema),
            SchemaDiscrepancy::MissingTable { table } => write!(f, "missing table {}", table),
            SchemaDiscrepancy::MissingColumn { table, column } => {
                write!(f, "missing column {}.{}", table, column)
            }
            SchemaDiscrepancy::TypeMismatch {
                table,
                column,
                expected,
                actual,
            } => write!(
                f,
                "column {}.{} should be {} but is declared {}",
                table, column, expected, actual
            ),
            SchemaDiscrepancy::NullabilityMismatch {
                table,
                column,
                expected_nullable,
            } => {
                let expected = if *expected_nullable { "nullable" } else { "not null" };
                write!(f, "column {}.{} should be {}", table, column, expected)
            }
            SchemaDiscrepancy::ExtraTable { table } => write!(f, "extra table {}", table),
            SchemaDiscrepancy::ExtraColumn { table, column } => {
                write!(f, "extra column {}.{}", table, column)
            }
        }
    }
}

/// The full result of one validation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    discrepancies: Vec<SchemaDiscrepancy>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.discrepancies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.discrepancies.is_empty()
    }

    pub fn discrepancies(&self) -> &[SchemaDiscrepancy] {
        &self.discrepancies
    }
}

impl From<Vec<SchemaDiscrepancy>> for ValidationReport {
    fn from(discrepancies: Vec<SchemaDiscrepancy>) -> Self {
        Self { discrepancies }
    }
}

impl Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for discrepancy in &self.discrepancies {
            writeln!(f, "  - {}", discrepancy)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOptions {
    /// Also report tables and columns the registry does not know about.
    pub flag_extra: bool,
}

/// Read-only audit of a live database against the registry.
pub struct SchemaValidator {
    store: Store,
    options: ValidationOptions,
}

impl SchemaValidator {
    pub fn new(store: &Store) -> Self {
        Self::with_options(store, ValidationOptions::default())
    }

    pub fn with_options(store: &Store, options: ValidationOptions) -> Self {
        Self {
            store: store.clone(),
            options,
        }
    }

    /// Fails with `SchemaValidation` listing every discrepancy found.
    pub fn validate_schema(&self) -> Result<ValidationReport, StorageError> {
        let report = self.discrepancies()?;
        if report.is_clean() {
            tracing::info!(backend = self.store.backend_name(), "schema validated");
            Ok(report)
        } else {
            tracing::warn!(count = report.len(), "schema validation found discrepancies");
            Err(StorageError::SchemaValidation(report))
        }
    }

    /// Collects discrepancies without treating them as an error.
    pub fn discrepancies(&self) -> Result<ValidationReport, StorageError> {
        let mut tx = self.store.start_transaction()?;
        let result = self.collect(&mut tx);
        tx.rollback()?;
        result.map(|discrepancies| ValidationReport { discrepancies })
    }

    fn collect(&self, tx: &mut Transaction) -> Result<Vec<SchemaDiscrepancy>, StorageError> {
        let variant = self.store.variant().clone();
        let model = self.store.model();
        let schema = self.store.physical_schema();
        let mut discrepancies = Vec::new();

        if let Some(schema) = &schema {
            if !tx.backend_mut().schema_exists(schema)? {
                discrepancies.push(SchemaDiscrepancy::MissingSchema {
                    schema: self.store.schema_name().to_string(),
                });
                for table in model.tables() {
                    discrepancies.push(SchemaDiscrepancy::MissingTable {
                        table: table.name.clone(),
                    });
                }
                return Ok(discrepancies);
            }
        }

        let physical_tables: HashMap<String, String> = tx
            .backend_mut()
            .tables(schema.as_deref())?
            .into_iter()
            .map(|physical| (variant.to_canonical_form(&physical), physical))
            .collect();

        for table in model.tables() {
            match physical_tables.get(&table.name) {
                Some(physical) => {
                    let name = self.store.table_name(physical);
                    let columns = tx.backend_mut().columns(&name)?;
                    self.compare_table(table, &columns, &mut discrepancies);
                }
                None => discrepancies.push(SchemaDiscrepancy::MissingTable {
                    table: table.name.clone(),
                }),
            }
        }

        if self.options.flag_extra {
            let mut extra: Vec<&String> = physical_tables
                .keys()
                .filter(|canonical| model.table(canonical).is_none())
                .collect();
            extra.sort();
            for table in extra {
                discrepancies.push(SchemaDiscrepancy::ExtraTable {
                    table: table.clone(),
                });
            }
        }

        Ok(discrepancies)
    }

    fn compare_table(
        &self,
        table: &TableDef,
        columns: &[ColumnInfo],
        discrepancies: &mut Vec<SchemaDiscrepancy>,
    ) {
        compare_columns(
            self.store.variant().as_ref(),
            table,
            columns,
            self.options.flag_extra,
            discrepancies,
        );
    }
}

/// Compares expected columns with live ones. Shared with deployment, which
/// reports drift instead of failing on it.
pub(crate) fn compare_columns(
    variant: &dyn crate::variant::DatabaseVariantHandler,
    table: &TableDef,
    columns: &[ColumnInfo],
    flag_extra: bool,
    discrepancies: &mut Vec<SchemaDiscrepancy>,
) {
    let live: HashMap<String, &ColumnInfo> = columns
        .iter()
        .map(|c| (variant.to_canonical_form(&c.name), c))
        .collect();

    for expected in &table.columns {
        let Some(actual) = live.get(&expected.name) else {
            discrepancies.push(SchemaDiscrepancy::MissingColumn {
                table: table.name.clone(),
                column: expected.name.clone(),
            });
            continue;
        };
        if actual.column_type != Some(expected.column_type) {
            discrepancies.push(SchemaDiscrepancy::TypeMismatch {
                table: table.name.clone(),
                column: expected.name.clone(),
                expected: expected.column_type,
                actual: actual.declared_type.clone(),
            });
        }
        if actual.nullable != expected.nullable {
            discrepancies.push(SchemaDiscrepancy::NullabilityMismatch {
                table: table.name.clone(),
                column: expected.name.clone(),
                expected_nullable: expected.nullable,
            });
        }
    }

    if flag_extra {
        for column in columns {
            let canonical = variant.to_canonical_form(&column.name);
            if table.column(&canonical).is_none() {
                discrepancies.push(SchemaDiscrepancy::ExtraColumn {
                    table: table.name.clone(),
                    column: canonical,
                });
            }
        }
    }
}
