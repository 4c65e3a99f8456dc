use std::sync::Arc;

use serde::Deserialize;

/// Translates identifiers between canonical form and the physical form a
/// database dialect stores and reports.
///
/// Everything above the storage backends is written against this trait only.
pub trait DatabaseVariantHandler: Send + Sync {
    fn to_physical_form(&self, canonical: &str) -> String;
    fn to_canonical_form(&self, physical: &str) -> String;
    /// Whether a named schema must be created before tables can live in it.
    fn requires_schema_creation(&self) -> bool;
}

/// SQLite keeps identifiers exactly as declared and every table lives in
/// the `main` database.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteVariant;

impl DatabaseVariantHandler for SqliteVariant {
    fn to_physical_form(&self, canonical: &str) -> String {
        canonical.to_string()
    }

    fn to_canonical_form(&self, physical: &str) -> String {
        physical.to_string()
    }

    fn requires_schema_creation(&self) -> bool {
        false
    }
}

/// Engines that fold identifiers to upper case (HSQLDB, H2 and friends).
/// Used for the in-memory local database.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpperCaseVariant;

impl DatabaseVariantHandler for UpperCaseVariant {
    fn to_physical_form(&self, canonical: &str) -> String {
        canonical.to_ascii_uppercase()
    }

    fn to_canonical_form(&self, physical: &str) -> String {
        physical.to_ascii_lowercase()
    }

    fn requires_schema_creation(&self) -> bool {
        true
    }
}

/// PostgreSQL folds unquoted identifiers to lower case and keeps tables in
/// an explicitly created schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresVariant;

impl DatabaseVariantHandler for PostgresVariant {
    fn to_physical_form(&self, canonical: &str) -> String {
        canonical.to_ascii_lowercase()
    }

    fn to_canonical_form(&self, physical: &str) -> String {
        physical.to_ascii_lowercase()
    }

    fn requires_schema_creation(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Sqlite,
    UpperCase,
    Postgres,
}

pub fn variant_for(kind: VariantKind) -> Arc<dyn DatabaseVariantHandler> {
    match kind {
        VariantKind::Sqlite => Arc::new(SqliteVariant),
        VariantKind::UpperCase => Arc::new(UpperCaseVariant),
        VariantKind::Postgres => Arc::new(PostgresVariant),
    }
}
