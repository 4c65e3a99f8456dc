use std::fmt::{self, Display};

use crate::{
    registry::{FieldType, RecordTypeRegistry},
    storage::StorageError,
    value::Value,
    variant::DatabaseVariantHandler,
};

/// Storage-level column types. Each backend maps these to its own DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
    Decimal,
    Timestamp,
    Boolean,
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Integer => "integer",
            ColumnType::Text => "text",
            ColumnType::Decimal => "decimal",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<Value>,
    /// Key column whose values the database assigns on insert.
    pub auto_increment: bool,
}

/// A column as reported by a live database.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// `None` when the declared type is not one the backend produces.
    pub column_type: Option<ColumnType>,
    pub declared_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<String>,
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Renames the table, its columns and indexes into physical form.
    pub fn to_physical(&self, variant: &dyn DatabaseVariantHandler) -> TableDef {
        TableDef {
            name: variant.to_physical_form(&self.name),
            columns: self
                .columns
                .iter()
                .map(|c| ColumnDef {
                    name: variant.to_physical_form(&c.name),
                    ..c.clone()
                })
                .collect(),
            primary_key: self.primary_key.as_deref().map(|k| variant.to_physical_form(k)),
            indexes: self
                .indexes
                .iter()
                .map(|i| IndexDef {
                    name: variant.to_physical_form(&i.name),
                    column: variant.to_physical_form(&i.column),
                })
                .collect(),
        }
    }
}

/// Physical, schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub table: String,
}

impl TableName {
    pub fn new(schema: Option<&str>, table: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            table: table.to_string(),
        }
    }

    /// Double-quoted, dot-joined form accepted by SQLite and PostgreSQL.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.table)),
            None => quote_ident(&self.table),
        }
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => f.write_str(&self.table),
        }
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// SQL literal for a column default. Decimals and timestamps are written as
/// quoted text and left to the column type to interpret.
pub fn sql_literal(value: &Value) -> String {
    let quote = |s: &str| format!("'{}'", s.replace('\'', "''"));
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::String(s) => quote(s),
        Value::Decimal(d) => quote(&d.to_string()),
        Value::Timestamp(ts) => quote(&crate::value::format_timestamp(ts)),
        Value::Boolean(true) => "TRUE".to_string(),
        Value::Boolean(false) => "FALSE".to_string(),
    }
}

/// Canonical table definitions derived from a sealed registry, in
/// registration order.
#[derive(Debug, Clone)]
pub struct SchemaModel {
    tables: Vec<TableDef>,
}

impl SchemaModel {
    pub fn build(registry: &RecordTypeRegistry) -> Result<Self, StorageError> {
        registry.ensure_sealed()?;
        let mut tables = Vec::with_capacity(registry.all().len());
        for record_type in registry.all() {
            let mut columns = Vec::with_capacity(record_type.fields().len());
            let mut indexes = Vec::new();
            for field in record_type.fields() {
                let column_type = match field.field_type() {
                    FieldType::Reference(target) => {
                        indexes.push(IndexDef {
                            name: format!("idx_{}_{}", record_type.name(), field.name()),
                            column: field.name().to_string(),
                        });
                        column_type(&registry.resolve_reference(target))
                    }
                    other => column_type(other),
                };
                columns.push(ColumnDef {
                    name: field.name().to_string(),
                    column_type,
                    nullable: field.is_nullable(),
                    default: field.default_value().cloned(),
                    auto_increment: field.is_auto_numbered(),
                });
            }
            tables.push(TableDef {
                name: record_type.name().to_string(),
                columns,
                primary_key: record_type.key().map(|k| k.name().to_string()),
                indexes,
            });
        }
        Ok(Self { tables })
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }
}

fn column_type(field_type: &FieldType) -> ColumnType {
    match field_type {
        FieldType::Integer => ColumnType::Integer,
        FieldType::String => ColumnType::Text,
        FieldType::Decimal => ColumnType::Decimal,
        FieldType::Timestamp => ColumnType::Timestamp,
        FieldType::Boolean => ColumnType::Boolean,
        // resolve_reference never yields a reference
        FieldType::Reference(_) => ColumnType::Integer,
    }
}
