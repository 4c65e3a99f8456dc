//! SQLite storage backend over an r2d2 connection pool.
//!
//! Tables live in the `main` database; SQLite has no `CREATE SCHEMA`, so this
//! backend pairs with [`fundstore_core::SqliteVariant`].

use std::{
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use fundstore_core::{
    quote_ident, sql_literal,
    value::{format_timestamp, parse_timestamp},
    BackendTransaction, ColumnDef, ColumnInfo, ColumnType, Filter, IndexDef, PoolOptions,
    StorageBackend, StorageError, TableDef, TableName, Value,
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, ErrorCode};
use rust_decimal::Decimal;

pub struct SqliteStorage {
    pool: Pool<SqliteConnectionManager>,
    tx_counter: AtomicU64,
}

impl SqliteStorage {
    /// Opens `path`, or a private in-memory database for `":memory:"`.
    ///
    /// Every connection of an in-memory pool would see its own database, so
    /// such a pool is capped at one connection that is never recycled.
    pub fn new(path: &str, options: &PoolOptions) -> Result<Self, StorageError> {
        let in_memory = path == ":memory:";
        let (manager, max_size) = if in_memory {
            (SqliteConnectionManager::memory(), 1)
        } else {
            (SqliteConnectionManager::file(path), options.max_connections.max(1))
        };
        let busy_timeout = options.connection_timeout;
        let manager = manager.with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });

        let mut builder = Pool::builder()
            .max_size(max_size)
            .connection_timeout(options.connection_timeout);
        if in_memory {
            builder = builder.max_lifetime(None).idle_timeout(None);
        }
        let pool = builder.build(manager).map_err(|e| {
            StorageError::ConnectionUnavailable(format!("failed to open SQLite database {}: {}", path, e))
        })?;

        tracing::info!(path, max_connections = max_size, "SQLite storage opened");
        Ok(Self {
            pool,
            tx_counter: AtomicU64::new(1),
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::new(":memory:", &PoolOptions::default())
    }
}

impl StorageBackend for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn begin_transaction(&self) -> Result<Box<dyn BackendTransaction>, StorageError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StorageError::ConnectionUnavailable(e.to_string()))?;
        // writers serialize here, waiting up to busy_timeout for the lock
        conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StorageError::ConnectionUnavailable(e.to_string())
            }
            _ => StorageError::Backend(e.to_string()),
        })?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(Box::new(SqliteTransaction {
            conn,
            tx_id,
            finished: false,
        }))
    }
}

pub struct SqliteTransaction {
    conn: PooledConnection<SqliteConnectionManager>,
    tx_id: u64,
    finished: bool,
}

fn schema_or_main(schema: Option<&str>) -> &str {
    schema.unwrap_or("main")
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "INTEGER",
        ColumnType::Text => "TEXT",
        // TEXT affinity keeps decimals exact
        ColumnType::Decimal => "DECIMAL_TEXT",
        ColumnType::Timestamp => "TIMESTAMP",
        ColumnType::Boolean => "BOOLEAN",
    }
}

fn column_type_of(declared: &str) -> Option<ColumnType> {
    match declared.to_ascii_uppercase().as_str() {
        "INTEGER" => Some(ColumnType::Integer),
        "TEXT" => Some(ColumnType::Text),
        "DECIMAL_TEXT" => Some(ColumnType::Decimal),
        "TIMESTAMP" => Some(ColumnType::Timestamp),
        "BOOLEAN" => Some(ColumnType::Boolean),
        _ => None,
    }
}

fn column_sql(column: &ColumnDef) -> String {
    let mut sql = format!("{} {}", quote_ident(&column.name), sql_type(column.column_type));
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&sql_literal(default));
    }
    sql
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Decimal(d) => SqlValue::Text(d.to_string()),
        Value::Timestamp(ts) => SqlValue::Text(format_timestamp(ts)),
        Value::Boolean(b) => SqlValue::Integer(*b as i64),
    }
}

/// Renders a filter with numbered placeholders continuing after `params`.
/// Decimals are stored as text and timestamps as RFC 3339 text, so both are
/// compared through SQLite's numeric and date functions.
fn where_sql(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    filter.to_sql(&mut |column, operator, value| {
        params.push(to_sql(value));
        let placeholder = format!("?{}", params.len());
        let name = quote_ident(&column.name);
        match column.column_type {
            ColumnType::Decimal => {
                format!("CAST({} AS REAL) {} CAST({} AS REAL)", name, operator, placeholder)
            }
            ColumnType::Timestamp => {
                format!("julianday({}) {} julianday({})", name, operator, placeholder)
            }
            _ => format!("{} {} {}", name, operator, placeholder),
        }
    })
}

fn from_sql(column: &ColumnDef, value: SqlValue) -> Result<Value, StorageError> {
    let converted = match (column.column_type, value) {
        (_, SqlValue::Null) => Some(Value::Null),
        (ColumnType::Integer, SqlValue::Integer(i)) => Some(Value::Integer(i)),
        (ColumnType::Text, SqlValue::Text(s)) => Some(Value::String(s)),
        (ColumnType::Decimal, SqlValue::Text(s)) => Decimal::from_str(&s).ok().map(Value::Decimal),
        (ColumnType::Decimal, SqlValue::Integer(i)) => Some(Value::Decimal(Decimal::from(i))),
        (ColumnType::Decimal, SqlValue::Real(f)) => Decimal::try_from(f).ok().map(Value::Decimal),
        (ColumnType::Timestamp, SqlValue::Text(s)) => parse_timestamp(&s).map(Value::Timestamp),
        (ColumnType::Boolean, SqlValue::Integer(i)) => Some(Value::Boolean(i != 0)),
        _ => None,
    };
    converted.ok_or_else(|| {
        StorageError::Backend(format!(
            "column {} holds a value that is not a valid {}",
            column.name, column.column_type
        ))
    })
}

impl BackendTransaction for SqliteTransaction {
    fn schema_exists(&mut self, schema: &str) -> Result<bool, StorageError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_database_list WHERE name = ?1",
                params![schema],
                |r| r.get(0),
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count > 0)
    }

    fn create_schema(&mut self, schema: &str) -> Result<(), StorageError> {
        Err(StorageError::Backend(format!(
            "SQLite cannot create schema {}; attach a database instead",
            schema
        )))
    }

    fn tables(&mut self, schema: Option<&str>) -> Result<Vec<String>, StorageError> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            quote_ident(schema_or_main(schema))
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(names)
    }

    fn columns(&mut self, table: &TableName) -> Result<Vec<ColumnInfo>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, type, \"notnull\" FROM pragma_table_info(?1, ?2) ORDER BY cid")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(
                params![table.table, schema_or_main(table.schema.as_deref())],
                |r| {
                    let declared: String = r.get(1)?;
                    Ok(ColumnInfo {
                        name: r.get(0)?,
                        column_type: column_type_of(&declared),
                        declared_type: declared,
                        nullable: r.get::<_, i64>(2)? == 0,
                    })
                },
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows)
    }

    fn indexes(&mut self, table: &TableName) -> Result<Vec<String>, StorageError> {
        // origin 'c' excludes the automatic primary key and unique indexes
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_index_list(?1, ?2) WHERE origin = 'c' ORDER BY name")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let names = stmt
            .query_map(
                params![table.table, schema_or_main(table.schema.as_deref())],
                |r| r.get::<_, String>(0),
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(names)
    }

    fn create_table(&mut self, table: &TableName, def: &TableDef) -> Result<(), StorageError> {
        let mut parts: Vec<String> = def.columns.iter().map(column_sql).collect();
        if let Some(pk) = &def.primary_key {
            parts.push(format!("PRIMARY KEY ({})", quote_ident(pk)));
        }
        let sql = format!("CREATE TABLE {} ({})", table.quoted(), parts.join(", "));
        tracing::debug!(sql = %sql, "creating table");
        self.conn
            .execute_batch(&sql)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn add_column(&mut self, table: &TableName, column: &ColumnDef) -> Result<(), StorageError> {
        let sql = format!("ALTER TABLE {} ADD COLUMN {}", table.quoted(), column_sql(column));
        self.conn
            .execute_batch(&sql)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn create_index(&mut self, table: &TableName, index: &IndexDef) -> Result<(), StorageError> {
        // SQLite qualifies the index, not the table
        let index_name = match &table.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&index.name)),
            None => quote_ident(&index.name),
        };
        let sql = format!(
            "CREATE INDEX {} ON {} ({})",
            index_name,
            quote_ident(&table.table),
            quote_ident(&index.column)
        );
        self.conn
            .execute_batch(&sql)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn insert_row(
        &mut self,
        table: &TableName,
        row: &[(ColumnDef, Value)],
        returning: Option<&ColumnDef>,
    ) -> Result<Option<Value>, StorageError> {
        let sql = if row.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table.quoted())
        } else {
            let columns: Vec<String> = row.iter().map(|(c, _)| quote_ident(&c.name)).collect();
            let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{}", i)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table.quoted(),
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        self.conn
            .execute(&sql, params_from_iter(row.iter().map(|(_, v)| to_sql(v))))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        // an INTEGER primary key is the rowid
        Ok(returning.map(|_| Value::Integer(self.conn.last_insert_rowid())))
    }

    fn update_rows(
        &mut self,
        table: &TableName,
        filter: &Filter,
        values: &[(ColumnDef, Value)],
    ) -> Result<u64, StorageError> {
        let assignments: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("{} = ?{}", quote_ident(&c.name), i + 1))
            .collect();
        let mut params: Vec<SqlValue> = values.iter().map(|(_, v)| to_sql(v)).collect();
        let condition = where_sql(filter, &mut params);
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            table.quoted(),
            assignments.join(", "),
            condition
        );
        let changed = self
            .conn
            .execute(&sql, params_from_iter(params))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(changed as u64)
    }

    fn select_rows(
        &mut self,
        table: &TableName,
        columns: &[ColumnDef],
        filter: Option<&Filter>,
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let mut sql = format!("SELECT {} FROM {}", names.join(", "), table.quoted());
        let mut params = Vec::new();
        if let Some(filter) = filter {
            let condition = where_sql(filter, &mut params);
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }
        sql.push_str(" ORDER BY rowid");

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let raw = stmt
            .query_map(params_from_iter(params), |r| {
                (0..columns.len())
                    .map(|i| r.get::<_, SqlValue>(i))
                    .collect::<Result<Vec<_>, _>>()
            })
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        raw.into_iter()
            .map(|row| {
                columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| from_sql(column, value))
                    .collect()
            })
            .collect()
    }

    fn count_rows(&mut self, table: &TableName) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table.quoted()), [], |r| r.get(0))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count as u64)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(tx_id = self.tx_id, error = %rollback, "rollback after failed commit failed");
            }
            return Err(StorageError::Commit(e.to_string()));
        }
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(tx_id = self.tx_id, error = %e, "failed to roll back SQLite transaction");
            }
        }
    }
}
