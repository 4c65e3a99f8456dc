//! PostgreSQL storage backend over an r2d2 connection pool.

use std::sync::atomic::{AtomicU64, Ordering};

use fundstore_core::{
    quote_ident, sql_literal, BackendTransaction, ColumnDef, ColumnInfo, ColumnType, Filter,
    IndexDef, PoolOptions, StorageBackend, StorageError, TableDef, TableName, Value,
};
use postgres::{types::ToSql, Client, NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use rust_decimal::Decimal;
use time::OffsetDateTime;

type Manager = PostgresConnectionManager<NoTls>;

pub struct PostgresStorage {
    pool: Pool<Manager>,
    tx_counter: AtomicU64,
}

impl PostgresStorage {
    pub fn new(connection_string: &str, options: &PoolOptions) -> Result<Self, StorageError> {
        let config: postgres::Config = connection_string
            .parse()
            .map_err(|e| StorageError::Config(format!("invalid PostgreSQL connection string: {}", e)))?;
        let pool = Pool::builder()
            .max_size(options.max_connections.max(1))
            .connection_timeout(options.connection_timeout)
            .build(PostgresConnectionManager::new(config, NoTls))
            .map_err(|e| StorageError::ConnectionUnavailable(format!("PostgreSQL connection failed: {}", e)))?;
        tracing::info!(max_connections = options.max_connections, "PostgreSQL storage opened");
        Ok(Self {
            pool,
            tx_counter: AtomicU64::new(1),
        })
    }
}

impl StorageBackend for PostgresStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn begin_transaction(&self) -> Result<Box<dyn BackendTransaction>, StorageError> {
        let mut client = self
            .pool
            .get()
            .map_err(|e| StorageError::ConnectionUnavailable(e.to_string()))?;
        client
            .batch_execute("BEGIN")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "PostgreSQL transaction started");
        Ok(Box::new(PostgresTransaction {
            client,
            tx_id,
            finished: false,
            aborted: false,
        }))
    }
}

/// Every statement runs inside its own savepoint, so a failed statement is
/// undone on its own and the transaction stays usable. `aborted` is set only
/// when that recovery itself fails.
pub struct PostgresTransaction {
    client: PooledConnection<Manager>,
    tx_id: u64,
    finished: bool,
    aborted: bool,
}

const STATEMENT_SAVEPOINT: &str = "fundstore_statement";

type Param = Box<dyn ToSql + Sync>;

fn schema_or_public(schema: Option<&str>) -> &str {
    schema.unwrap_or("public")
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "BIGINT",
        ColumnType::Text => "TEXT",
        ColumnType::Decimal => "NUMERIC",
        ColumnType::Timestamp => "TIMESTAMPTZ",
        ColumnType::Boolean => "BOOLEAN",
    }
}

/// Maps `information_schema.columns.data_type` back to a column type.
fn column_type_of(data_type: &str) -> Option<ColumnType> {
    match data_type {
        "bigint" => Some(ColumnType::Integer),
        "text" => Some(ColumnType::Text),
        "numeric" => Some(ColumnType::Decimal),
        "timestamp with time zone" => Some(ColumnType::Timestamp),
        "boolean" => Some(ColumnType::Boolean),
        _ => None,
    }
}

fn column_sql(column: &ColumnDef) -> String {
    let mut sql = format!("{} {}", quote_ident(&column.name), sql_type(column.column_type));
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if column.auto_increment {
        sql.push_str(" GENERATED BY DEFAULT AS IDENTITY");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&sql_literal(default));
    }
    sql
}

/// Boxes a value as a parameter. NULLs take the type of their column so the
/// server never has to guess.
fn to_param(column: &ColumnDef, value: &Value) -> Param {
    match value {
        Value::Null => match column.column_type {
            ColumnType::Integer => Box::new(None::<i64>),
            ColumnType::Text => Box::new(None::<String>),
            ColumnType::Decimal => Box::new(None::<Decimal>),
            ColumnType::Timestamp => Box::new(None::<OffsetDateTime>),
            ColumnType::Boolean => Box::new(None::<bool>),
        },
        Value::Integer(i) => Box::new(*i),
        Value::String(s) => Box::new(s.clone()),
        Value::Decimal(d) => Box::new(*d),
        Value::Timestamp(ts) => Box::new(*ts),
        Value::Boolean(b) => Box::new(*b),
    }
}

/// Renders a filter with `$n` placeholders continuing after `params`.
fn where_sql(filter: &Filter, params: &mut Vec<Param>) -> String {
    filter.to_sql(&mut |column, operator, value| {
        params.push(to_param(column, value));
        format!("{} {} ${}", quote_ident(&column.name), operator, params.len())
    })
}

fn param_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p.as_ref()).collect()
}

fn from_row(row: &Row, index: usize, column: &ColumnDef) -> Result<Value, StorageError> {
    let value = match column.column_type {
        ColumnType::Integer => row.try_get::<_, Option<i64>>(index).map(|v| v.map(Value::Integer)),
        ColumnType::Text => row.try_get::<_, Option<String>>(index).map(|v| v.map(Value::String)),
        ColumnType::Decimal => row.try_get::<_, Option<Decimal>>(index).map(|v| v.map(Value::Decimal)),
        ColumnType::Timestamp => row
            .try_get::<_, Option<OffsetDateTime>>(index)
            .map(|v| v.map(Value::Timestamp)),
        ColumnType::Boolean => row.try_get::<_, Option<bool>>(index).map(|v| v.map(Value::Boolean)),
    };
    value
        .map(|v| v.unwrap_or(Value::Null))
        .map_err(|e| StorageError::Backend(format!("column {}: {}", column.name, e)))
}

impl PostgresTransaction {
    fn guarded<T>(
        &mut self,
        run: impl FnOnce(&mut Client) -> Result<T, postgres::Error>,
    ) -> Result<T, StorageError> {
        if self.aborted {
            return Err(StorageError::Backend(
                "transaction was aborted by an earlier failure".to_string(),
            ));
        }
        if let Err(e) = self
            .client
            .batch_execute(&format!("SAVEPOINT {}", STATEMENT_SAVEPOINT))
        {
            self.aborted = true;
            return Err(StorageError::Backend(e.to_string()));
        }
        match run(&mut *self.client) {
            Ok(result) => {
                self.client
                    .batch_execute(&format!("RELEASE SAVEPOINT {}", STATEMENT_SAVEPOINT))
                    .map_err(|e| {
                        self.aborted = true;
                        StorageError::Backend(e.to_string())
                    })?;
                Ok(result)
            }
            Err(e) => {
                let undo = format!(
                    "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
                    STATEMENT_SAVEPOINT
                );
                if let Err(undo_error) = self.client.batch_execute(&undo) {
                    tracing::warn!(tx_id = self.tx_id, error = %undo_error, "could not undo failed statement");
                    self.aborted = true;
                }
                Err(StorageError::Backend(e.to_string()))
            }
        }
    }

    fn batch(&mut self, sql: &str) -> Result<(), StorageError> {
        self.guarded(|client| client.batch_execute(sql))
    }

    fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64, StorageError> {
        let refs = param_refs(params);
        self.guarded(|client| client.execute(sql, &refs))
    }

    fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, StorageError> {
        self.guarded(|client| client.query(sql, params))
    }

    fn names(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<String>, StorageError> {
        let rows = self.query(sql, params)?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }
}

impl BackendTransaction for PostgresTransaction {
    fn schema_exists(&mut self, schema: &str) -> Result<bool, StorageError> {
        let found = self.names(
            "SELECT schema_name::text FROM information_schema.schemata WHERE schema_name = $1::text",
            &[&schema],
        )?;
        Ok(!found.is_empty())
    }

    fn create_schema(&mut self, schema: &str) -> Result<(), StorageError> {
        self.batch(&format!("CREATE SCHEMA {}", quote_ident(schema)))
    }

    fn tables(&mut self, schema: Option<&str>) -> Result<Vec<String>, StorageError> {
        let schema = schema_or_public(schema);
        self.names(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1::text AND table_type = 'BASE TABLE' ORDER BY table_name",
            &[&schema],
        )
    }

    fn columns(&mut self, table: &TableName) -> Result<Vec<ColumnInfo>, StorageError> {
        let schema = schema_or_public(table.schema.as_deref());
        let rows = self.query(
            "SELECT column_name::text, data_type::text, is_nullable::text \
             FROM information_schema.columns \
             WHERE table_schema = $1::text AND table_name = $2::text ORDER BY ordinal_position",
            &[&schema, &table.table],
        )?;
        Ok(rows
            .iter()
            .map(|r| {
                let data_type: String = r.get(1);
                ColumnInfo {
                    name: r.get(0),
                    column_type: column_type_of(&data_type),
                    declared_type: data_type,
                    nullable: r.get::<_, String>(2) == "YES",
                }
            })
            .collect())
    }

    fn indexes(&mut self, table: &TableName) -> Result<Vec<String>, StorageError> {
        let schema = schema_or_public(table.schema.as_deref());
        self.names(
            "SELECT i.relname::text FROM pg_index x \
             JOIN pg_class i ON i.oid = x.indexrelid \
             JOIN pg_class t ON t.oid = x.indrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             WHERE n.nspname = $1 AND t.relname = $2 AND NOT x.indisprimary \
             ORDER BY i.relname",
            &[&schema, &table.table],
        )
    }

    fn create_table(&mut self, table: &TableName, def: &TableDef) -> Result<(), StorageError> {
        let mut parts: Vec<String> = def.columns.iter().map(column_sql).collect();
        if let Some(pk) = &def.primary_key {
            parts.push(format!("PRIMARY KEY ({})", quote_ident(pk)));
        }
        let sql = format!("CREATE TABLE {} ({})", table.quoted(), parts.join(", "));
        tracing::debug!(sql = %sql, "creating table");
        self.batch(&sql)
    }

    fn add_column(&mut self, table: &TableName, column: &ColumnDef) -> Result<(), StorageError> {
        let sql = format!("ALTER TABLE {} ADD COLUMN {}", table.quoted(), column_sql(column));
        self.batch(&sql)
    }

    fn create_index(&mut self, table: &TableName, index: &IndexDef) -> Result<(), StorageError> {
        let sql = format!(
            "CREATE INDEX {} ON {} ({})",
            quote_ident(&index.name),
            table.quoted(),
            quote_ident(&index.column)
        );
        self.batch(&sql)
    }

    fn insert_row(
        &mut self,
        table: &TableName,
        row: &[(ColumnDef, Value)],
        returning: Option<&ColumnDef>,
    ) -> Result<Option<Value>, StorageError> {
        let mut sql = if row.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table.quoted())
        } else {
            let columns: Vec<String> = row.iter().map(|(c, _)| quote_ident(&c.name)).collect();
            let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("${}", i)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table.quoted(),
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        let params: Vec<_> = row.iter().map(|(c, v)| to_param(c, v)).collect();
        let Some(column) = returning else {
            self.execute(&sql, &params)?;
            return Ok(None);
        };
        sql.push_str(" RETURNING ");
        sql.push_str(&quote_ident(&column.name));
        let rows = self.query(&sql, &param_refs(&params))?;
        let generated = rows
            .first()
            .ok_or_else(|| StorageError::Backend(format!("INSERT into {} returned no row", table)))?;
        from_row(generated, 0, column).map(Some)
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
            .map(|(i, (c, _))| format!("{} = ${}", quote_ident(&c.name), i + 1))
            .collect();
        let mut params: Vec<_> = values.iter().map(|(c, v)| to_param(c, v)).collect();
        let condition = where_sql(filter, &mut params);
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            table.quoted(),
            assignments.join(", "),
            condition
        );
        self.execute(&sql, &params)
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
        let rows = self.query(&sql, &param_refs(&params))?;
        rows.iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| from_row(row, i, column))
                    .collect()
            })
            .collect()
    }

    fn count_rows(&mut self, table: &TableName) -> Result<u64, StorageError> {
        let rows = self.query(&format!("SELECT COUNT(*) FROM {}", table.quoted()), &[])?;
        let count: i64 = rows
            .first()
            .map(|r| r.get(0))
            .ok_or_else(|| StorageError::Backend(format!("no row count for {}", table)))?;
        Ok(count as u64)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        if self.aborted {
            if let Err(e) = self.client.batch_execute("ROLLBACK") {
                tracing::warn!(tx_id = self.tx_id, error = %e, "rollback of aborted transaction failed");
            }
            return Err(StorageError::Commit(
                "transaction was aborted by an earlier failure and has been rolled back".to_string(),
            ));
        }
        if let Err(e) = self.client.batch_execute("COMMIT") {
            if let Err(rollback) = self.client.batch_execute("ROLLBACK") {
                tracing::warn!(tx_id = self.tx_id, error = %rollback, "rollback after failed commit failed");
            }
            return Err(StorageError::Commit(e.to_string()));
        }
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.client
            .batch_execute("ROLLBACK")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.client.batch_execute("ROLLBACK") {
                tracing::warn!(tx_id = self.tx_id, error = %e, "failed to roll back PostgreSQL transaction");
            }
        }
    }
}
