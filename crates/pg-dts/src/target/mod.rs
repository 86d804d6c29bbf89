//! Target-side applier: database/schema creation, bulk copy, per-row DML.
//!
//! Row values arrive in text form (pgoutput tuples, COPY text format) and
//! are embedded as quoted literals; the server coerces unknown-typed
//! literals to the column types, so no per-type mapping is needed on this
//! side.

pub mod rename;

use deadpool_postgres::Pool;
use futures::{SinkExt, StreamExt};
use tokio_postgres::error::SqlState;
use tracing::{debug, info, warn};

use crate::error::{DtsError, Result};
use crate::source::quote_ident;

/// An ordered set of column name / text value pairs for one row. `None` is
/// SQL NULL.
pub type RowValues = Vec<(String, Option<String>)>;

/// Applier over one target database pool.
pub struct TargetApplier {
    pool: Pool,
}

impl TargetApplier {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// `CREATE DATABASE`, swallowing "already exists".
    ///
    /// Must run on a maintenance-database pool; CREATE DATABASE cannot run
    /// inside the target database itself.
    pub async fn ensure_database(&self, name: &str) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "creating database"))?;

        match client
            .execute(&format!("CREATE DATABASE {}", quote_ident(name)), &[])
            .await
        {
            Ok(_) => {
                info!(database = name, "created target database");
                Ok(())
            }
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_DATABASE) => {
                debug!(database = name, "target database already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replay one schema statement, swallowing "object already exists".
    pub async fn apply_schema_statement(&self, sql: &str) -> Result<()> {
        let sql = sql.trim();
        if sql.is_empty() || sql.starts_with("--") {
            return Ok(());
        }

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "replaying schema"))?;

        match client.batch_execute(sql).await {
            Ok(()) => Ok(()),
            Err(e) if is_duplicate_object(&e) => {
                debug!(statement = sql, "object already exists, skipping");
                Ok(())
            }
            Err(e) => Err(DtsError::Schema(format!("replaying `{sql}`: {e}"))),
        }
    }

    /// Stream a full table from `source` into this target.
    ///
    /// `COPY (SELECT … ORDER BY 1) TO STDOUT` on the source is piped byte
    /// for byte into `COPY … FROM STDIN` on the target. Returns the number
    /// of rows written.
    pub async fn copy_table(
        &self,
        source: &Pool,
        schema: &str,
        table: &str,
        target_table: &str,
        columns: &[String],
    ) -> Result<u64> {
        let qualified = format!("{schema}.{table}");
        let src_client = source
            .get()
            .await
            .map_err(|e| DtsError::pool(e, format!("reading {qualified}")))?;
        let dst_client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, format!("writing {qualified}")))?;

        let col_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let out_query = format!(
            "COPY (SELECT {col_list} FROM {}.{} ORDER BY 1) TO STDOUT",
            quote_ident(schema),
            quote_ident(table)
        );
        let in_query = format!(
            "COPY {}.{} ({col_list}) FROM STDIN",
            quote_ident(schema),
            quote_ident(target_table)
        );

        let stream = src_client
            .copy_out(&out_query)
            .await
            .map_err(|e| DtsError::copy(&qualified, format!("initiating COPY OUT: {e}")))?;
        let sink = dst_client
            .copy_in::<_, bytes::Bytes>(&in_query)
            .await
            .map_err(|e| DtsError::copy(&qualified, format!("initiating COPY IN: {e}")))?;

        futures::pin_mut!(stream);
        futures::pin_mut!(sink);

        while let Some(chunk) = stream.next().await {
            let bytes =
                chunk.map_err(|e| DtsError::copy(&qualified, format!("reading COPY data: {e}")))?;
            sink.send(bytes)
                .await
                .map_err(|e| DtsError::copy(&qualified, format!("writing COPY data: {e}")))?;
        }

        let rows = sink
            .finish()
            .await
            .map_err(|e| DtsError::copy(&qualified, format!("finishing COPY: {e}")))?;

        info!(table = %qualified, target = target_table, rows, "table copied");
        Ok(rows)
    }

    /// Row count on the target.
    pub async fn get_table_count(&self, schema: &str, table: &str) -> Result<i64> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "counting target rows"))?;
        let row = client
            .query_one(
                &format!(
                    "SELECT count(*)::int8 FROM {}.{}",
                    quote_ident(schema),
                    quote_ident(table)
                ),
                &[],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Apply one replicated INSERT.
    pub async fn apply_insert(&self, schema: &str, table: &str, values: &RowValues) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "applying insert"))?;
        client.batch_execute(&build_insert(schema, table, values)).await?;
        Ok(())
    }

    /// Apply one replicated UPDATE. A missing row is a no-op.
    pub async fn apply_update(
        &self,
        schema: &str,
        table: &str,
        old_values: &RowValues,
        new_values: &RowValues,
    ) -> Result<()> {
        if old_values.is_empty() || new_values.is_empty() {
            return Ok(());
        }
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "applying update"))?;
        client
            .batch_execute(&build_update(schema, table, old_values, new_values))
            .await?;
        Ok(())
    }

    /// Apply one replicated DELETE. A missing row is a no-op.
    pub async fn apply_delete(&self, schema: &str, table: &str, values: &RowValues) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "applying delete"))?;
        client.batch_execute(&build_delete(schema, table, values)).await?;
        Ok(())
    }

    /// Best-effort TRUNCATE of the given qualified target tables.
    pub async fn apply_truncate(&self, tables: &[String]) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "applying truncate"))?;
        let sql = format!("TRUNCATE TABLE {}", tables.join(", "));
        if let Err(e) = client.batch_execute(&sql).await {
            warn!(error = %e, tables = ?tables, "truncate failed, continuing");
        }
        Ok(())
    }
}

/// True for the SQLSTATEs raised when a replayed schema object already
/// exists on the target.
fn is_duplicate_object(e: &tokio_postgres::Error) -> bool {
    matches!(
        e.code(),
        Some(&SqlState::DUPLICATE_TABLE)
            | Some(&SqlState::DUPLICATE_OBJECT)
            | Some(&SqlState::DUPLICATE_SCHEMA)
            | Some(&SqlState::DUPLICATE_DATABASE)
            | Some(&SqlState::UNIQUE_VIOLATION)
    )
}

/// Quote a text value as a SQL literal; `None` becomes NULL.
fn quote_literal(value: &Option<String>) -> String {
    match value {
        Some(v) => format!("'{}'", v.replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

/// `INSERT INTO s.t (a, b) VALUES ('1', NULL)`.
fn build_insert(schema: &str, table: &str, values: &RowValues) -> String {
    let cols = values
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");
    let vals = values
        .iter()
        .map(|(_, v)| quote_literal(v))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {}.{} ({cols}) VALUES ({vals})",
        quote_ident(schema),
        quote_ident(table)
    )
}

/// NULL-safe WHERE over the old tuple: `col IS NOT DISTINCT FROM 'v'`.
fn null_safe_where(values: &RowValues) -> String {
    values
        .iter()
        .map(|(name, v)| format!("{} IS NOT DISTINCT FROM {}", quote_ident(name), quote_literal(v)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `UPDATE s.t SET a = 'v' WHERE b IS NOT DISTINCT FROM 'w'`.
fn build_update(schema: &str, table: &str, old_values: &RowValues, new_values: &RowValues) -> String {
    let sets = new_values
        .iter()
        .map(|(name, v)| format!("{} = {}", quote_ident(name), quote_literal(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {}.{} SET {sets} WHERE {}",
        quote_ident(schema),
        quote_ident(table),
        null_safe_where(old_values)
    )
}

/// `DELETE FROM s.t WHERE a IS NOT DISTINCT FROM 'v'`.
fn build_delete(schema: &str, table: &str, values: &RowValues) -> String {
    format!(
        "DELETE FROM {}.{} WHERE {}",
        quote_ident(schema),
        quote_ident(table),
        null_safe_where(values)
    )
}
