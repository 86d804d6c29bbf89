//! Source-side introspection.
//!
//! Reads catalog metadata from a source database: business databases and
//! tables, column/index/constraint details, the `wal_level` precondition,
//! and exact row counts. Also owns the read-only toggle used during
//! switchover.

use deadpool_postgres::Pool;
use tokio_postgres::SimpleQueryMessage;
use tracing::debug;

use crate::error::{DtsError, Result};

/// A non-template database on the source instance.
#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    pub name: String,
    pub oid: u32,
}

/// A user table discovered on the source.
#[derive(Debug, Clone)]
pub struct BusinessTable {
    pub database: String,
    pub schema: String,
    pub table: String,
    pub oid: u32,
    pub indexes: Vec<String>,
}

/// Column metadata for DDL synthesis and appliers.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub default_value: String,
    pub is_primary_key: bool,
}

/// A non-primary index on a table.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// A non-primary-key constraint.
#[derive(Debug, Clone)]
pub struct ConstraintInfo {
    pub name: String,
    /// UNIQUE, CHECK or FOREIGN KEY.
    pub kind: String,
    /// Raw definition from `pg_get_constraintdef`.
    pub definition: String,
}

/// Full description of one table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub constraints: Vec<ConstraintInfo>,
    /// Synthesized `CREATE TABLE` with the primary key inline.
    pub ddl: String,
}

impl TableInfo {
    /// The statements that recreate this table on a target, in replay order.
    /// Names are the source names; the suffix rewrite runs afterwards.
    pub fn schema_statements(&self) -> Vec<String> {
        let mut stmts = vec![self.ddl.clone()];
        for idx in &self.indexes {
            stmts.push(idx.definition.clone());
        }
        for c in &self.constraints {
            stmts.push(format!(
                "ALTER TABLE {}.{} ADD CONSTRAINT {} {}",
                self.schema, self.name, c.name, c.definition
            ));
        }
        stmts
    }
}

/// Introspection handle over one source database pool.
pub struct SourceInspector {
    pool: Pool,
}

impl SourceInspector {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// All databases except templates and the bootstrap `postgres` database.
    pub async fn list_business_databases(&self) -> Result<Vec<DatabaseInfo>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "listing databases"))?;

        let rows = client
            .query(
                "SELECT datname, oid FROM pg_database
                 WHERE datistemplate = false AND datname <> 'postgres'
                 ORDER BY datname",
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| DatabaseInfo {
                name: row.get(0),
                oid: row.get::<_, tokio_postgres::types::Oid>(1),
            })
            .collect())
    }

    /// User tables in the connected database: `relkind` r or p, oid above
    /// the bootstrap range, system schemas excluded.
    pub async fn list_business_tables(&self) -> Result<Vec<BusinessTable>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "listing business tables"))?;

        let rows = client
            .query(
                "SELECT current_database(), n.nspname, c.relname, c.oid
                 FROM pg_class c
                 JOIN pg_namespace n ON c.relnamespace = n.oid
                 WHERE c.relkind IN ('r', 'p')
                   AND c.oid > 16383
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema')
                 ORDER BY n.nspname, c.relname",
                &[],
            )
            .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let mut table = BusinessTable {
                database: row.get(0),
                schema: row.get(1),
                table: row.get(2),
                oid: row.get::<_, tokio_postgres::types::Oid>(3),
                indexes: Vec::new(),
            };
            let idx_rows = client
                .query(
                    "SELECT indexname FROM pg_catalog.pg_indexes
                     WHERE schemaname = $1 AND tablename = $2",
                    &[&table.schema, &table.table],
                )
                .await?;
            table.indexes = idx_rows.iter().map(|r| r.get(0)).collect();
            tables.push(table);
        }

        debug!(count = tables.len(), "discovered business tables");
        Ok(tables)
    }

    /// Columns, indexes, constraints and a synthesized CREATE TABLE.
    pub async fn get_table_info(&self, schema: &str, table: &str) -> Result<TableInfo> {
        let columns = self.get_columns(schema, table).await?;
        if columns.is_empty() {
            return Err(DtsError::Schema(format!(
                "table {schema}.{table} not found or has no columns"
            )));
        }
        let indexes = self.get_indexes(schema, table).await?;
        let constraints = self.get_constraints(schema, table).await?;

        let mut info = TableInfo {
            schema: schema.to_string(),
            name: table.to_string(),
            columns,
            indexes,
            constraints,
            ddl: String::new(),
        };
        info.ddl = generate_create_table(&info);
        Ok(info)
    }

    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "loading columns"))?;

        let rows = client
            .query(
                "SELECT
                    c.column_name,
                    c.data_type,
                    c.is_nullable = 'YES',
                    COALESCE(c.column_default, ''),
                    pk.column_name IS NOT NULL
                 FROM information_schema.columns c
                 LEFT JOIN (
                    SELECT ku.table_schema, ku.table_name, ku.column_name
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage ku
                      ON tc.constraint_name = ku.constraint_name
                     AND tc.table_schema = ku.table_schema
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                 ) pk ON c.table_schema = pk.table_schema
                     AND c.table_name = pk.table_name
                     AND c.column_name = pk.column_name
                 WHERE c.table_schema = $1 AND c.table_name = $2
                 ORDER BY c.ordinal_position",
                &[&schema, &table],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                is_nullable: row.get(2),
                default_value: row.get(3),
                is_primary_key: row.get(4),
            })
            .collect())
    }

    async fn get_indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexInfo>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "loading indexes"))?;

        let rows = client
            .query(
                "SELECT indexname, indexdef, indexdef LIKE '%UNIQUE%'
                 FROM pg_indexes
                 WHERE schemaname = $1 AND tablename = $2
                   AND indexname NOT LIKE '%_pkey'
                 ORDER BY indexname",
                &[&schema, &table],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let definition: String = row.get(1);
                IndexInfo {
                    name: row.get(0),
                    columns: index_columns(&definition),
                    unique: row.get(2),
                    definition,
                }
            })
            .collect())
    }

    async fn get_constraints(&self, schema: &str, table: &str) -> Result<Vec<ConstraintInfo>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "loading constraints"))?;

        let rows = client
            .query(
                "SELECT c.conname, c.contype::text, pg_get_constraintdef(c.oid)
                 FROM pg_catalog.pg_constraint c
                 JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
                 JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
                 WHERE n.nspname = $1 AND t.relname = $2 AND c.contype <> 'p'
                 ORDER BY c.conname",
                &[&schema, &table],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let contype: String = row.get(1);
                ConstraintInfo {
                    name: row.get(0),
                    kind: match contype.as_str() {
                        "u" => "UNIQUE".to_string(),
                        "c" => "CHECK".to_string(),
                        "f" => "FOREIGN KEY".to_string(),
                        other => other.to_uppercase(),
                    },
                    definition: row.get(2),
                }
            })
            .collect())
    }

    /// `SHOW wal_level`; migration requires `logical`.
    pub async fn check_wal_level(&self) -> Result<String> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "checking wal_level"))?;

        // SHOW is issued through the simple protocol.
        let messages = client.simple_query("SHOW wal_level").await?;
        for msg in messages {
            if let SimpleQueryMessage::Row(row) = msg {
                if let Some(level) = row.get(0) {
                    return Ok(level.to_string());
                }
            }
        }
        Err(DtsError::Schema("wal_level not reported by server".to_string()))
    }

    /// Exact row count.
    pub async fn get_table_count(&self, schema: &str, table: &str) -> Result<i64> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "counting rows"))?;

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

    /// Ordered base-table names in a schema.
    pub async fn get_all_tables(&self, schema: &str) -> Result<Vec<String>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "listing tables"))?;

        let rows = client
            .query(
                "SELECT table_name FROM information_schema.tables
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                 ORDER BY table_name",
                &[&schema],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Reject new writes on a database: future transactions default to
    /// read-only. Sessions opened before the switch are unaffected, which is
    /// acceptable because validation re-polls until counts converge.
    pub async fn set_read_only(&self, database: &str) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "setting read-only"))?;
        client
            .execute(
                &format!(
                    "ALTER DATABASE {} SET default_transaction_read_only = true",
                    quote_ident(database)
                ),
                &[],
            )
            .await?;
        Ok(())
    }

    /// Restore writability after completion or failure.
    pub async fn reset_read_only(&self, database: &str) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "resetting read-only"))?;
        client
            .execute(
                &format!(
                    "ALTER DATABASE {} RESET default_transaction_read_only",
                    quote_ident(database)
                ),
                &[],
            )
            .await?;
        Ok(())
    }
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Synthesize a CREATE TABLE statement with the primary key inline.
pub fn generate_create_table(info: &TableInfo) -> String {
    let mut defs: Vec<String> = Vec::with_capacity(info.columns.len() + 1);
    for col in &info.columns {
        let mut def = format!("  {} {}", col.name, col.data_type);
        if !col.is_nullable {
            def.push_str(" NOT NULL");
        }
        if !col.default_value.is_empty() {
            def.push_str(" DEFAULT ");
            def.push_str(&col.default_value);
        }
        defs.push(def);
    }

    let pk: Vec<&str> = info
        .columns
        .iter()
        .filter(|c| c.is_primary_key)
        .map(|c| c.name.as_str())
        .collect();
    if !pk.is_empty() {
        defs.push(format!("  PRIMARY KEY ({})", pk.join(", ")));
    }

    format!(
        "CREATE TABLE {}.{} (\n{}\n)",
        info.schema,
        info.name,
        defs.join(",\n")
    )
}

/// Extract column names from a `CREATE INDEX ... ON t (a, b DESC)` definition.
fn index_columns(definition: &str) -> Vec<String> {
    let Some(start) = definition.find('(') else {
        return Vec::new();
    };
    let Some(end) = definition.rfind(')') else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }

    definition[start + 1..end]
        .split(',')
        .map(|col| {
            col.trim()
                .trim_end_matches(" ASC")
                .trim_end_matches(" DESC")
                .trim()
                .to_string()
        })
        .filter(|c| !c.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str, pk: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            is_nullable: !pk,
            default_value: String::new(),
            is_primary_key: pk,
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_generate_create_table_with_pk() {
        let info = TableInfo {
            schema: "public".into(),
            name: "t".into(),
            columns: vec![column("id", "integer", true), column("v", "text", false)],
            indexes: vec![],
            constraints: vec![],
            ddl: String::new(),
        };
        let ddl = generate_create_table(&info);
        assert_eq!(
            ddl,
            "CREATE TABLE public.t (\n  id integer NOT NULL,\n  v text,\n  PRIMARY KEY (id)\n)"
        );
    }

    #[test]
    fn test_generate_create_table_defaults() {
        let mut col = column("n", "integer", false);
        col.default_value = "0".to_string();
        let info = TableInfo {
            schema: "public".into(),
            name: "t".into(),
            columns: vec![col],
            indexes: vec![],
            constraints: vec![],
            ddl: String::new(),
        };
        assert!(generate_create_table(&info).contains("n integer DEFAULT 0"));
    }

    #[test]
    fn test_index_columns() {
        assert_eq!(
            index_columns("CREATE INDEX idx_t_v ON public.t USING btree (v)"),
            vec!["v"]
        );
        assert_eq!(
            index_columns("CREATE UNIQUE INDEX u ON t (a, b DESC)"),
            vec!["a", "b"]
        );
        assert!(index_columns("garbage without parens").is_empty());
    }

    #[test]
    fn test_schema_statements_order() {
        let info = TableInfo {
            schema: "public".into(),
            name: "t".into(),
            columns: vec![column("id", "integer", true)],
            indexes: vec![IndexInfo {
                name: "idx_t_v".into(),
                definition: "CREATE INDEX idx_t_v ON public.t (v)".into(),
                columns: vec!["v".into()],
                unique: false,
            }],
            constraints: vec![ConstraintInfo {
                name: "t_v_check".into(),
                kind: "CHECK".into(),
                definition: "CHECK ((v > 0))".into(),
            }],
            ddl: "CREATE TABLE public.t (\n  id integer NOT NULL\n)".into(),
        };
        let stmts = info.schema_statements();
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].starts_with("CREATE TABLE"));
        assert!(stmts[1].starts_with("CREATE INDEX"));
        assert_eq!(
            stmts[2],
            "ALTER TABLE public.t ADD CONSTRAINT t_v_check CHECK ((v > 0))"
        );
    }
}
