//! Replication-resource management: slots and publications.
//!
//! Both resources are named deterministically from the task id, so they can
//! always be found and removed later, even by a process that never ran the
//! task. Creates are idempotent via an existence probe; drops use
//! `IF EXISTS` or tolerate absence.

use deadpool_postgres::Pool;
use tokio_postgres::SimpleQueryMessage;
use tracing::info;

use crate::error::{DtsError, Result};
use crate::task::TableRef;

/// Replication slot name for a task.
pub fn slot_name(task_id: &str) -> String {
    format!("dts_slot_{}", sanitize(task_id))
}

/// Publication name for a task.
pub fn publication_name(task_id: &str) -> String {
    format!("dts_pub_{}", sanitize(task_id))
}

/// Slot names admit only lower-case letters, digits and underscores.
fn sanitize(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Slot and publication operations on the source endpoint database.
pub struct ReplicationResources {
    pool: Pool,
}

impl ReplicationResources {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn slot_exists(&self, slot: &str) -> Result<bool> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "checking slot"))?;
        let row = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
                &[&slot],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Create a logical replication slot if it does not exist. Returns the
    /// slot's confirmed flush LSN text when it already existed.
    pub async fn create_slot(&self, slot: &str, plugin: &str) -> Result<Option<String>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "creating slot"))?;

        let existing = client
            .simple_query(&format!(
                "SELECT confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = '{slot}'"
            ))
            .await?;
        for msg in &existing {
            if let SimpleQueryMessage::Row(row) = msg {
                info!(slot, "replication slot already exists");
                return Ok(row.get(0).map(str::to_string));
            }
        }

        let plugin = if plugin.is_empty() { "pgoutput" } else { plugin };
        client
            .execute(
                "SELECT pg_create_logical_replication_slot($1, $2)",
                &[&slot, &plugin],
            )
            .await
            .map_err(|e| DtsError::Replication(format!("creating slot {slot}: {e}")))?;
        info!(slot, plugin, "created replication slot");
        Ok(None)
    }

    /// Drop the slot; absence is not an error.
    pub async fn drop_slot(&self, slot: &str) -> Result<()> {
        if !self.slot_exists(slot).await? {
            return Ok(());
        }
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "dropping slot"))?;
        client
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot])
            .await
            .map_err(|e| DtsError::Replication(format!("dropping slot {slot}: {e}")))?;
        info!(slot, "dropped replication slot");
        Ok(())
    }

    pub async fn publication_exists(&self, publication: &str) -> Result<bool> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "checking publication"))?;
        let row = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
                &[&publication],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Create a publication for the given tables if it does not exist.
    pub async fn create_publication(&self, publication: &str, tables: &[TableRef]) -> Result<()> {
        if tables.is_empty() {
            return Err(DtsError::Replication(
                "publication needs at least one table".to_string(),
            ));
        }
        if self.publication_exists(publication).await? {
            info!(publication, "publication already exists");
            return Ok(());
        }

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "creating publication"))?;
        let table_list = tables
            .iter()
            .map(TableRef::qualified)
            .collect::<Vec<_>>()
            .join(", ");
        client
            .batch_execute(&format!(
                "CREATE PUBLICATION {publication} FOR TABLE {table_list}"
            ))
            .await
            .map_err(|e| {
                DtsError::Replication(format!("creating publication {publication}: {e}"))
            })?;
        info!(publication, tables = %table_list, "created publication");
        Ok(())
    }

    /// Drop the publication; `IF EXISTS` makes this idempotent.
    pub async fn drop_publication(&self, publication: &str) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "dropping publication"))?;
        client
            .batch_execute(&format!("DROP PUBLICATION IF EXISTS {publication}"))
            .await
            .map_err(|e| {
                DtsError::Replication(format!("dropping publication {publication}: {e}"))
            })?;
        info!(publication, "dropped publication");
        Ok(())
    }

    /// Extend an existing publication with more tables.
    pub async fn add_tables(&self, publication: &str, tables: &[TableRef]) -> Result<()> {
        if tables.is_empty() {
            return Err(DtsError::Replication(
                "no tables to add to publication".to_string(),
            ));
        }
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, "altering publication"))?;
        let table_list = tables
            .iter()
            .map(TableRef::qualified)
            .collect::<Vec<_>>()
            .join(", ");
        client
            .batch_execute(&format!(
                "ALTER PUBLICATION {publication} ADD TABLE {table_list}"
            ))
            .await
            .map_err(|e| {
                DtsError::Replication(format!("adding tables to {publication}: {e}"))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_deterministic() {
        assert_eq!(slot_name("job42"), "dts_slot_job42");
        assert_eq!(publication_name("job42"), "dts_pub_job42");
    }

    #[test]
    fn test_names_are_sanitized() {
        assert_eq!(slot_name("My-Task.1"), "dts_slot_my_task_1");
        assert_eq!(publication_name("a b"), "dts_pub_a_b");
    }
}
