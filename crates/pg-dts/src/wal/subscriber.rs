//! The WAL subscriber: one replication session per task.
//!
//! Opens a dedicated `replication=database` connection to the source, starts
//! the logical stream over the slot/publication pair, decodes pgoutput
//! messages and applies them to the target through a [`ChangeSink`]. The
//! position reported back to the server never precedes a successful apply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DtsError, Result};
use crate::target::{RowValues, TargetApplier};
use crate::wal::decoder::{decode_event, TupleValue, WalEvent, WalTuple};
use crate::wal::lsn::Lsn;
use crate::wal::proto::{
    encode_status_update, parse_frame, start_replication_command, ReplicationFrame,
};

/// Upper bound between unsolicited standby status updates.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Target-side application of replicated changes. The table names passed in
/// are already the target names (suffix applied).
#[async_trait::async_trait]
pub trait ChangeSink: Send + Sync {
    async fn insert(&self, schema: &str, table: &str, values: &RowValues) -> Result<()>;
    async fn update(
        &self,
        schema: &str,
        table: &str,
        old_values: &RowValues,
        new_values: &RowValues,
    ) -> Result<()>;
    async fn delete(&self, schema: &str, table: &str, values: &RowValues) -> Result<()>;
    async fn truncate(&self, tables: &[String]) -> Result<()>;
}

#[async_trait::async_trait]
impl ChangeSink for TargetApplier {
    async fn insert(&self, schema: &str, table: &str, values: &RowValues) -> Result<()> {
        self.apply_insert(schema, table, values).await
    }

    async fn update(
        &self,
        schema: &str,
        table: &str,
        old_values: &RowValues,
        new_values: &RowValues,
    ) -> Result<()> {
        self.apply_update(schema, table, old_values, new_values).await
    }

    async fn delete(&self, schema: &str, table: &str, values: &RowValues) -> Result<()> {
        self.apply_delete(schema, table, values).await
    }

    async fn truncate(&self, tables: &[String]) -> Result<()> {
        self.apply_truncate(tables).await
    }
}

/// Replication lag published by the subscriber and read by the status API.
#[derive(Default)]
pub struct LagGauge {
    /// Commit timestamp (ms since epoch) of the last applied transaction;
    /// zero until the first commit.
    last_commit_ms: AtomicI64,
}

impl LagGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit_ms(&self, ts_ms: i64) {
        self.last_commit_ms.store(ts_ms, Ordering::Relaxed);
    }

    /// Milliseconds behind the last applied commit, or `None` before any
    /// transaction was applied.
    pub fn delay_ms(&self) -> Option<i64> {
        let ts = self.last_commit_ms.load(Ordering::Relaxed);
        if ts == 0 {
            return None;
        }
        Some((Utc::now().timestamp_millis() - ts).max(0))
    }
}

/// Schema of a relation announced on the stream, plus its target name.
#[derive(Debug, Clone)]
struct RelationEntry {
    namespace: String,
    name: String,
    target: String,
    columns: Vec<ColumnEntry>,
}

#[derive(Debug, Clone)]
struct ColumnEntry {
    name: String,
    is_key: bool,
}

/// Routes decoded events to the sink, resolving relation ids through the
/// catalog built from Relation messages.
pub struct EventRouter {
    relations: HashMap<u32, RelationEntry>,
    suffix: String,
    lag: Arc<LagGauge>,
}

impl EventRouter {
    pub fn new(suffix: impl Into<String>, lag: Arc<LagGauge>) -> Self {
        Self {
            relations: HashMap::new(),
            suffix: suffix.into(),
            lag,
        }
    }

    /// Handle one decoded event; apply errors bubble up so the caller never
    /// acknowledges an unapplied position.
    pub async fn handle(&mut self, event: WalEvent, sink: &dyn ChangeSink) -> Result<()> {
        match event {
            WalEvent::Relation {
                relation_id,
                namespace,
                name,
                columns,
                ..
            } => {
                let target = format!("{}{}", name, self.suffix);
                debug!(relation_id, table = %name, target = %target, "relation announced");
                self.relations.insert(
                    relation_id,
                    RelationEntry {
                        namespace,
                        name,
                        target,
                        columns: columns
                            .into_iter()
                            .map(|c| ColumnEntry {
                                name: c.name,
                                is_key: c.is_key,
                            })
                            .collect(),
                    },
                );
                Ok(())
            }

            WalEvent::Begin { .. } | WalEvent::Origin { .. } | WalEvent::Type { .. } => Ok(()),

            WalEvent::Commit { commit_ts, .. } => {
                self.lag.record_commit_ms(commit_ts.timestamp_millis());
                Ok(())
            }

            WalEvent::Insert {
                relation_id,
                new_tuple,
            } => {
                let rel = self.relation(relation_id)?;
                let values = zip_tuple(&rel.columns, &new_tuple, ToastPolicy::Forbid)?;
                sink.insert(&rel.namespace, &rel.target, &values).await
            }

            WalEvent::Update {
                relation_id,
                old_tuple,
                new_tuple,
            } => {
                let rel = self.relation(relation_id)?;
                // Unchanged TOAST cells are simply left out of the SET list.
                let new_values = zip_tuple(&rel.columns, &new_tuple, ToastPolicy::Skip)?;
                let old_values = match old_tuple {
                    Some(old) => zip_tuple(&rel.columns, &old, ToastPolicy::Forbid)?,
                    // No old tuple: the replica identity key did not change,
                    // so the key columns of the new tuple identify the row.
                    None => key_values(&rel.columns, &new_tuple, &new_values),
                };
                sink.update(&rel.namespace, &rel.target, &old_values, &new_values)
                    .await
            }

            WalEvent::Delete {
                relation_id,
                old_tuple,
            } => {
                let rel = self.relation(relation_id)?;
                let values = zip_tuple(&rel.columns, &old_tuple, ToastPolicy::Forbid)?;
                sink.delete(&rel.namespace, &rel.target, &values).await
            }

            WalEvent::Truncate { relation_ids, .. } => {
                let mut tables = Vec::with_capacity(relation_ids.len());
                for id in relation_ids {
                    let rel = self.relation(id)?;
                    tables.push(format!("{}.{}", rel.namespace, rel.target));
                }
                sink.truncate(&tables).await
            }
        }
    }

    fn relation(&self, relation_id: u32) -> Result<&RelationEntry> {
        self.relations.get(&relation_id).ok_or_else(|| {
            DtsError::Replication(format!("DML for unknown relation id {relation_id}"))
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum ToastPolicy {
    /// Drop unchanged-TOAST cells (UPDATE SET lists).
    Skip,
    /// Unchanged TOAST is a protocol violation here.
    Forbid,
}

/// Zip relation columns with tuple cells into name/value pairs.
fn zip_tuple(
    columns: &[ColumnEntry],
    tuple: &WalTuple,
    toast: ToastPolicy,
) -> Result<RowValues> {
    let mut values = Vec::with_capacity(tuple.values.len());
    for (cell, col) in tuple.values.iter().zip(columns) {
        match cell {
            TupleValue::Null => values.push((col.name.clone(), None)),
            TupleValue::Text(text) => values.push((col.name.clone(), Some(text.clone()))),
            TupleValue::Toast => match toast {
                ToastPolicy::Skip => {}
                ToastPolicy::Forbid => {
                    return Err(DtsError::Replication(format!(
                        "unexpected unchanged-TOAST cell for column {}",
                        col.name
                    )));
                }
            },
        }
    }
    Ok(values)
}

/// WHERE values for an UPDATE without an old tuple: the key columns of the
/// new tuple, falling back to every materialized column when the relation
/// has no key.
fn key_values(columns: &[ColumnEntry], tuple: &WalTuple, all: &RowValues) -> RowValues {
    let keys: RowValues = tuple
        .values
        .iter()
        .zip(columns)
        .filter(|(cell, col)| col.is_key && !matches!(cell, TupleValue::Toast))
        .map(|(cell, col)| match cell {
            TupleValue::Text(text) => (col.name.clone(), Some(text.clone())),
            _ => (col.name.clone(), None),
        })
        .collect();
    if keys.is_empty() {
        all.to_vec()
    } else {
        keys
    }
}

/// Apply one XLogData payload and return the position to acknowledge.
///
/// The returned position is `wal_start + len(data)` and is only produced
/// after the sink has applied the event, which is what keeps the slot from
/// advancing past unapplied WAL.
async fn apply_xlog(
    router: &mut EventRouter,
    sink: &dyn ChangeSink,
    wal_start: Lsn,
    data: &[u8],
) -> Result<Lsn> {
    let event = decode_event(data)?;
    router.handle(event, sink).await?;
    Ok(wal_start.advance(data.len() as u64))
}

/// A running subscriber task.
pub struct SubscriberHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<()>>,
}

impl SubscriberHandle {
    /// True once the receive loop has exited, normally or not.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the subscriber and wait for the loop to unwind.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(DtsError::Replication(format!("subscriber panicked: {e}"))),
        }
    }

    /// Collect the loop's outcome after it finished on its own.
    pub async fn outcome(self) -> Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(DtsError::Replication(format!("subscriber panicked: {e}"))),
        }
    }
}

/// Configuration for one subscriber session.
pub struct Subscriber {
    /// Connection string carrying `replication=database`.
    pub dsn: String,
    pub slot: String,
    pub publication: String,
    /// Suffix applied to target table names.
    pub table_suffix: String,
    pub sink: Arc<dyn ChangeSink>,
    pub lag: Arc<LagGauge>,
}

impl Subscriber {
    /// Spawn the receive loop on the runtime.
    pub fn spawn(self, parent: &CancellationToken) -> SubscriberHandle {
        let cancel = parent.child_token();
        let loop_cancel = cancel.clone();
        let join = tokio::spawn(async move { self.run(loop_cancel).await });
        SubscriberHandle { cancel, join }
    }

    async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (client, connection) = tokio_postgres::connect(&self.dsn, NoTls)
            .await
            .map_err(|e| DtsError::Replication(format!("replication connect: {e}")))?;
        let conn_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "replication connection closed");
            }
        });

        let command = start_replication_command(&self.slot, Lsn::ZERO, &self.publication);
        info!(slot = %self.slot, publication = %self.publication, "starting logical replication");

        let duplex = client
            .copy_both_simple::<Bytes>(&command)
            .await
            .map_err(|e| DtsError::Replication(format!("START_REPLICATION: {e}")))?;
        futures::pin_mut!(duplex);

        let mut router = EventRouter::new(self.table_suffix.clone(), Arc::clone(&self.lag));
        let mut status_interval = tokio::time::interval(STATUS_INTERVAL);
        status_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_acked = Lsn::ZERO;

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(slot = %self.slot, "subscriber cancelled");
                    break Ok(());
                }

                _ = status_interval.tick() => {
                    if !last_acked.is_zero() {
                        if let Err(e) = duplex.send(encode_status_update(last_acked)).await {
                            break Err(DtsError::Replication(format!(
                                "sending status update: {e}"
                            )));
                        }
                    }
                }

                frame = duplex.next() => {
                    let bytes = match frame {
                        None => break Err(DtsError::Replication(
                            "replication stream ended".to_string(),
                        )),
                        Some(Err(e)) => break Err(DtsError::Replication(format!(
                            "replication stream: {e}"
                        ))),
                        Some(Ok(bytes)) => bytes,
                    };

                    match parse_frame(&bytes) {
                        Ok(ReplicationFrame::Keepalive { wal_end, reply_requested, .. }) => {
                            if !wal_end.is_zero() || reply_requested {
                                let pos = if wal_end.is_zero() { last_acked } else { wal_end };
                                if pos.is_zero() {
                                    continue;
                                }
                                if let Err(e) = duplex.send(encode_status_update(pos)).await {
                                    break Err(DtsError::Replication(format!(
                                        "acknowledging keepalive: {e}"
                                    )));
                                }
                                if pos > last_acked {
                                    last_acked = pos;
                                }
                            }
                        }
                        Ok(ReplicationFrame::XLogData { wal_start, data, .. }) => {
                            match apply_xlog(&mut router, self.sink.as_ref(), wal_start, &data).await {
                                Ok(pos) => {
                                    if let Err(e) = duplex.send(encode_status_update(pos)).await {
                                        break Err(DtsError::Replication(format!(
                                            "acknowledging WAL: {e}"
                                        )));
                                    }
                                    if pos > last_acked {
                                        last_acked = pos;
                                    }
                                }
                                Err(e) => break Err(e),
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        conn_task.abort();
        if let Err(ref e) = result {
            error!(slot = %self.slot, error = %e, "subscriber loop failed");
        }
        result
    }
}
