//! The per-task migration pipeline.
//!
//! A running task is a [`MigrationRun`] advanced one stage at a time by the
//! worker loop in the service layer. Each stage maps the current
//! [`TaskState`] to its work and returns the next state, `None` when the
//! stage only waits for an external signal (switch, pause), or an error that
//! fails the task.

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DtsError, Result};
use crate::registry::ConnectionRegistry;
use crate::replication::{publication_name, slot_name, ReplicationResources};
use crate::source::SourceInspector;
use crate::target::{rename::rewrite_statement, TargetApplier};
use crate::task::store::TaskStore;
use crate::task::{TableRef, Task, TaskState};
use crate::wal::{LagGauge, Subscriber, SubscriberHandle};

/// Poll cadence in the waiting stage and between validation attempts.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Validation gives up after this many count comparisons.
const VALIDATE_MAX_ATTEMPTS: u32 = 10;

/// What connect-stage discovery produced: the databases whose schemas are
/// replicated to the target and the tables whose rows are transferred.
#[derive(Debug, Clone, Default)]
struct Plan {
    /// Business databases on the source; schemas are created for all.
    databases: Vec<String>,
    /// Covered tables in the endpoint database; rows and WAL flow for these.
    tables: Vec<TableRef>,
}

/// Runtime state of one migration worker.
pub struct MigrationRun {
    task: Task,
    store: Arc<dyn TaskStore>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
    lag: Arc<LagGauge>,
    plan: Option<Plan>,
    subscriber: Option<SubscriberHandle>,
    read_only_set: bool,
}

impl MigrationRun {
    pub fn new(
        task: Task,
        store: Arc<dyn TaskStore>,
        registry: Arc<ConnectionRegistry>,
        cancel: CancellationToken,
        lag: Arc<LagGauge>,
    ) -> Self {
        Self {
            task,
            store,
            registry,
            cancel,
            lag,
            plan: None,
            subscriber: None,
            read_only_set: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    /// Execute one stage; `Ok(None)` means "stay and poll again".
    pub async fn execute(&mut self, stage: TaskState) -> Result<Option<TaskState>> {
        match stage {
            TaskState::Init => self.run_init().await.map(Some),
            TaskState::Connect => self.run_connect().await.map(Some),
            TaskState::CreateTables => self.run_create_tables().await.map(Some),
            TaskState::FullSync => self.run_full_sync().await.map(Some),
            TaskState::IncSync => self.run_inc_sync().await.map(Some),
            TaskState::Waiting => self.run_waiting().await,
            TaskState::Validating => self.run_validating().await.map(Some),
            other => Err(DtsError::IllegalTransition {
                from: other.to_string(),
                reason: "state is not executable".to_string(),
            }),
        }
    }

    /// Validate the task definition. No network I/O happens here.
    async fn run_init(&mut self) -> Result<TaskState> {
        let suffix = &self.task.table_suffix;
        if !suffix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DtsError::Validation(format!(
                "table suffix '{suffix}' must contain only letters, digits and underscores"
            )));
        }
        debug!(task_id = %self.task.task_id, tables = self.task.tables.len(), "task validated");
        Ok(TaskState::Connect)
    }

    /// Open source connections, check preconditions, enumerate databases,
    /// create them on the target, and resolve the covered table list.
    async fn run_connect(&mut self) -> Result<TaskState> {
        let source = &self.task.source;
        let dest = &self.task.dest;

        let source_pool = self.registry.get_or_create(source, &source.database).await?;
        let inspector = SourceInspector::new(source_pool);

        let wal_level = inspector.check_wal_level().await?;
        if wal_level != "logical" {
            return Err(DtsError::Precondition(format!(
                "source wal_level must be 'logical', got '{wal_level}'"
            )));
        }

        let mut databases: Vec<String> = inspector
            .list_business_databases()
            .await?
            .into_iter()
            .map(|db| db.name)
            .collect();
        if !databases.contains(&source.database) {
            databases.push(source.database.clone());
        }

        // Open a source connection per business database, as later stages
        // introspect each of them.
        for db in &databases {
            self.registry.get_or_create(source, db).await?;
        }

        // Databases are created from the target's maintenance database; the
        // per-database pools are opened afterwards.
        let maintenance = self.registry.get_or_create(dest, "postgres").await?;
        let bootstrap = TargetApplier::new(maintenance);
        for db in &databases {
            bootstrap.ensure_database(db).await?;
            self.registry.get_or_create(dest, db).await?;
        }

        let tables = if self.task.tables.is_empty() {
            let discovered: Vec<TableRef> = inspector
                .list_business_tables()
                .await?
                .into_iter()
                .map(|t| TableRef::new(t.schema, t.table))
                .collect();
            if discovered.is_empty() {
                return Err(DtsError::Precondition(format!(
                    "no business tables found in source database '{}'",
                    source.database
                )));
            }
            info!(
                task_id = %self.task.task_id,
                count = discovered.len(),
                "discovered tables on source"
            );
            discovered
        } else {
            for table in &self.task.tables {
                inspector
                    .get_table_info(&table.schema, &table.table)
                    .await
                    .map_err(|e| {
                        DtsError::Precondition(format!(
                            "configured table {table} not found or inaccessible: {e}"
                        ))
                    })?;
            }
            self.task.tables.clone()
        };

        self.plan = Some(Plan { databases, tables });
        Ok(TaskState::CreateTables)
    }

    /// Replay the (suffix-rewritten) schema of every business database.
    async fn run_create_tables(&mut self) -> Result<TaskState> {
        let plan = self.plan().await?;
        let suffix = self.task.table_suffix.clone();

        for db in &plan.databases {
            let source_pool = self.registry.get_or_create(&self.task.source, db).await?;
            let inspector = SourceInspector::new(source_pool);
            let target_pool = self.registry.get_or_create(&self.task.dest, db).await?;
            let applier = TargetApplier::new(target_pool);

            for table in inspector.list_business_tables().await? {
                let info = inspector.get_table_info(&table.schema, &table.table).await?;
                for statement in info.schema_statements() {
                    applier
                        .apply_schema_statement(&rewrite_statement(&statement, &suffix))
                        .await?;
                }
            }
            info!(task_id = %self.task.task_id, database = %db, "target schema created");
        }

        Ok(TaskState::FullSync)
    }

    /// Stream every covered table's rows from source to target.
    async fn run_full_sync(&mut self) -> Result<TaskState> {
        let plan = self.plan().await?;
        let tables = plan.tables.clone();
        let suffix = self.task.table_suffix.clone();
        let db = self.task.source.database.clone();

        let source_pool = self.registry.get_or_create(&self.task.source, &db).await?;
        let target_pool = self.registry.get_or_create(&self.task.dest, &db).await?;
        let inspector = SourceInspector::new(source_pool.clone());
        let applier = TargetApplier::new(target_pool);

        let total = tables.len();
        for (done, table) in tables.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(DtsError::Cancelled);
            }
            let info = inspector.get_table_info(&table.schema, &table.table).await?;
            let columns: Vec<String> = info.columns.iter().map(|c| c.name.clone()).collect();
            let rows = applier
                .copy_table(
                    &source_pool,
                    &table.schema,
                    &table.table,
                    &table.target_table(&suffix),
                    &columns,
                )
                .await?;
            info!(task_id = %self.task.task_id, table = %table, rows, "full copy done");

            // interpolate between the full_sync and inc_sync anchors
            let progress = TaskState::FullSync.progress_anchor()
                + ((done + 1) as i32 * 15 / total.max(1) as i32);
            self.store
                .update_progress(&self.task.task_id, progress.min(74))
                .await?;
        }

        Ok(TaskState::IncSync)
    }

    /// Ensure slot and publication exist and the WAL stream is flowing.
    /// Shared by first entry into `inc_sync` and the later stages, which
    /// rebuild the stream in place after a resume landed them with no
    /// subscriber.
    async fn ensure_subscriber(&mut self) -> Result<()> {
        let plan = self.plan().await?;
        let tables = plan.tables;
        let db = self.task.source.database.clone();

        let source_pool = self.registry.get_or_create(&self.task.source, &db).await?;
        let resources = ReplicationResources::new(source_pool);

        let slot = slot_name(&self.task.task_id);
        let publication = publication_name(&self.task.task_id);
        resources.create_slot(&slot, "pgoutput").await?;
        resources.create_publication(&publication, &tables).await?;

        if self.subscriber.is_none() {
            let target_pool = self.registry.get_or_create(&self.task.dest, &db).await?;
            let subscriber = Subscriber {
                dsn: self.task.source.replication_dsn(&db),
                slot,
                publication,
                table_suffix: self.task.table_suffix.clone(),
                sink: Arc::new(TargetApplier::new(target_pool)),
                lag: Arc::clone(&self.lag),
            };
            self.subscriber = Some(subscriber.spawn(&self.cancel));
            info!(task_id = %self.task.task_id, "wal subscriber started");
        }
        Ok(())
    }

    /// Ensure slot and publication, then start the WAL subscriber.
    async fn run_inc_sync(&mut self) -> Result<TaskState> {
        self.ensure_subscriber().await?;
        info!(task_id = %self.task.task_id, "incremental sync running");
        Ok(TaskState::Waiting)
    }

    /// Hold the task while the subscriber keeps the target caught up. The
    /// switch request arrives out of band as a persisted state change, which
    /// the worker loop observes; this stage watches the subscriber's health,
    /// reports lag, and restarts the stream after a resume, all without
    /// leaving `waiting`.
    async fn run_waiting(&mut self) -> Result<Option<TaskState>> {
        if self.subscriber.is_none() {
            self.ensure_subscriber().await?;
        }

        if let Some(handle) = &self.subscriber {
            if handle.is_finished() {
                if let Some(handle) = self.subscriber.take() {
                    return Err(match handle.outcome().await {
                        Err(e) => e,
                        Ok(()) => DtsError::Replication(
                            "incremental sync stopped unexpectedly".to_string(),
                        ),
                    });
                }
            }
        }

        if let Some(delay) = self.lag.delay_ms() {
            debug!(task_id = %self.task.task_id, delay_ms = delay, "replication lag");
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(DtsError::Cancelled),
            _ = tokio::time::sleep(POLL_INTERVAL) => Ok(None),
        }
    }

    /// Stop writes on the source, then poll until per-table row counts
    /// converge. The subscriber keeps applying while this loop runs.
    async fn run_validating(&mut self) -> Result<TaskState> {
        // A resume can land here with no stream; the outstanding WAL must
        // keep applying or the counts would never converge.
        if self.subscriber.is_none() {
            self.ensure_subscriber().await?;
        }

        let plan = self.plan().await?;
        let tables = plan.tables.clone();
        let suffix = self.task.table_suffix.clone();
        let db = self.task.source.database.clone();

        let source_pool = self.registry.get_or_create(&self.task.source, &db).await?;
        let inspector = SourceInspector::new(source_pool);
        let target_pool = self.registry.get_or_create(&self.task.dest, &db).await?;
        let applier = TargetApplier::new(target_pool);

        if !self.read_only_set {
            inspector.set_read_only(&db).await?;
            self.read_only_set = true;
            info!(task_id = %self.task.task_id, database = %db, "source set read-only");
        }

        for attempt in 1..=VALIDATE_MAX_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(DtsError::Cancelled);
            }

            let mut mismatch = None;
            for table in &tables {
                let source_count = inspector.get_table_count(&table.schema, &table.table).await?;
                let target_count = applier
                    .get_table_count(&table.schema, &table.target_table(&suffix))
                    .await?;
                if source_count != target_count {
                    mismatch = Some((table.clone(), source_count, target_count));
                    break;
                }
            }

            match mismatch {
                None => {
                    info!(task_id = %self.task.task_id, attempt, "row counts converged");
                    return Ok(TaskState::Completed);
                }
                Some((table, source_count, target_count)) => {
                    debug!(
                        task_id = %self.task.task_id,
                        table = %table,
                        source_count,
                        target_count,
                        attempt,
                        "row counts differ"
                    );
                }
            }

            if attempt < VALIDATE_MAX_ATTEMPTS {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(DtsError::Cancelled),
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        }

        Err(DtsError::Precondition(format!(
            "validation failed: source and target row counts did not converge \
             after {VALIDATE_MAX_ATTEMPTS} attempts"
        )))
    }

    /// Stop streaming without touching replication resources. Used on
    /// pause: the slot stays behind on purpose so resume can replay from
    /// its confirmed position.
    pub async fn suspend(&mut self) {
        if let Some(handle) = self.subscriber.take() {
            if let Err(e) = handle.shutdown().await {
                warn!(task_id = %self.task.task_id, error = %e, "subscriber shutdown failed");
            }
        }
        info!(task_id = %self.task.task_id, "worker suspended");
    }

    /// Terminal cleanup: stop the subscriber, remove replication resources,
    /// restore source writability. Errors are logged and swallowed so they
    /// never mask the original failure cause.
    pub async fn cleanup(&mut self) {
        let task_id = self.task.task_id.clone();

        if let Some(handle) = self.subscriber.take() {
            if let Err(e) = handle.shutdown().await {
                warn!(task_id = %task_id, error = %e, "subscriber shutdown failed");
            }
        }

        let db = self.task.source.database.clone();
        let pool = match self.registry.get_or_create(&self.task.source, &db).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "cleanup could not reach source");
                return;
            }
        };

        let resources = ReplicationResources::new(pool.clone());
        if let Err(e) = resources.drop_slot(&slot_name(&task_id)).await {
            warn!(task_id = %task_id, error = %e, "dropping slot failed");
        }
        if let Err(e) = resources.drop_publication(&publication_name(&task_id)).await {
            warn!(task_id = %task_id, error = %e, "dropping publication failed");
        }

        if self.read_only_set {
            let inspector = SourceInspector::new(pool);
            match inspector.reset_read_only(&db).await {
                Ok(()) => self.read_only_set = false,
                Err(e) => warn!(task_id = %task_id, error = %e, "restoring writability failed"),
            }
        }
    }

    /// The plan survives only in the worker; after a resume it is rebuilt by
    /// re-running discovery.
    async fn plan(&mut self) -> Result<Plan> {
        if self.plan.is_none() {
            debug!(task_id = %self.task.task_id, "rebuilding discovery plan");
            self.run_connect().await?;
        }
        Ok(self.plan.clone().expect("plan populated by connect"))
    }
}
