//! Orchestration façade: the operations surfaced to the HTTP layer, plus
//! the worker loop that drives one task's state machine.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info, warn};

use crate::error::{DtsError, Result};
use crate::machine::retry::{with_retry, BASE_DELAY, MAX_RETRIES};
use crate::machine::MigrationRun;
use crate::manager::{LiveTask, TaskManager};
use crate::registry::ConnectionRegistry;
use crate::replication::{publication_name, slot_name, ReplicationResources};
use crate::source::SourceInspector;
use crate::task::store::TaskStore;
use crate::task::{ApiStage, Task, TaskState};

/// Status tuple computed for the status endpoint.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: TaskState,
    pub stage: ApiStage,
    /// Milliseconds from start to completion; -1 unless completed.
    pub duration_ms: i64,
    /// Replication lag in milliseconds; -1 when not computable.
    pub delay_ms: i64,
    pub last_error: String,
}

/// The service owns the metadata store and the live-task registry.
pub struct DtsService {
    store: Arc<dyn TaskStore>,
    manager: Arc<TaskManager>,
}

impl DtsService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            manager: Arc::new(TaskManager::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    /// Persist a task in `init` and start it.
    pub async fn create(self: &Arc<Self>, task: Task) -> Result<()> {
        if task.task_id.trim().is_empty() {
            return Err(DtsError::Validation("task_id must not be empty".to_string()));
        }
        self.store.create(&task).await?;
        info!(task_id = %task.task_id, "task created");
        self.start(&task.task_id).await
    }

    /// Spawn the worker for a task. Single-flight: a second start while the
    /// worker lives reports "already running".
    pub async fn start(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let mut task = self.store.get(task_id).await?;

        if task.state.is_terminal() {
            return Err(DtsError::IllegalTransition {
                from: task.state.to_string(),
                reason: "task is in a terminal state".to_string(),
            });
        }

        // Resume returns to the stage recorded at pause time.
        if task.state == TaskState::Paused {
            let resume_to = task.resume_state.unwrap_or(TaskState::Init);
            self.store.update_state(task_id, resume_to, None).await?;
            task = self.store.get(task_id).await?;
            info!(task_id, state = %task.state, "task resuming");
        }

        let live = self.manager.add(task_id).await?;
        let service = Arc::clone(self);
        let task_id_owned = task_id.to_string();
        tokio::spawn(async move {
            service.run_worker(task, live).await;
            service.manager.remove(&task_id_owned).await;
        });

        info!(task_id, "worker started");
        Ok(())
    }

    /// Pause a non-terminal task; the worker observes the state before its
    /// next stage and exits, keeping the replication slot for resume.
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let task = self.store.get(task_id).await?;
        if task.state.is_terminal() {
            return Err(DtsError::IllegalTransition {
                from: task.state.to_string(),
                reason: "cannot pause a terminal task".to_string(),
            });
        }
        if task.state == TaskState::Paused {
            return Ok(());
        }
        self.store.update_state(task_id, TaskState::Paused, None).await?;
        info!(task_id, "task paused");
        Ok(())
    }

    /// Resume a paused task.
    pub async fn resume(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let task = self.store.get(task_id).await?;
        if task.state != TaskState::Paused {
            return Err(DtsError::IllegalTransition {
                from: task.state.to_string(),
                reason: "only a paused task can be resumed".to_string(),
            });
        }
        self.start(task_id).await
    }

    /// Stop retains the task and halts execution; same write as pause.
    pub async fn stop(&self, task_id: &str) -> Result<()> {
        self.pause(task_id).await
    }

    /// Trigger switchover; legal only while the task is waiting.
    pub async fn switch(&self, task_id: &str) -> Result<()> {
        let task = self.store.get(task_id).await?;
        if task.state != TaskState::Waiting {
            return Err(DtsError::IllegalTransition {
                from: task.state.to_string(),
                reason: format!(
                    "switchover requires state 'waiting', task is '{}'",
                    task.state
                ),
            });
        }
        self.store
            .update_state(task_id, TaskState::Validating, None)
            .await?;
        info!(task_id, "switchover triggered");
        Ok(())
    }

    /// Cancel the worker, scrub replication resources, delete the record.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        let task = self.store.get(task_id).await?;

        if !task.state.is_terminal() {
            self.store
                .update_state(task_id, TaskState::Failed, Some("task cancelled by user"))
                .await?;
        }
        // Cancels the worker and closes its pools.
        self.manager.remove(task_id).await;

        // The worker may never have run (or may have crashed), so the
        // external artefacts are scrubbed here as well.
        self.scrub_replication_resources(&task).await;

        self.store.delete(task_id).await?;
        info!(task_id, "task deleted");
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.store.get(task_id).await
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Task>> {
        self.store.list(limit, offset).await
    }

    /// Compute the status tuple for a task.
    pub async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        let task = self.store.get(task_id).await?;
        let stage = task.state.api_stage();

        let delay_ms = match stage {
            ApiStage::Syncing | ApiStage::Waiting | ApiStage::Switching => {
                match self.manager.get(task_id).await {
                    Some(live) => live.lag.delay_ms().unwrap_or(-1),
                    None => -1,
                }
            }
            _ => -1,
        };

        Ok(TaskStatus {
            state: task.state,
            stage,
            duration_ms: task.duration_ms().unwrap_or(-1),
            delay_ms,
            last_error: task.last_error,
        })
    }

    /// Drop the slot and publication and restore writability, best effort,
    /// over short-lived connections independent of any worker.
    async fn scrub_replication_resources(&self, task: &Task) {
        let registry = ConnectionRegistry::new();
        let db = task.source.database.clone();
        match registry.get_or_create(&task.source, &db).await {
            Ok(pool) => {
                let resources = ReplicationResources::new(pool.clone());
                if let Err(e) = resources.drop_slot(&slot_name(&task.task_id)).await {
                    warn!(task_id = %task.task_id, error = %e, "slot scrub failed");
                }
                if let Err(e) = resources
                    .drop_publication(&publication_name(&task.task_id))
                    .await
                {
                    warn!(task_id = %task.task_id, error = %e, "publication scrub failed");
                }
                let inspector = SourceInspector::new(pool);
                if let Err(e) = inspector.reset_read_only(&db).await {
                    warn!(task_id = %task.task_id, error = %e, "read-only scrub failed");
                }
            }
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "scrub could not reach source")
            }
        }
        registry.close_all().await;
    }

    /// The worker loop: reload the persisted task, execute its stage under
    /// the retry wrapper, persist the transition, repeat until terminal,
    /// paused, cancelled or failed.
    async fn run_worker(&self, task: Task, live: LiveTask) {
        let task_id = task.task_id.clone();
        let mut run = MigrationRun::new(
            task,
            Arc::clone(&self.store),
            Arc::clone(&live.registry),
            live.cancel.clone(),
            Arc::clone(&live.lag),
        );

        let outcome = self.drive(&mut run, &live).await;
        match outcome {
            Ok(()) => {}
            Err(DtsError::Cancelled) => {
                info!(task_id = %task_id, "worker cancelled");
                // Row may already be gone when the cancel came from delete.
                match self
                    .store
                    .update_state(&task_id, TaskState::Failed, Some("task cancelled"))
                    .await
                {
                    Ok(()) | Err(DtsError::NotFound(_)) => {}
                    Err(e) => warn!(task_id = %task_id, error = %e, "could not persist cancel"),
                }
                run.cleanup().await;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "migration failed");
                let message = e.to_string();
                match self
                    .store
                    .update_state(&task_id, TaskState::Failed, Some(&message))
                    .await
                {
                    Ok(()) | Err(DtsError::NotFound(_)) => {}
                    Err(e) => warn!(task_id = %task_id, error = %e, "could not persist failure"),
                }
                run.cleanup().await;
            }
        }
    }

    async fn drive(&self, run: &mut MigrationRun, live: &LiveTask) -> Result<()> {
        loop {
            if live.cancel.is_cancelled() {
                return Err(DtsError::Cancelled);
            }

            let task = self.store.get(run.task_id()).await?;
            let state = task.state;

            if state.is_terminal() {
                run.cleanup().await;
                return Ok(());
            }
            if state == TaskState::Paused {
                run.suspend().await;
                return Ok(());
            }

            self.store
                .update_progress(run.task_id(), state.progress_anchor())
                .await?;

            let next = with_retry(&live.cancel, MAX_RETRIES, BASE_DELAY, run, |r| {
                r.execute(state).boxed()
            })
            .await?;

            if let Some(next_state) = next {
                self.store
                    .update_state(run.task_id(), next_state, None)
                    .await?;
                self.store
                    .update_progress(run.task_id(), next_state.progress_anchor())
                    .await?;
                info!(
                    task_id = %run.task_id(),
                    from = %state,
                    to = %next_state,
                    "stage complete"
                );

                if next_state.is_terminal() {
                    run.cleanup().await;
                    return Ok(());
                }
            }
        }
    }
}
