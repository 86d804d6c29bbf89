//! Registry of live (running) tasks.
//!
//! A key exists iff a worker is running for that task. The record owns the
//! task's cancellation token and connection registry; removing it cancels
//! the worker and closes every pool. The map lock is never held across I/O.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{DtsError, Result};
use crate::registry::ConnectionRegistry;
use crate::task::store::TaskStore;
use crate::wal::LagGauge;

/// Runtime record for one running task.
#[derive(Clone)]
pub struct LiveTask {
    pub cancel: CancellationToken,
    pub registry: Arc<ConnectionRegistry>,
    pub lag: Arc<LagGauge>,
}

impl LiveTask {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            registry: Arc::new(ConnectionRegistry::new()),
            lag: Arc::new(LagGauge::new()),
        }
    }
}

impl Default for LiveTask {
    fn default() -> Self {
        Self::new()
    }
}

/// All live tasks in this process.
#[derive(Default)]
pub struct TaskManager {
    tasks: RwLock<HashMap<String, LiveTask>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a live-task record; the single-flight guard for `start`.
    pub async fn add(&self, task_id: &str) -> Result<LiveTask> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(task_id) {
            return Err(DtsError::IllegalTransition {
                from: "running".to_string(),
                reason: format!("task {task_id} is already running"),
            });
        }
        let live = LiveTask::new();
        tasks.insert(task_id.to_string(), live.clone());
        Ok(live)
    }

    pub async fn get(&self, task_id: &str) -> Option<LiveTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Cancel the worker, close its pools, drop the record; idempotent.
    pub async fn remove(&self, task_id: &str) {
        let removed = self.tasks.write().await.remove(task_id);
        if let Some(live) = removed {
            live.cancel.cancel();
            live.registry.close_all().await;
            info!(task_id, "task removed from manager");
        }
    }

    /// Sweep entries whose persisted state is terminal. Invoked
    /// periodically by the server binary.
    pub async fn cleanup_completed(&self, store: &dyn TaskStore) {
        let ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        for task_id in ids {
            let terminal = match store.get(&task_id).await {
                Ok(task) => task.state.is_terminal(),
                // a deleted row means the worker is an orphan
                Err(DtsError::NotFound(_)) => true,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "cleanup could not read task");
                    false
                }
            };
            if terminal {
                self.remove(&task_id).await;
            }
        }
    }

    pub async fn count(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn list(&self) -> Vec<String> {
        self.tasks.read().await.keys().cloned().collect()
    }
}
