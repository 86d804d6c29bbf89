//! Task model: the persisted migration task, its endpoints and its state graph.

pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DtsError, Result};

/// One side of the transfer: a PostgreSQL endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Defaults to the user name when absent in the request.
    pub database: String,
    /// Only `disable` is honored; anything else warns and falls back.
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

impl Endpoint {
    /// Connection string for the endpoint's own database.
    pub fn dsn(&self) -> String {
        self.dsn_for(&self.database)
    }

    /// Connection string for a named database on this endpoint.
    pub fn dsn_for(&self, database: &str) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, database
        )
    }

    /// Connection string for a logical-replication session on a database.
    pub fn replication_dsn(&self, database: &str) -> String {
        format!("{} replication=database", self.dsn_for(database))
    }

    /// Registry key for a database on this endpoint.
    pub fn connection_key(&self, database: &str) -> String {
        format!("{}:{}:{}", self.host, self.port, database)
    }
}

/// A `schema.table` reference; the schema defaults to `public`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `schema.table`, as used in publication definitions.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// The table name on the target, with the task suffix appended.
    pub fn target_table(&self, suffix: &str) -> String {
        format!("{}{}", self.table, suffix)
    }
}

impl FromStr for TableRef {
    type Err = DtsError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DtsError::Validation("empty table name".to_string()));
        }
        match s.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(TableRef::new(schema, table))
            }
            Some(_) => Err(DtsError::Validation(format!("malformed table name '{s}'"))),
            None => Ok(TableRef::new("public", s)),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// The task state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Init,
    Connect,
    CreateTables,
    FullSync,
    IncSync,
    Waiting,
    Validating,
    Paused,
    Completed,
    Failed,
    Deleted,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Init => "init",
            TaskState::Connect => "connect",
            TaskState::CreateTables => "create_tables",
            TaskState::FullSync => "full_sync",
            TaskState::IncSync => "inc_sync",
            TaskState::Waiting => "waiting",
            TaskState::Validating => "validating",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Deleted => "deleted",
        }
    }

    /// Completed, failed and deleted admit no further execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Deleted
        )
    }

    /// Whether a write of `target` is legal from this state.
    ///
    /// This is the only place the transition graph is encoded; the store
    /// performs no validation of its own.
    pub fn can_transition(&self, target: TaskState) -> bool {
        use TaskState::*;
        if *self == Deleted {
            return false;
        }
        if target == Deleted {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match (*self, target) {
            // any non-terminal state may pause or fail
            (Paused, Paused) => false,
            (_, Paused) | (_, Failed) => true,
            // resume restores the recorded pre-pause state
            (Paused, t) => !t.is_terminal(),
            (Init, Connect)
            | (Connect, CreateTables)
            | (CreateTables, FullSync)
            | (FullSync, IncSync)
            | (IncSync, Waiting)
            | (Waiting, Validating)
            | (Validating, Completed) => true,
            _ => false,
        }
    }

    /// Fixed progress anchor written on entry to the stage.
    pub fn progress_anchor(&self) -> i32 {
        match self {
            TaskState::Init => 5,
            TaskState::Connect => 15,
            TaskState::CreateTables => 30,
            TaskState::FullSync => 60,
            TaskState::IncSync => 75,
            TaskState::Waiting => 80,
            TaskState::Validating => 95,
            TaskState::Completed => 100,
            _ => 0,
        }
    }

    /// The coarse stage reported by the status API.
    pub fn api_stage(&self) -> ApiStage {
        match self {
            TaskState::Init | TaskState::Failed | TaskState::Deleted => ApiStage::None,
            TaskState::Connect
            | TaskState::CreateTables
            | TaskState::FullSync
            | TaskState::IncSync => ApiStage::Syncing,
            TaskState::Waiting | TaskState::Paused => ApiStage::Waiting,
            TaskState::Validating => ApiStage::Switching,
            TaskState::Completed => ApiStage::Finished,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = DtsError;

    /// Parses both the canonical names and the legacy vocabulary still found
    /// in rows written by the previous service generation.
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "init" => TaskState::Init,
            "connect" => TaskState::Connect,
            "create_tables" | "creating_tables" => TaskState::CreateTables,
            "full_sync" | "migrating_data" => TaskState::FullSync,
            "inc_sync" | "syncing_wal" => TaskState::IncSync,
            "waiting" => TaskState::Waiting,
            "validating" | "stopping_writes" => TaskState::Validating,
            "paused" => TaskState::Paused,
            "completed" | "finalizing" => TaskState::Completed,
            "failed" => TaskState::Failed,
            "deleted" => TaskState::Deleted,
            other => {
                return Err(DtsError::Validation(format!("unknown task state '{other}'")));
            }
        })
    }
}

/// Coarse stage exposed on the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStage {
    None,
    Syncing,
    Waiting,
    Switching,
    Finished,
}

impl ApiStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStage::None => "none",
            ApiStage::Syncing => "syncing",
            ApiStage::Waiting => "waiting",
            ApiStage::Switching => "switching",
            ApiStage::Finished => "finished",
        }
    }
}

/// The persisted migration task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub database_type: String,
    pub source: Endpoint,
    pub dest: Endpoint,
    /// Empty means "all business tables discovered at connect time".
    pub tables: Vec<TableRef>,
    pub table_suffix: String,
    pub state: TaskState,
    /// Stage recorded when the task was paused; resume returns here.
    pub resume_state: Option<TaskState>,
    pub progress: i32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        source: Endpoint,
        dest: Endpoint,
        tables: Vec<TableRef>,
        table_suffix: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            database_type: "postgresql".to_string(),
            source,
            dest,
            tables,
            table_suffix: table_suffix.into(),
            state: TaskState::Init,
            resume_state: None,
            progress: 0,
            last_error: String::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Milliseconds from start to completion; `None` unless completed.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.state, self.started_at, self.completed_at) {
            (TaskState::Completed, Some(start), Some(end)) => {
                Some((end - start).num_milliseconds())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref_parse() {
        let t: TableRef = "users".parse().unwrap();
        assert_eq!(t, TableRef::new("public", "users"));

        let t: TableRef = "sales.orders".parse().unwrap();
        assert_eq!(t, TableRef::new("sales", "orders"));
        assert_eq!(t.qualified(), "sales.orders");
        assert_eq!(t.target_table("_v2"), "orders_v2");

        assert!("".parse::<TableRef>().is_err());
        assert!(".orders".parse::<TableRef>().is_err());
        assert!("sales.".parse::<TableRef>().is_err());
    }

    #[test]
    fn test_endpoint_dsn_shapes() {
        let ep = Endpoint {
            host: "db1".into(),
            port: 5433,
            user: "app".into(),
            password: "secret".into(),
            database: "shop".into(),
            ssl_mode: "disable".into(),
        };
        assert_eq!(
            ep.dsn(),
            "host=db1 port=5433 user=app password=secret dbname=shop"
        );
        assert!(ep.replication_dsn("shop").ends_with("replication=database"));
        assert_eq!(ep.connection_key("shop"), "db1:5433:shop");
    }

    #[test]
    fn test_state_roundtrip_and_aliases() {
        for s in [
            TaskState::Init,
            TaskState::Connect,
            TaskState::CreateTables,
            TaskState::FullSync,
            TaskState::IncSync,
            TaskState::Waiting,
            TaskState::Validating,
            TaskState::Paused,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Deleted,
        ] {
            assert_eq!(s.as_str().parse::<TaskState>().unwrap(), s);
        }

        // legacy vocabulary
        assert_eq!(
            "creating_tables".parse::<TaskState>().unwrap(),
            TaskState::CreateTables
        );
        assert_eq!(
            "migrating_data".parse::<TaskState>().unwrap(),
            TaskState::FullSync
        );
        assert_eq!(
            "syncing_wal".parse::<TaskState>().unwrap(),
            TaskState::IncSync
        );
        assert_eq!(
            "stopping_writes".parse::<TaskState>().unwrap(),
            TaskState::Validating
        );
        assert_eq!(
            "finalizing".parse::<TaskState>().unwrap(),
            TaskState::Completed
        );
        assert!("bogus".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_forward_transitions() {
        use TaskState::*;
        let chain = [
            Init,
            Connect,
            CreateTables,
            FullSync,
            IncSync,
            Waiting,
            Validating,
            Completed,
        ];
        for pair in chain.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
        // no skipping stages
        assert!(!Init.can_transition(CreateTables));
        assert!(!Connect.can_transition(FullSync));
        assert!(!IncSync.can_transition(Validating));
        assert!(!Waiting.can_transition(Completed));
    }

    #[test]
    fn test_pause_fail_delete_edges() {
        use TaskState::*;
        for s in [Init, Connect, CreateTables, FullSync, IncSync, Waiting, Validating] {
            assert!(s.can_transition(Paused));
            assert!(s.can_transition(Failed));
        }
        // terminal states only admit delete
        for s in [Completed, Failed] {
            assert!(!s.can_transition(Paused));
            assert!(!s.can_transition(IncSync));
            assert!(s.can_transition(Deleted));
        }
        assert!(!Deleted.can_transition(Deleted));
        // resume: paused may return to any non-terminal stage, never a terminal one
        assert!(Paused.can_transition(FullSync));
        assert!(Paused.can_transition(Init));
        assert!(Paused.can_transition(Waiting));
        assert!(!Paused.can_transition(Completed));
        assert!(!Paused.can_transition(Paused));
    }

    #[test]
    fn test_progress_anchors_monotone_along_pipeline() {
        use TaskState::*;
        let chain = [
            Init,
            Connect,
            CreateTables,
            FullSync,
            IncSync,
            Waiting,
            Validating,
            Completed,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].progress_anchor() < pair[1].progress_anchor());
        }
        assert_eq!(Completed.progress_anchor(), 100);
    }

    #[test]
    fn test_api_stage_mapping() {
        use TaskState::*;
        assert_eq!(Init.api_stage(), ApiStage::None);
        assert_eq!(Failed.api_stage(), ApiStage::None);
        assert_eq!(Deleted.api_stage(), ApiStage::None);
        for s in [Connect, CreateTables, FullSync, IncSync] {
            assert_eq!(s.api_stage(), ApiStage::Syncing);
        }
        assert_eq!(Waiting.api_stage(), ApiStage::Waiting);
        assert_eq!(Paused.api_stage(), ApiStage::Waiting);
        assert_eq!(Validating.api_stage(), ApiStage::Switching);
        assert_eq!(Completed.api_stage(), ApiStage::Finished);
    }

    #[test]
    fn test_duration_only_when_completed() {
        let ep = Endpoint {
            host: "h".into(),
            port: 5432,
            user: "u".into(),
            password: "p".into(),
            database: "d".into(),
            ssl_mode: "disable".into(),
        };
        let mut task = Task::new("t1", ep.clone(), ep, vec![], "");
        assert_eq!(task.duration_ms(), None);

        task.started_at = Some(Utc::now() - chrono::Duration::seconds(3));
        task.completed_at = Some(Utc::now());
        assert_eq!(task.duration_ms(), None); // still not in completed state

        task.state = TaskState::Completed;
        assert!(task.duration_ms().unwrap() >= 3000);
    }
}
