//! # pg-dts
//!
//! Online PostgreSQL data transfer service.
//!
//! Copies a set of tables from a source instance to a target instance while
//! the source keeps taking writes, then performs a controlled switchover:
//!
//! - **Full copy** over the COPY protocol, per table
//! - **Incremental sync** consuming the source's logical WAL stream
//!   (`pgoutput` over a replication slot and publication)
//! - **Switchover** that stops writes on the source and validates row
//!   counts before declaring the migration complete
//!
//! Each migration is a durable task driven by a state machine
//! (`init → connect → create_tables → full_sync → inc_sync → waiting →
//! validating → completed`) and controlled through a small HTTP API
//! (create / start / pause / resume / stop / switch / delete / status).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pg_dts::service::DtsService;
//! use pg_dts::task::store::MemoryTaskStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryTaskStore::new());
//!     let service = Arc::new(DtsService::new(store));
//!     let app = pg_dts::http::router(service);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod machine;
pub mod manager;
pub mod registry;
pub mod replication;
pub mod service;
pub mod source;
pub mod target;
pub mod task;
pub mod wal;

// Re-exports for convenient access
pub use config::{Config, LogConfig, MetadataConfig, ServerConfig};
pub use error::{DtsError, Result};
pub use manager::TaskManager;
pub use registry::ConnectionRegistry;
pub use service::{DtsService, TaskStatus};
pub use task::store::{MemoryTaskStore, PgTaskStore, TaskStore};
pub use task::{ApiStage, Endpoint, TableRef, Task, TaskState};
