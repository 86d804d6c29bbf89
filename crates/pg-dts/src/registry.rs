//! Per-task connection registry.
//!
//! Every running task owns one registry mapping `host:port:dbname` to a
//! bounded connection pool. Pools are shared by all stages of the task and
//! closed only at terminal teardown. A cached pool is health-checked with a
//! round-trip ping before reuse and replaced when the ping fails.

use std::collections::HashMap;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio::sync::RwLock;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, warn};

use crate::error::{DtsError, Result};
use crate::task::Endpoint;

/// Upper bound on open connections per pool.
const MAX_POOL_SIZE: usize = 10;

/// Registry of database pools owned by a single task.
#[derive(Default)]
pub struct ConnectionRegistry {
    pools: RwLock<HashMap<String, Pool>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a healthy pool for `database` on `endpoint`, creating or
    /// replacing one as needed.
    pub async fn get_or_create(&self, endpoint: &Endpoint, database: &str) -> Result<Pool> {
        let key = endpoint.connection_key(database);

        if let Some(pool) = self.pools.read().await.get(&key).cloned() {
            if ping(&pool).await {
                return Ok(pool);
            }
            warn!(key = %key, "cached connection failed ping, replacing");
        }

        let pool = build_pool(endpoint, database)?;

        // Verify the new pool before caching it.
        let client = pool
            .get()
            .await
            .map_err(|e| DtsError::pool(e, format!("connecting to {key}")))?;
        client.simple_query("SELECT 1").await?;
        drop(client);

        debug!(key = %key, "opened connection pool");
        self.pools.write().await.insert(key, pool.clone());
        Ok(pool)
    }

    /// Number of live pools, for observability and leak checks.
    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }

    /// Close every pool and clear the map; idempotent.
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (key, pool) in pools.drain() {
            pool.close();
            debug!(key = %key, "closed connection pool");
        }
    }
}

/// Build a bounded pool for one database on an endpoint.
fn build_pool(endpoint: &Endpoint, database: &str) -> Result<Pool> {
    if endpoint.ssl_mode != "disable" {
        warn!(
            ssl_mode = %endpoint.ssl_mode,
            "TLS is not supported; connecting without encryption"
        );
    }

    let mut pg_config = PgConfig::new();
    pg_config
        .host(&endpoint.host)
        .port(endpoint.port)
        .user(&endpoint.user)
        .password(&endpoint.password)
        .dbname(database);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    Pool::builder(mgr)
        .max_size(MAX_POOL_SIZE)
        .build()
        .map_err(|e| DtsError::pool(e, format!("building pool for {}", endpoint.connection_key(database))))
}

/// Round-trip health check.
async fn ping(pool: &Pool) -> bool {
    match pool.get().await {
        Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
        Err(_) => false,
    }
}
