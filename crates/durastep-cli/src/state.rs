//! Application state shared by the CLI commands.
//!
//! Resolves the data directory and database file, opens the split SQLite
//! pool, and pins the store ports to their SQLite implementations.

use std::path::PathBuf;

use anyhow::Context;

use durastep_infra::config::load_engine_config;
use durastep_infra::sqlite::pool::{DatabasePool, default_data_dir};
use durastep_infra::sqlite::{SqliteSnapshotStore, SqliteStreamStore};
use durastep_types::config::EngineConfig;

pub struct AppState {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config: EngineConfig,
    pub snapshots: SqliteSnapshotStore,
    pub streams: SqliteStreamStore,
}

impl AppState {
    /// Open the database at `db`, or `{data_dir}/durastep.db` when not given.
    pub async fn init(db: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = default_data_dir();
        let db_path = db.unwrap_or_else(|| data_dir.join("durastep.db"));

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let pool = DatabasePool::open(&db_path)
            .await
            .with_context(|| format!("failed to open database {}", db_path.display()))?;
        let config = load_engine_config(&data_dir).await;
        tracing::debug!(db = %db_path.display(), "workflow database ready");

        Ok(Self {
            data_dir,
            db_path,
            config,
            snapshots: SqliteSnapshotStore::new(pool.clone()),
            streams: SqliteStreamStore::new(pool),
        })
    }
}
