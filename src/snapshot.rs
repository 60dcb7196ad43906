//! Snapshot persistence
//!
//! SQLite-based persistence with a JSON backup file. The bot snapshot is an
//! aggregate of plain serde structs: pair state, ledger, and the four model
//! snapshots. Unknown JSON fields are ignored on load; a missing component
//! simply restores to defaults.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::ledger::LedgerSnapshot;
use crate::models::{BocpdSnapshot, KellySnapshot, SurvivalSnapshot, ThroughputSnapshot};
use crate::pair::PairState;

/// Everything needed to resume the bot after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotSnapshot {
    #[serde(default)]
    pub saved_at: f64,
    #[serde(default)]
    pub pair: Option<PairState>,
    #[serde(default)]
    pub ledger: Option<LedgerSnapshot>,
    #[serde(default)]
    pub bocpd: Option<BocpdSnapshot>,
    #[serde(default)]
    pub kelly: Option<KellySnapshot>,
    #[serde(default)]
    pub throughput: Option<ThroughputSnapshot>,
    #[serde(default)]
    pub survival: Option<SurvivalSnapshot>,
}

pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
    json_backup_path: PathBuf,
    auto_backup: bool,
}

impl SqliteSnapshotStore {
    pub fn new<P: AsRef<Path>>(db_path: P, json_backup_path: P, auto_backup: bool) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_backup_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: json_backup_path.as_ref().to_path_buf(),
            auto_backup,
        };
        store.create_tables()?;
        info!("SQLite snapshot store initialized");
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                saved_at REAL NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_saved_at ON snapshots(saved_at)",
            [],
        )?;
        debug!("Snapshot schema created/verified");
        Ok(())
    }

    /// Persist one snapshot row (and refresh the JSON backup when enabled).
    pub fn save(&self, snapshot: &BotSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO snapshots (saved_at, payload) VALUES (?1, ?2)",
                params![snapshot.saved_at, payload],
            )?;
        }
        debug!("Snapshot saved: saved_at={:.0}", snapshot.saved_at);

        if self.auto_backup {
            self.export_json(snapshot)?;
        }
        Ok(())
    }

    /// Load the most recent snapshot, if any.
    pub fn load_latest(&self) -> Result<Option<BotSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT payload FROM snapshots ORDER BY id DESC LIMIT 1")?;
        let row = stmt.query_row([], |row| row.get::<_, String>(0));

        match row {
            Ok(payload) => {
                let snapshot: BotSnapshot =
                    serde_json::from_str(&payload).context("Failed to parse snapshot payload")?;
                info!("Loaded snapshot: saved_at={:.0}", snapshot.saved_at);
                Ok(Some(snapshot))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                debug!("No snapshot found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn export_json(&self, snapshot: &BotSnapshot) -> Result<()> {
        let wrapped = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "snapshot": snapshot,
        });
        std::fs::write(&self.json_backup_path, serde_json::to_string_pretty(&wrapped)?)?;
        debug!("Snapshot exported to: {}", self.json_backup_path.display());
        Ok(())
    }
}

/// Open (or create) the snapshot store under a state directory.
pub fn create_snapshot_store<P: AsRef<Path>>(state_dir: P) -> Result<SqliteSnapshotStore> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir)?;
    let db_path = state_dir.join("gridpair_state.db");
    let json_path = state_dir.join("gridpair_state.json");
    SqliteSnapshotStore::new(db_path, json_path, true)
}

/// Read a snapshot back from a JSON backup file (either the wrapped export
/// format or a bare snapshot object).
pub fn load_snapshot_json<P: AsRef<Path>>(path: P) -> Result<BotSnapshot> {
    let contents = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read snapshot file: {}", path.as_ref().display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&contents).context("Failed to parse snapshot JSON")?;
    let inner = value.get("snapshot").cloned().unwrap_or(value);
    let snapshot: BotSnapshot =
        serde_json::from_value(inner).context("Failed to decode snapshot payload")?;
    Ok(snapshot)
}
