// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence of replication progress.
//!
//! Stores, per `(store path, remote identifier)`, the last modification time
//! received from that remote in SQLite. A restarted host seeds its engines
//! from here and asks each peer to bootstrap from that time instead of from
//! zero.
//!
//! # Debounced Writes
//!
//! To reduce SQLite write pressure, cursors are debounced:
//! - `set()` updates the in-memory cache immediately and marks the cursor dirty
//! - `flush_dirty()` persists all dirty cursors to disk in a batch
//! - On shutdown, `close()` flushes and checkpoints
//!
//! A crash between `set()` and `flush_dirty()` loses up to one flush interval
//! of progress. The peer then re-sends entries the store already holds,
//! which the conflict rule turns into duplicates.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (5
//! attempts, 10ms doubling to 500ms). The cache is updated first, so a
//! failed flush only delays persistence.
//!
//! ## Cursor Semantics
//!
//! The cursor only moves forward: `set()` with an older time is ignored.
//!
//! ```text
//! lastUpdateTime marker from 2 ──→ engine.set_last_modification_time(2, t)
//!                                 └→ cursor.set("/orders", 2, t)
//! restart ──→ cursor.get("/orders", 2) = t ──→ bootstrap { lastUpdatedTime: t }
//! ```

use crate::config::CursorConfig;
use crate::error::{Result, TreeError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// `(store path, remote identifier)`
type CursorKey = (String, u8);

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_cursor_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Persistent replication cursors backed by SQLite.
pub struct CursorStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<CursorKey, u64>>>,
    dirty: Arc<RwLock<HashSet<CursorKey>>>,
    path: String,
}

impl CursorStore {
    /// Open (creating if needed) the cursor database described by `config`.
    pub async fn open(config: &CursorConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        let in_memory = path == ":memory:";
        info!(path = %path, wal = config.wal_mode, "Initializing cursor store");

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let journal = if config.wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Memory
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| TreeError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        // Every connection to :memory: is its own database, so keep exactly one alive
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_cursors (
                store_path TEXT NOT NULL,
                remote_id INTEGER NOT NULL,
                last_update_time INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (store_path, remote_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64, i64)> =
            sqlx::query_as("SELECT store_path, remote_id, last_update_time FROM replication_cursors")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (store_path, remote_id, time) in rows {
            let Ok(remote) = u8::try_from(remote_id) else {
                warn!(store = %store_path, remote_id, "Skipping cursor with invalid remote id");
                continue;
            };
            debug!(store = %store_path, remote_id, time, "Loaded cursor from disk");
            cache.insert((store_path, remote), time.max(0) as u64);
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored replication cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path,
        })
    }

    /// Last modification time recorded for `remote` on `store_path`.
    pub async fn get(&self, store_path: &str, remote: u8) -> Option<u64> {
        self.cache
            .read()
            .await
            .get(&(store_path.to_string(), remote))
            .copied()
    }

    /// Record progress (debounced). Older times are ignored.
    pub async fn set(&self, store_path: &str, remote: u8, time: u64) {
        let key = (store_path.to_string(), remote);
        {
            let mut cache = self.cache.write().await;
            match cache.get(&key) {
                Some(&current) if current >= time => return,
                _ => {
                    cache.insert(key.clone(), time);
                }
            }
        }
        self.dirty.write().await.insert(key);
        debug!(store = %store_path, remote_id = remote, time, "Cursor updated (pending flush)");
    }

    /// Flush all dirty cursors to disk. Returns the number flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_keys: Vec<CursorKey> = self.dirty.write().await.drain().collect();
        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let now = chrono::Utc::now().timestamp_millis();
        let pending: Vec<(CursorKey, u64)> = {
            let cache = self.cache.read().await;
            dirty_keys
                .into_iter()
                .filter_map(|key| cache.get(&key).map(|&t| (key, t)))
                .collect()
        };
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;
        for ((store_path, remote), time) in pending {
            let result = execute_with_retry("cursor_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO replication_cursors (store_path, remote_id, last_update_time, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(store_path, remote_id) DO UPDATE SET
                        last_update_time = MAX(last_update_time, excluded.last_update_time),
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&store_path)
                .bind(i64::from(remote))
                .bind(time as i64)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(store = %store_path, remote_id = remote, error = %e, "Failed to flush cursor");
                    self.dirty.write().await.insert((store_path, remote));
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty cursors");
            crate::metrics::record_cursor_flush(flushed, errors, started.elapsed());
        }
        if errors > 0 {
            return Err(TreeError::Internal(format!("Failed to flush {} cursors", errors)));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget every cursor of `store_path` (the store was dropped).
    pub async fn delete_store(&self, store_path: &str) -> Result<()> {
        self.cache.write().await.retain(|(path, _), _| path != store_path);
        self.dirty.write().await.retain(|(path, _)| path != store_path);

        let pool = &self.pool;
        let owned = store_path.to_string();
        execute_with_retry("cursor_delete", || async {
            sqlx::query("DELETE FROM replication_cursors WHERE store_path = ?")
                .bind(&owned)
                .execute(pool)
                .await
        })
        .await?;

        info!(store = %store_path, "Deleted replication cursors");
        Ok(())
    }

    /// Every cursor in the cache (diagnostics).
    pub async fn get_all(&self) -> HashMap<(String, u8), u64> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("cursor_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush, checkpoint and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty cursors on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty cursors on close"),
            }
        }
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Cursor store closed");
    }
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore").field("path", &self.path).finish()
    }
}
