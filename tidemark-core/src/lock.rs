//! Cross-process changelog lock.
//!
//! A single row in a lock table serializes passes against one database.
//! Acquisition is a conditional update (`locked = FALSE` → `TRUE`) retried by
//! polling; it never reads then writes. A held lock is represented by a
//! [`LockGuard`] that must be released with [`LockGuard::release`]. When the
//! guard is dropped without that call (early return, cancelled future) it
//! rolls back the owning session and releases the row on a spawned task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Client;

use crate::config::LockSettings;
use crate::db::{quote_ident, Database};
use crate::error::{Result, TidemarkError};

/// Attempts made to create the lock table before giving up.
const INIT_ATTEMPTS: u32 = 10;

/// State of the lock row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub locked: bool,
    pub holder: Option<String>,
    pub granted: Option<DateTime<Utc>>,
}

impl LockRecord {
    pub fn granted_display(&self) -> String {
        self.granted
            .map(|g| g.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Storage of the single lock row.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create the table and its row when absent.
    async fn ensure_table(&self) -> Result<()>;

    /// Take the lock if it is free. Returns whether this call took it.
    async fn try_acquire(&self, holder: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Take over a lock still matching `previous` exactly.
    async fn reclaim(&self, previous: &LockRecord, holder: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Free the lock if `holder` owns it. Returns whether a row changed.
    async fn release(&self, holder: &str) -> Result<bool>;

    /// Free the lock whoever owns it.
    async fn force_release(&self) -> Result<bool>;

    async fn current(&self) -> Result<LockRecord>;
}

/// Identity written to the lock row: `user@host (pid N)`.
pub fn default_holder() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{} (pid {})", user, host, std::process::id())
}

/// Acquires and releases the changelog lock for this process.
pub struct LockService {
    store: Arc<dyn LockStore>,
    holder: String,
    settings: LockSettings,
}

impl LockService {
    pub fn new(store: Arc<dyn LockStore>, settings: LockSettings) -> Self {
        let holder = settings.holder.clone().unwrap_or_else(default_holder);
        Self {
            store,
            holder,
            settings,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Create the lock table, retrying with jitter when concurrent creators collide.
    pub async fn init(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.ensure_table().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < INIT_ATTEMPTS => {
                    let delay = Duration::from_millis(fastrand::u64(50..500));
                    log::debug!(
                        "Lock table creation failed, retrying; attempt={}, delay_ms={}, error={}",
                        attempt,
                        delay.as_millis() as u64,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquire with the configured wait timeout and poll interval.
    pub async fn acquire(&self, session: Option<Arc<dyn Database>>) -> Result<LockGuard> {
        self.acquire_with(
            Duration::from_secs(self.settings.wait_timeout_secs),
            Duration::from_millis(self.settings.poll_interval_ms.max(1)),
            session,
        )
        .await
    }

    /// Poll for the lock until `timeout` elapses.
    ///
    /// `session` is rolled back by the guard's drop fallback so an abandoned
    /// pass never leaves an open transaction behind.
    pub async fn acquire_with(
        &self,
        timeout: Duration,
        poll: Duration,
        session: Option<Arc<dyn Database>>,
    ) -> Result<LockGuard> {
        self.init().await?;
        let started = tokio::time::Instant::now();
        let mut announced = false;

        loop {
            if self.store.try_acquire(&self.holder, Utc::now()).await? {
                log::debug!("Changelog lock acquired; holder={}", self.holder);
                return Ok(self.guard(session));
            }

            let current = self.store.current().await?;
            if self.is_stale(&current) && self.store.reclaim(&current, &self.holder, Utc::now()).await? {
                log::warn!(
                    "Reclaimed stale changelog lock; previous_holder={}, granted={}",
                    current.holder.as_deref().unwrap_or("unknown"),
                    current.granted_display()
                );
                return Ok(self.guard(session));
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(TidemarkError::LockTimeout {
                    holder: current.holder.clone().unwrap_or_else(|| "unknown".to_string()),
                    granted: current.granted_display(),
                    waited_secs: waited.as_secs(),
                });
            }

            if !announced && current.locked {
                log::info!(
                    "Waiting for changelog lock; holder={}, granted={}",
                    current.holder.as_deref().unwrap_or("unknown"),
                    current.granted_display()
                );
                announced = true;
            }
            tokio::time::sleep(poll.min(timeout - waited)).await;
        }
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        let Some(stale_after) = self.settings.stale_after_secs else {
            return false;
        };
        if !record.locked {
            return false;
        }
        match record.granted {
            Some(granted) => {
                let age = Utc::now().signed_duration_since(granted);
                age.num_seconds() >= stale_after as i64
            }
            None => true,
        }
    }

    fn guard(&self, session: Option<Arc<dyn Database>>) -> LockGuard {
        LockGuard {
            store: Arc::clone(&self.store),
            holder: self.holder.clone(),
            session,
            released: false,
        }
    }

    /// Release the lock if this process holds it.
    pub async fn release(&self) -> Result<bool> {
        self.store.release(&self.holder).await
    }

    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.current().await?.locked)
    }

    /// Clear the lock regardless of who holds it.
    pub async fn force_release_all(&self) -> Result<bool> {
        self.init().await?;
        let released = self.store.force_release().await?;
        log::info!("Changelog lock force-released; was_locked={}", released);
        Ok(released)
    }

    pub async fn current(&self) -> Result<LockRecord> {
        self.init().await?;
        self.store.current().await
    }
}

/// A held changelog lock.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    holder: String,
    session: Option<Arc<dyn Database>>,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("holder", &self.holder)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release the lock.
    pub async fn release(mut self) -> Result<()> {
        let released = self.store.release(&self.holder).await?;
        self.released = true;
        if !released {
            log::warn!(
                "Changelog lock was no longer held at release; holder={}",
                self.holder
            );
        } else {
            log::debug!("Changelog lock released; holder={}", self.holder);
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let holder = self.holder.clone();
        let session = self.session.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(db) = session {
                        if let Err(e) = db.rollback().await {
                            log::warn!("Rollback of abandoned pass failed; error={}", e);
                        }
                    }
                    match store.release(&holder).await {
                        Ok(_) => log::warn!("Changelog lock released after abandoned pass; holder={}", holder),
                        Err(e) => log::warn!(
                            "Failed to release changelog lock after abandoned pass; holder={}, error={}",
                            holder,
                            e
                        ),
                    }
                });
            }
            Err(_) => log::warn!(
                "Changelog lock not released, no async runtime available; holder={}",
                holder
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL store
// ---------------------------------------------------------------------------

/// Lock table in a PostgreSQL schema.
pub struct PgLockStore {
    client: Arc<Client>,
    schema: String,
    table: String,
}

impl PgLockStore {
    pub fn new(client: Arc<Client>, schema: &str, table: &str) -> Self {
        Self {
            client,
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    fn fq(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            r#"
CREATE TABLE IF NOT EXISTS {fq} (
    id          INTEGER PRIMARY KEY,
    locked      BOOLEAN NOT NULL,
    lockgranted TIMESTAMPTZ,
    lockedby    VARCHAR(255)
);
INSERT INTO {fq} (id, locked) VALUES (1, FALSE) ON CONFLICT (id) DO NOTHING;
"#,
            fq = self.fq(),
        );
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| TidemarkError::LockError(format!("Failed to create lock table: {}", e)))?;
        Ok(())
    }

    async fn try_acquire(&self, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET locked = TRUE, lockgranted = $1, lockedby = $2 \
             WHERE id = 1 AND locked = FALSE",
            self.fq()
        );
        let count = self
            .client
            .execute(&sql, &[&now, &holder])
            .await
            .map_err(|e| TidemarkError::LockError(format!("Failed to acquire lock: {}", e)))?;
        Ok(count == 1)
    }

    async fn reclaim(
        &self,
        previous: &LockRecord,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET lockgranted = $1, lockedby = $2 \
             WHERE id = 1 AND locked = TRUE \
             AND lockedby IS NOT DISTINCT FROM $3 AND lockgranted IS NOT DISTINCT FROM $4",
            self.fq()
        );
        let count = self
            .client
            .execute(&sql, &[&now, &holder, &previous.holder, &previous.granted])
            .await
            .map_err(|e| TidemarkError::LockError(format!("Failed to reclaim lock: {}", e)))?;
        Ok(count == 1)
    }

    async fn release(&self, holder: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET locked = FALSE, lockgranted = NULL, lockedby = NULL \
             WHERE id = 1 AND locked = TRUE AND lockedby = $1",
            self.fq()
        );
        let count = self
            .client
            .execute(&sql, &[&holder])
            .await
            .map_err(|e| TidemarkError::LockError(format!("Failed to release lock: {}", e)))?;
        Ok(count == 1)
    }

    async fn force_release(&self) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET locked = FALSE, lockgranted = NULL, lockedby = NULL \
             WHERE id = 1 AND locked = TRUE",
            self.fq()
        );
        let count = self
            .client
            .execute(&sql, &[])
            .await
            .map_err(|e| TidemarkError::LockError(format!("Failed to release lock: {}", e)))?;
        Ok(count == 1)
    }

    async fn current(&self) -> Result<LockRecord> {
        let sql = format!(
            "SELECT locked, lockgranted, lockedby FROM {} WHERE id = 1",
            self.fq()
        );
        let row = self
            .client
            .query_opt(&sql, &[])
            .await
            .map_err(|e| TidemarkError::LockError(format!("Failed to read lock: {}", e)))?;
        Ok(match row {
            Some(row) => LockRecord {
                locked: row.get(0),
                granted: row.get(1),
                holder: row.get(2),
            },
            None => LockRecord::default(),
        })
    }
}
