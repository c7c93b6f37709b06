//! The execution ledger: one row per applied change set.
//!
//! [`HistoryService`] owns all reads and writes of the ledger. It caches the
//! ledger for one pass; [`HistoryService::reset`] must be called at the start
//! of every pass so a long-lived process never acts on stale history.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Client;

use crate::changeset::{ChangeSet, ChangeSetId};
use crate::checksum::{self, CheckSum};
use crate::db::quote_ident;
use crate::error::{Result, TidemarkError};

/// Logical path of rows the engine writes for itself (tag markers).
pub const INTERNAL_PATH: &str = "tidemark-internal";

/// Author recorded on internal rows.
pub const INTERNAL_AUTHOR: &str = "tidemark";

/// Version string recorded with every row.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How a ledger row came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecType {
    Executed,
    Failed,
    Skipped,
    Reran,
    MarkRan,
}

impl ExecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecType::Executed => "EXECUTED",
            ExecType::Failed => "FAILED",
            ExecType::Skipped => "SKIPPED",
            ExecType::Reran => "RERAN",
            ExecType::MarkRan => "MARK_RAN",
        }
    }

    /// Whether rolling the row back must run inverse statements.
    pub fn ran_statements(&self) -> bool {
        matches!(self, ExecType::Executed | ExecType::Reran)
    }
}

impl std::fmt::Display for ExecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecType {
    type Err = TidemarkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "EXECUTED" => Ok(ExecType::Executed),
            "FAILED" => Ok(ExecType::Failed),
            "SKIPPED" => Ok(ExecType::Skipped),
            "RERAN" => Ok(ExecType::Reran),
            "MARK_RAN" => Ok(ExecType::MarkRan),
            other => Err(TidemarkError::StatementFailed(format!(
                "Unknown exec type '{}' in ledger",
                other
            ))),
        }
    }
}

/// A row of the ledger table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RanChangeSet {
    #[serde(flatten)]
    pub identity: ChangeSetId,
    /// `None` after `clear_checksums` or for internal rows.
    pub checksum: Option<CheckSum>,
    pub exec_type: ExecType,
    pub date_executed: DateTime<Utc>,
    /// Monotonically increasing across the whole ledger.
    pub order_executed: i32,
    pub tag: Option<String>,
    pub deployment_id: Option<String>,
    pub description: String,
    pub comments: Option<String>,
    pub contexts: Option<String>,
    pub labels: Option<String>,
    pub tool_version: String,
}

impl RanChangeSet {
    /// Rows the engine wrote for itself rather than for an authored change set.
    pub fn is_internal(&self) -> bool {
        self.identity.path == INTERNAL_PATH
    }
}

/// Persistence of ledger rows. Implementations must keep the row shape stable.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn table_exists(&self) -> Result<bool>;

    /// Create the ledger table when it is absent.
    async fn ensure_table(&self) -> Result<()>;

    /// Every row, ordered by execution date then order number.
    async fn load(&self) -> Result<Vec<RanChangeSet>>;

    async fn insert(&self, row: &RanChangeSet) -> Result<()>;

    /// Overwrite the row with the same identity.
    async fn update(&self, row: &RanChangeSet) -> Result<()>;

    async fn delete(&self, identity: &ChangeSetId) -> Result<()>;

    async fn update_checksum(&self, identity: &ChangeSetId, checksum: &CheckSum) -> Result<()>;

    /// Null every stored checksum. Returns the number of rows touched.
    async fn clear_checksums(&self) -> Result<u64>;

    async fn set_tag(&self, identity: &ChangeSetId, tag: &str) -> Result<()>;
}

/// Cached, pass-scoped access to the ledger.
pub struct HistoryService {
    store: Arc<dyn HistoryStore>,
    cache: Mutex<Option<Vec<RanChangeSet>>>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(None),
        }
    }

    fn cache(&self) -> MutexGuard<'_, Option<Vec<RanChangeSet>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop the cached ledger.
    pub fn reset(&self) {
        *self.cache() = None;
    }

    /// Create the ledger table if needed.
    pub async fn init(&self) -> Result<()> {
        self.store.ensure_table().await
    }

    /// All ledger rows in execution order. Empty when the table does not exist yet.
    pub async fn ran_change_sets(&self) -> Result<Vec<RanChangeSet>> {
        if let Some(rows) = self.cache().as_ref() {
            return Ok(rows.clone());
        }
        if !self.store.table_exists().await? {
            return Ok(Vec::new());
        }
        let rows = self.store.load().await?;
        log::debug!("Loaded ledger; rows={}", rows.len());
        *self.cache() = Some(rows.clone());
        Ok(rows)
    }

    pub async fn find(&self, identity: &ChangeSetId) -> Result<Option<RanChangeSet>> {
        Ok(self
            .ran_change_sets()
            .await?
            .into_iter()
            .find(|r| &r.identity == identity))
    }

    /// The order number the next written row will carry.
    pub async fn next_sequence_value(&self) -> Result<i32> {
        let rows = self.ran_change_sets().await?;
        Ok(rows.iter().map(|r| r.order_executed).max().unwrap_or(0) + 1)
    }

    /// Record a change set. An existing row for the same identity is updated in place.
    pub async fn append(
        &self,
        change_set: &ChangeSet,
        exec_type: ExecType,
        deployment_id: &str,
    ) -> Result<RanChangeSet> {
        let existing = self.find(change_set.identity()).await?;
        let row = RanChangeSet {
            identity: change_set.identity().clone(),
            checksum: Some(change_set.checksum().clone()),
            exec_type,
            date_executed: Utc::now(),
            order_executed: self.next_sequence_value().await?,
            // A rerun keeps a tag placed on the row unless the change set carries its own.
            tag: change_set
                .tag()
                .map(str::to_string)
                .or_else(|| existing.as_ref().and_then(|r| r.tag.clone())),
            deployment_id: Some(deployment_id.to_string()),
            description: change_set.description(),
            comments: change_set.comments().map(str::to_string),
            contexts: non_empty(change_set.contexts().source()),
            labels: non_empty(change_set.labels().source()),
            tool_version: TOOL_VERSION.to_string(),
        };

        if existing.is_some() {
            self.store.update(&row).await?;
        } else {
            self.store.insert(&row).await?;
        }
        log::debug!(
            "Ledger row written; change_set={}, exec_type={}, order={}",
            row.identity,
            row.exec_type,
            row.order_executed
        );

        if let Some(rows) = self.cache().as_mut() {
            rows.retain(|r| r.identity != row.identity);
            rows.push(row.clone());
        }
        Ok(row)
    }

    /// Delete the row for a change set.
    pub async fn remove(&self, identity: &ChangeSetId) -> Result<()> {
        self.store.delete(identity).await?;
        if let Some(rows) = self.cache().as_mut() {
            rows.retain(|r| &r.identity != identity);
        }
        Ok(())
    }

    /// Stamp the most recent row with `name`.
    ///
    /// On an empty ledger an internal marker row is written so the tag can
    /// still serve as a rollback target.
    pub async fn tag(&self, name: &str) -> Result<RanChangeSet> {
        let rows = self.ran_change_sets().await?;
        let mut row = match rows.last() {
            Some(last) => {
                self.store.set_tag(&last.identity, name).await?;
                last.clone()
            }
            None => {
                let marker = RanChangeSet {
                    identity: ChangeSetId::new(&format!("tag-{}", name), INTERNAL_AUTHOR, INTERNAL_PATH),
                    checksum: None,
                    exec_type: ExecType::Executed,
                    date_executed: Utc::now(),
                    order_executed: 1,
                    tag: Some(name.to_string()),
                    deployment_id: None,
                    description: format!("tagDatabase {}", name),
                    comments: None,
                    contexts: None,
                    labels: None,
                    tool_version: TOOL_VERSION.to_string(),
                };
                self.store.insert(&marker).await?;
                marker
            }
        };
        row.tag = Some(name.to_string());

        if let Some(cached) = self.cache().as_mut() {
            cached.retain(|r| r.identity != row.identity);
            cached.push(row.clone());
        }
        log::info!("Tagged ledger; tag={}, change_set={}", name, row.identity);
        Ok(row)
    }

    pub async fn tag_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .ran_change_sets()
            .await?
            .iter()
            .any(|r| r.tag.as_deref() == Some(name)))
    }

    /// Null every stored checksum so the next pass recomputes them.
    pub async fn clear_checksums(&self) -> Result<u64> {
        if !self.store.table_exists().await? {
            return Ok(0);
        }
        let count = self.store.clear_checksums().await?;
        self.reset();
        Ok(count)
    }

    pub async fn update_checksum(&self, identity: &ChangeSetId, sum: &CheckSum) -> Result<()> {
        self.store.update_checksum(identity, sum).await?;
        if let Some(rows) = self.cache().as_mut() {
            if let Some(row) = rows.iter_mut().find(|r| &r.identity == identity) {
                row.checksum = Some(sum.clone());
            }
        }
        Ok(())
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL store
// ---------------------------------------------------------------------------

/// Ledger table in a PostgreSQL schema.
pub struct PgHistoryStore {
    client: Arc<Client>,
    schema: String,
    table: String,
}

impl PgHistoryStore {
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
impl HistoryStore for PgHistoryStore {
    async fn table_exists(&self) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                )",
                &[&self.schema, &self.table],
            )
            .await?;
        Ok(row.get::<_, bool>(0))
    }

    async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            r#"
CREATE TABLE IF NOT EXISTS {fq} (
    id            VARCHAR(255) NOT NULL,
    author        VARCHAR(255) NOT NULL,
    filename      VARCHAR(255) NOT NULL,
    dateexecuted  TIMESTAMPTZ NOT NULL,
    orderexecuted INTEGER NOT NULL,
    exectype      VARCHAR(10) NOT NULL,
    checksum      VARCHAR(80),
    description   VARCHAR(255),
    comments      VARCHAR(255),
    tag           VARCHAR(255),
    tool_version  VARCHAR(20),
    contexts      VARCHAR(255),
    labels        VARCHAR(255),
    deployment_id VARCHAR(10),
    PRIMARY KEY (id, author, filename)
);
"#,
            fq = self.fq(),
        );
        self.client.batch_execute(&sql).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<RanChangeSet>> {
        let sql = format!(
            "SELECT id, author, filename, checksum, exectype, dateexecuted, orderexecuted, \
             tag, deployment_id, description, comments, contexts, labels, tool_version \
             FROM {} ORDER BY dateexecuted, orderexecuted",
            self.fq()
        );
        let rows = self.client.query(&sql, &[]).await?;

        let mut ran = Vec::with_capacity(rows.len());
        for row in rows {
            let stored: Option<String> = row.get(3);
            let exec_type: String = row.get(4);
            ran.push(RanChangeSet {
                identity: ChangeSetId {
                    id: row.get(0),
                    author: row.get(1),
                    path: row.get(2),
                },
                checksum: checksum::parse_stored(stored.as_deref())?,
                exec_type: exec_type.parse()?,
                date_executed: row.get(5),
                order_executed: row.get(6),
                tag: row.get(7),
                deployment_id: row.get(8),
                description: row.get::<_, Option<String>>(9).unwrap_or_default(),
                comments: row.get(10),
                contexts: row.get(11),
                labels: row.get(12),
                tool_version: row.get::<_, Option<String>>(13).unwrap_or_default(),
            });
        }
        Ok(ran)
    }

    async fn insert(&self, row: &RanChangeSet) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} \
             (id, author, filename, dateexecuted, orderexecuted, exectype, checksum, \
              description, comments, tag, tool_version, contexts, labels, deployment_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            self.fq()
        );
        let checksum = row.checksum.as_ref().map(|c| c.to_string());
        self.client
            .execute(
                &sql,
                &[
                    &row.identity.id,
                    &row.identity.author,
                    &row.identity.path,
                    &row.date_executed,
                    &row.order_executed,
                    &row.exec_type.as_str(),
                    &checksum,
                    &row.description,
                    &row.comments,
                    &row.tag,
                    &row.tool_version,
                    &row.contexts,
                    &row.labels,
                    &row.deployment_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update(&self, row: &RanChangeSet) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET dateexecuted = $4, orderexecuted = $5, exectype = $6, checksum = $7, \
             description = $8, comments = $9, tag = COALESCE($10, tag), tool_version = $11, contexts = $12, \
             labels = $13, deployment_id = $14 \
             WHERE id = $1 AND author = $2 AND filename = $3",
            self.fq()
        );
        let checksum = row.checksum.as_ref().map(|c| c.to_string());
        self.client
            .execute(
                &sql,
                &[
                    &row.identity.id,
                    &row.identity.author,
                    &row.identity.path,
                    &row.date_executed,
                    &row.order_executed,
                    &row.exec_type.as_str(),
                    &checksum,
                    &row.description,
                    &row.comments,
                    &row.tag,
                    &row.tool_version,
                    &row.contexts,
                    &row.labels,
                    &row.deployment_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, identity: &ChangeSetId) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND author = $2 AND filename = $3",
            self.fq()
        );
        self.client
            .execute(&sql, &[&identity.id, &identity.author, &identity.path])
            .await?;
        Ok(())
    }

    async fn update_checksum(&self, identity: &ChangeSetId, sum: &CheckSum) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET checksum = $4 WHERE id = $1 AND author = $2 AND filename = $3",
            self.fq()
        );
        self.client
            .execute(
                &sql,
                &[&identity.id, &identity.author, &identity.path, &sum.to_string()],
            )
            .await?;
        Ok(())
    }

    async fn clear_checksums(&self) -> Result<u64> {
        let sql = format!("UPDATE {} SET checksum = NULL", self.fq());
        let count = self.client.execute(&sql, &[]).await?;
        Ok(count)
    }

    async fn set_tag(&self, identity: &ChangeSetId, tag: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET tag = $4 WHERE id = $1 AND author = $2 AND filename = $3",
            self.fq()
        );
        self.client
            .execute(&sql, &[&identity.id, &identity.author, &identity.path, &tag])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::Sql;
    use crate::memory::MemoryDatabase;

    fn service(db: &MemoryDatabase) -> HistoryService {
        HistoryService::new(Arc::new(db.clone()))
    }

    fn change_set(id: &str) -> ChangeSet {
        ChangeSet::new(id, "alice", "db/main.toml").with_change(Arc::new(Sql::new("SELECT 1")))
    }

    #[test]
    fn test_exec_type_round_trip() {
        for t in [
            ExecType::Executed,
            ExecType::Failed,
            ExecType::Skipped,
            ExecType::Reran,
            ExecType::MarkRan,
        ] {
            assert_eq!(t.as_str().parse::<ExecType>().unwrap(), t);
        }
        assert!("BOGUS".parse::<ExecType>().is_err());
    }

    #[tokio::test]
    async fn test_missing_table_reads_empty() {
        let db = MemoryDatabase::new();
        let history = service(&db);
        assert!(history.ran_change_sets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_order() {
        let db = MemoryDatabase::new();
        let history = service(&db);
        history.init().await.unwrap();
        let a = history.append(&change_set("1"), ExecType::Executed, "d1").await.unwrap();
        let b = history.append(&change_set("2"), ExecType::Executed, "d1").await.unwrap();
        assert_eq!(a.order_executed, 1);
        assert_eq!(b.order_executed, 2);
        assert_eq!(history.next_sequence_value().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rerun_updates_row_in_place() {
        let db = MemoryDatabase::new();
        let history = service(&db);
        history.init().await.unwrap();
        history.append(&change_set("1"), ExecType::Executed, "d1").await.unwrap();
        history.append(&change_set("2"), ExecType::Executed, "d1").await.unwrap();
        history.append(&change_set("1"), ExecType::Reran, "d2").await.unwrap();

        history.reset();
        let rows = history.ran_change_sets().await.unwrap();
        assert_eq!(rows.len(), 2);
        let last = rows.last().unwrap();
        assert_eq!(last.identity.id, "1");
        assert_eq!(last.exec_type, ExecType::Reran);
        assert_eq!(last.order_executed, 3);
        assert_eq!(last.deployment_id.as_deref(), Some("d2"));
    }

    #[tokio::test]
    async fn test_rerun_keeps_existing_tag() {
        let db = MemoryDatabase::new();
        let history = service(&db);
        history.init().await.unwrap();
        history.append(&change_set("1"), ExecType::Executed, "d1").await.unwrap();
        history.tag("v1").await.unwrap();
        history.append(&change_set("1"), ExecType::Reran, "d2").await.unwrap();

        history.reset();
        let rows = history.ran_change_sets().await.unwrap();
        assert_eq!(rows[0].exec_type, ExecType::Reran);
        assert_eq!(rows[0].tag.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_tag_marks_latest_row() {
        let db = MemoryDatabase::new();
        let history = service(&db);
        history.init().await.unwrap();
        history.append(&change_set("1"), ExecType::Executed, "d1").await.unwrap();
        history.append(&change_set("2"), ExecType::Executed, "d1").await.unwrap();
        history.tag("v1").await.unwrap();

        history.reset();
        let rows = history.ran_change_sets().await.unwrap();
        assert_eq!(rows[1].tag.as_deref(), Some("v1"));
        assert!(rows[0].tag.is_none());
        assert!(history.tag_exists("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_tag_on_empty_ledger_writes_marker() {
        let db = MemoryDatabase::new();
        let history = service(&db);
        history.init().await.unwrap();
        let marker = history.tag("baseline").await.unwrap();
        assert!(marker.is_internal());
        assert_eq!(marker.identity.id, "tag-baseline");

        history.reset();
        assert!(history.tag_exists("baseline").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_checksums_nulls_every_row() {
        let db = MemoryDatabase::new();
        let history = service(&db);
        history.init().await.unwrap();
        history.append(&change_set("1"), ExecType::Executed, "d1").await.unwrap();
        history.append(&change_set("2"), ExecType::MarkRan, "d1").await.unwrap();
        assert_eq!(history.clear_checksums().await.unwrap(), 2);
        let rows = history.ran_change_sets().await.unwrap();
        assert!(rows.iter().all(|r| r.checksum.is_none()));
    }

    #[tokio::test]
    async fn test_remove_deletes_row() {
        let db = MemoryDatabase::new();
        let history = service(&db);
        history.init().await.unwrap();
        let cs = change_set("1");
        history.append(&cs, ExecType::Executed, "d1").await.unwrap();
        history.remove(cs.identity()).await.unwrap();
        history.reset();
        assert!(history.find(cs.identity()).await.unwrap().is_none());
    }
}
