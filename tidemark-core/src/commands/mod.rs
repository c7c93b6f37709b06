//! Command implementations: migrate, rollback, status, validate, history,
//! tag, clear-checksums, release-locks, list-locks and sync.
//!
//! Every command takes an [`EngineContext`]: one database session plus the
//! history and lock services bound to it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::changeset::{ChangeSet, ChangeSetId};
use crate::checksum::{self, ChecksumComparison};
use crate::config::LockSettings;
use crate::db::{is_transient_error, Database};
use crate::error::Result;
use crate::history::{ExecType, HistoryService, HistoryStore, RanChangeSet};
use crate::lock::{LockGuard, LockService, LockStore};

pub mod clear_checksums;
pub mod history;
pub mod locks;
pub mod migrate;
pub mod rollback;
pub mod status;
pub mod sync;
pub mod tag;
pub mod validate;

/// Engine-wide switches that are not part of any single command's arguments.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    /// Wrap a whole migrate pass in one transaction.
    pub batch_transaction: bool,
}

/// What every command runs against.
pub struct EngineContext {
    pub database: Arc<dyn Database>,
    pub history: HistoryService,
    pub lock: LockService,
    pub settings: EngineSettings,
}

impl EngineContext {
    pub fn new(
        database: Arc<dyn Database>,
        history: Arc<dyn HistoryStore>,
        locks: Arc<dyn LockStore>,
        lock_settings: LockSettings,
        settings: EngineSettings,
    ) -> Self {
        Self {
            database,
            history: HistoryService::new(history),
            lock: LockService::new(locks, lock_settings),
            settings,
        }
    }

    /// Take the changelog lock for this session.
    ///
    /// The session is health-checked first so a dead connection fails before
    /// anything is written to the lock table.
    pub(crate) async fn lock(&self) -> Result<LockGuard> {
        self.database.check_connection().await?;
        self.lock.acquire(Some(Arc::clone(&self.database))).await
    }

    /// Release `guard` and hand back the command's result.
    ///
    /// An open transaction is rolled back first when the command failed.
    pub(crate) async fn finish<T>(&self, guard: LockGuard, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if is_transient_error(e) {
                log::warn!("Connection lost, server discards the open transaction; error={}", e);
            } else if let Err(rb) = self.database.rollback().await {
                log::warn!("Rollback after failed command failed; error={}", rb);
            }
            self.history.reset();
        }
        if let Err(e) = guard.release().await {
            log::warn!("Failed to release changelog lock; error={}", e);
        }
        result
    }
}

/// Groups every row written by one invocation: the last ten digits of the epoch milliseconds.
pub fn deployment_id() -> String {
    let millis = Utc::now().timestamp_millis().to_string();
    let start = millis.len().saturating_sub(10);
    millis[start..].to_string()
}

/// Why a change set is (or is not) a candidate for the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Candidacy {
    /// Never recorded.
    New,
    /// Recorded as FAILED by an earlier `fail_on_error = false` pass.
    PreviouslyFailed,
    /// `run_always` change set.
    RunAlways,
    /// `run_on_change` change set whose content changed.
    Changed,
    /// Recorded and satisfied.
    AlreadyRan,
}

impl Candidacy {
    pub(crate) fn should_run(self) -> bool {
        !matches!(self, Candidacy::AlreadyRan)
    }

    /// Whether executing it rewrites an existing ledger row.
    pub(crate) fn is_rerun(self) -> bool {
        matches!(self, Candidacy::RunAlways | Candidacy::Changed)
    }

    pub(crate) fn describe(self) -> &'static str {
        match self {
            Candidacy::New => "not yet run",
            Candidacy::PreviouslyFailed => "previously failed",
            Candidacy::RunAlways => "runs always",
            Candidacy::Changed => "content changed",
            Candidacy::AlreadyRan => "already ran",
        }
    }
}

/// Decide whether `change_set` must run given its ledger row.
pub(crate) fn candidacy(change_set: &ChangeSet, row: Option<&RanChangeSet>) -> Candidacy {
    let Some(row) = row else {
        return Candidacy::New;
    };
    if row.exec_type == ExecType::Failed {
        return Candidacy::PreviouslyFailed;
    }
    if change_set.run_always() {
        return Candidacy::RunAlways;
    }
    if change_set.run_on_change() {
        if let Some(stored) = &row.checksum {
            let drifted = matches!(
                checksum::compare(stored, change_set),
                ChecksumComparison::Drift { .. }
            );
            if drifted && !change_set.accepts_checksum(stored) {
                return Candidacy::Changed;
            }
        }
    }
    Candidacy::AlreadyRan
}

/// Ledger rows keyed by identity.
pub(crate) fn index_rows(rows: &[RanChangeSet]) -> HashMap<&ChangeSetId, &RanChangeSet> {
    rows.iter().map(|r| (&r.identity, r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::Sql;
    use crate::checksum::{CheckSum, ChecksumVersion};
    use crate::history::TOOL_VERSION;

    fn row(cs: &ChangeSet, exec_type: ExecType, checksum: Option<CheckSum>) -> RanChangeSet {
        RanChangeSet {
            identity: cs.identity().clone(),
            checksum,
            exec_type,
            date_executed: Utc::now(),
            order_executed: 1,
            tag: None,
            deployment_id: None,
            description: cs.description(),
            comments: None,
            contexts: None,
            labels: None,
            tool_version: TOOL_VERSION.to_string(),
        }
    }

    fn cs(sql: &str) -> ChangeSet {
        ChangeSet::new("1", "alice", "main.toml").with_change(Arc::new(Sql::new(sql)))
    }

    #[test]
    fn test_deployment_id_is_ten_digits() {
        let id = deployment_id();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_candidacy_transitions() {
        let current = cs("SELECT 1");
        let same = row(&current, ExecType::Executed, Some(current.checksum().clone()));
        assert_eq!(candidacy(&current, None), Candidacy::New);
        assert_eq!(candidacy(&current, Some(&same)), Candidacy::AlreadyRan);

        let failed = row(&current, ExecType::Failed, None);
        assert_eq!(candidacy(&current, Some(&failed)), Candidacy::PreviouslyFailed);

        let always = cs("SELECT 1").with_run_always(true);
        assert_eq!(candidacy(&always, Some(&same)), Candidacy::RunAlways);

        let old = row(&current, ExecType::Executed, Some(cs("SELECT 0").checksum().clone()));
        let on_change = cs("SELECT 1").with_run_on_change(true);
        assert_eq!(candidacy(&on_change, Some(&old)), Candidacy::Changed);
        assert_eq!(candidacy(&on_change, Some(&same)), Candidacy::AlreadyRan);
    }

    #[test]
    fn test_legacy_checksum_is_not_a_change() {
        let on_change = cs("SELECT 1").with_run_on_change(true);
        let legacy = on_change.checksum_with(ChecksumVersion::V1);
        let stored = row(&on_change, ExecType::Executed, Some(legacy));
        assert_eq!(candidacy(&on_change, Some(&stored)), Candidacy::AlreadyRan);
    }

    #[test]
    fn test_cleared_checksum_is_accepted() {
        let on_change = cs("SELECT 1").with_run_on_change(true);
        let cleared = row(&on_change, ExecType::Executed, None);
        assert_eq!(candidacy(&on_change, Some(&cleared)), Candidacy::AlreadyRan);
    }
}
