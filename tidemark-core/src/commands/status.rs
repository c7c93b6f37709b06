//! Dry run of the to-run computation: what migrate would do, without doing it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::changelog::Changelog;
use crate::changeset::ChangeSet;
use crate::checksum::{self, ChecksumComparison};
use crate::error::Result;
use crate::history::{ExecType, RanChangeSet};

use super::{candidacy, index_rows, Candidacy, EngineContext};

/// Where a change set stands relative to the ledger and the current filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Never recorded.
    NotRan,
    /// Recorded FAILED by an earlier pass; will be retried.
    Failed,
    /// `run_always`; runs on every pass.
    RunAlways,
    /// `run_on_change` and its content changed.
    Changed,
    /// Recorded and up to date.
    Ran,
    /// Recorded but its content no longer matches the stored checksum.
    Drifted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::NotRan => write!(f, "Not Ran"),
            RunStatus::Failed => write!(f, "Failed"),
            RunStatus::RunAlways => write!(f, "Run Always"),
            RunStatus::Changed => write!(f, "Changed"),
            RunStatus::Ran => write!(f, "Ran"),
            RunStatus::Drifted => write!(f, "Drifted"),
        }
    }
}

/// A change set the next migrate would execute.
#[derive(Debug, Clone, Serialize)]
pub struct PendingChangeSet {
    pub change_set: String,
    pub description: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeSetStatus {
    pub change_set: String,
    pub description: String,
    pub status: RunStatus,
    /// Excluded from this run by contexts, labels or dbms.
    pub filtered: Option<String>,
    pub exec_type: Option<ExecType>,
    pub date_executed: Option<DateTime<Utc>>,
}

/// Report returned by the status command.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub pending: Vec<PendingChangeSet>,
    pub change_sets: Vec<ChangeSetStatus>,
    /// Ledger rows with no matching change set in the changelog.
    pub unknown: Vec<RanChangeSet>,
    pub ledger_rows: usize,
}

/// Execute the status command. Takes no lock and writes nothing.
pub async fn execute(
    ctx: &EngineContext,
    changelog: &Changelog,
    contexts: &[String],
    labels: &[String],
) -> Result<StatusReport> {
    ctx.history.reset();
    let ran = ctx.history.ran_change_sets().await?;
    let dialect = ctx.database.info().dialect.clone();
    let report = build(changelog, &ran, contexts, labels, &dialect);
    log::info!(
        "Status computed; pending={}, ledger_rows={}, unknown={}",
        report.pending.len(),
        report.ledger_rows,
        report.unknown.len()
    );
    Ok(report)
}

fn build(
    changelog: &Changelog,
    ran: &[RanChangeSet],
    contexts: &[String],
    labels: &[String],
    dialect: &str,
) -> StatusReport {
    let rows = index_rows(ran);
    let mut report = StatusReport {
        pending: Vec::new(),
        change_sets: Vec::with_capacity(changelog.len()),
        unknown: Vec::new(),
        ledger_rows: ran.iter().filter(|r| !r.is_internal()).count(),
    };

    for cs in changelog.change_sets() {
        let row = rows.get(cs.identity()).copied();
        let decision = candidacy(cs, row);
        let filtered = cs.filter_reason(contexts, labels, dialect);
        let status = match decision {
            Candidacy::New => RunStatus::NotRan,
            Candidacy::PreviouslyFailed => RunStatus::Failed,
            Candidacy::RunAlways => RunStatus::RunAlways,
            Candidacy::Changed => RunStatus::Changed,
            Candidacy::AlreadyRan if row.is_some_and(|r| drifted(cs, r)) => RunStatus::Drifted,
            Candidacy::AlreadyRan => RunStatus::Ran,
        };

        if decision.should_run() && filtered.is_none() {
            report.pending.push(PendingChangeSet {
                change_set: cs.identity().to_string(),
                description: cs.description(),
                reason: decision.describe().to_string(),
            });
        }
        report.change_sets.push(ChangeSetStatus {
            change_set: cs.identity().to_string(),
            description: cs.description(),
            status,
            filtered,
            exec_type: row.map(|r| r.exec_type),
            date_executed: row.map(|r| r.date_executed),
        });
    }

    report.unknown = ran
        .iter()
        .filter(|r| !r.is_internal() && changelog.find(&r.identity).is_none())
        .cloned()
        .collect();
    report
}

fn drifted(cs: &ChangeSet, row: &RanChangeSet) -> bool {
    match &row.checksum {
        Some(stored) => matches!(
            checksum::compare(stored, cs),
            ChecksumComparison::Drift { .. }
        ) && !cs.accepts_checksum(stored),
        None => false,
    }
}
