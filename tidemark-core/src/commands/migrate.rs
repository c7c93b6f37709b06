//! Apply pending change sets to the database.

use std::time::Instant;

use serde::Serialize;

use crate::changelog::Changelog;
use crate::changeset::ChangeSet;
use crate::db::{is_transient_error, Database};
use crate::error::{Result, TidemarkError};
use crate::history::ExecType;
use crate::precondition::{EvalContext, Verdict};

use super::validate;
use super::{candidacy, deployment_id, index_rows, Candidacy, EngineContext};

/// Terminal state of a change set within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeSetState {
    Executed,
    Reran,
    MarkedRan,
    SkippedFiltered,
    SkippedPrecondition,
    Failed,
}

impl std::fmt::Display for ChangeSetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeSetState::Executed => write!(f, "Executed"),
            ChangeSetState::Reran => write!(f, "Reran"),
            ChangeSetState::MarkedRan => write!(f, "Marked Ran"),
            ChangeSetState::SkippedFiltered => write!(f, "Filtered"),
            ChangeSetState::SkippedPrecondition => write!(f, "Skipped"),
            ChangeSetState::Failed => write!(f, "Failed"),
        }
    }
}

/// Report returned after a migrate operation.
#[derive(Debug, Serialize)]
pub struct MigrateReport {
    /// Groups the ledger rows written by this pass.
    pub deployment_id: String,
    /// Change sets whose statements ran (first run or rerun).
    pub executed: usize,
    pub marked_ran: usize,
    /// Filtered out or skipped by a CONTINUE precondition.
    pub skipped: usize,
    /// Failed under `fail_on_error = false`.
    pub failed: usize,
    /// Change sets already satisfied by the ledger.
    pub already_ran: usize,
    /// Stored checksums rewritten without counting as drift.
    pub checksums_upgraded: usize,
    pub total_time_ms: i64,
    /// One entry per change set that was not already satisfied.
    pub details: Vec<MigrateDetail>,
}

/// What happened to a single change set.
#[derive(Debug, Serialize)]
pub struct MigrateDetail {
    /// Identity as `path::id::author`.
    pub change_set: String,
    pub description: String,
    pub state: ChangeSetState,
    pub reason: Option<String>,
    pub execution_time_ms: i64,
}

impl MigrateReport {
    fn new(deployment_id: String) -> Self {
        Self {
            deployment_id,
            executed: 0,
            marked_ran: 0,
            skipped: 0,
            failed: 0,
            already_ran: 0,
            checksums_upgraded: 0,
            total_time_ms: 0,
            details: Vec::new(),
        }
    }

    fn record(&mut self, detail: MigrateDetail) {
        match detail.state {
            ChangeSetState::Executed | ChangeSetState::Reran => self.executed += 1,
            ChangeSetState::MarkedRan => self.marked_ran += 1,
            ChangeSetState::SkippedFiltered | ChangeSetState::SkippedPrecondition => {
                self.skipped += 1
            }
            ChangeSetState::Failed => self.failed += 1,
        }
        self.details.push(detail);
    }
}

fn detail(
    cs: &ChangeSet,
    state: ChangeSetState,
    reason: Option<String>,
    started: Instant,
) -> MigrateDetail {
    MigrateDetail {
        change_set: cs.identity().to_string(),
        description: cs.description(),
        state,
        reason,
        execution_time_ms: started.elapsed().as_millis() as i64,
    }
}

/// Outcome of the changelog-level preconditions for the whole pass.
enum PassPolicy {
    Run,
    SkipAll(String),
    MarkAll(String),
}

/// Execute the migrate command.
pub async fn execute(
    ctx: &EngineContext,
    changelog: &Changelog,
    contexts: &[String],
    labels: &[String],
) -> Result<MigrateReport> {
    let guard = ctx.lock().await?;
    let result = run_migrate(ctx, changelog, contexts, labels).await;
    let result = ctx.finish(guard, result).await;

    match &result {
        Ok(report) => {
            log::info!(
                "Migrate completed; executed={}, marked_ran={}, skipped={}, failed={}, total_time_ms={}",
                report.executed,
                report.marked_ran,
                report.skipped,
                report.failed,
                report.total_time_ms
            );
        }
        Err(e) => {
            log::error!("Migrate failed: {}", e);
        }
    }
    result
}

async fn run_migrate(
    ctx: &EngineContext,
    changelog: &Changelog,
    contexts: &[String],
    labels: &[String],
) -> Result<MigrateReport> {
    let started = Instant::now();
    ctx.history.reset();
    ctx.history.init().await?;
    let ran = ctx.history.ran_change_sets().await?;

    // Hard gate: nothing is executed unless the whole changelog validates.
    let sweep = validate::sweep(changelog, &ran, ctx.settings.batch_transaction).into_result()?;

    let mut report = MigrateReport::new(deployment_id());
    let info = ctx.database.info();
    let batch = ctx.settings.batch_transaction && info.supports_ddl_transactions;
    if ctx.settings.batch_transaction && !batch {
        log::warn!(
            "Backend DDL is not transactional, committing per change set instead of batching; dialect={}",
            info.dialect
        );
    }

    for (identity, sum) in &sweep.checksum_rewrites {
        ctx.history.update_checksum(identity, sum).await?;
        log::debug!("Stored checksum rewritten; change_set={}, checksum={}", identity, sum);
        report.checksums_upgraded += 1;
    }

    if batch {
        ctx.database.begin().await?;
    }

    let policy = {
        let eval = EvalContext {
            database: ctx.database.as_ref(),
            ran: &ran,
        };
        match changelog.preconditions().check(changelog.path(), &eval).await {
            Verdict::Proceed => PassPolicy::Run,
            Verdict::Skip(reason) => PassPolicy::SkipAll(reason),
            Verdict::MarkRan(reason) => PassPolicy::MarkAll(reason),
            Verdict::Halt(e) => return Err(e),
        }
    };

    let rows = index_rows(&ran);
    for cs in changelog.change_sets() {
        let started = Instant::now();
        let candidacy = candidacy(cs, rows.get(cs.identity()).copied());
        if !candidacy.should_run() {
            report.already_ran += 1;
            continue;
        }

        let name = cs.identity().to_string();
        if let Some(reason) = cs.filter_reason(contexts, labels, &info.dialect) {
            log::debug!("Change set filtered; change_set={}, reason={}", name, reason);
            report.record(detail(cs, ChangeSetState::SkippedFiltered, Some(reason), started));
            continue;
        }

        let mark_reason = match &policy {
            PassPolicy::SkipAll(reason) => {
                report.record(detail(
                    cs,
                    ChangeSetState::SkippedPrecondition,
                    Some(reason.clone()),
                    started,
                ));
                continue;
            }
            PassPolicy::MarkAll(reason) => Some(reason.clone()),
            PassPolicy::Run if sweep.mark_ran_invalid.contains(cs.identity()) => {
                Some("change validation failed".to_string())
            }
            PassPolicy::Run => match cs.preconditions() {
                None => None,
                Some(container) => {
                    let current = ctx.history.ran_change_sets().await?;
                    let eval = EvalContext {
                        database: ctx.database.as_ref(),
                        ran: &current,
                    };
                    match container.check(&name, &eval).await {
                        Verdict::Proceed => None,
                        Verdict::MarkRan(reason) => Some(reason),
                        Verdict::Skip(reason) => {
                            report.record(detail(
                                cs,
                                ChangeSetState::SkippedPrecondition,
                                Some(reason),
                                started,
                            ));
                            continue;
                        }
                        Verdict::Halt(e) => return Err(e),
                    }
                }
            },
        };

        if let Some(reason) = mark_reason {
            ctx.history
                .append(cs, ExecType::MarkRan, &report.deployment_id)
                .await?;
            log::info!("Change set marked ran; change_set={}, reason={}", name, reason);
            report.record(detail(cs, ChangeSetState::MarkedRan, Some(reason), started));
            continue;
        }

        let outcome = apply_change_set(ctx, cs, candidacy, &report.deployment_id, batch).await?;
        report.record(outcome);
    }

    if batch {
        ctx.database.commit().await?;
    }
    report.total_time_ms = started.elapsed().as_millis() as i64;
    Ok(report)
}

/// Run one change set and record it.
///
/// With transactional DDL the statements and the ledger row commit together.
/// Otherwise the statements autocommit and the row is written afterwards.
async fn apply_change_set(
    ctx: &EngineContext,
    cs: &ChangeSet,
    candidacy: Candidacy,
    deployment_id: &str,
    batch: bool,
) -> Result<MigrateDetail> {
    let started = Instant::now();
    let name = cs.identity().to_string();
    let db = ctx.database.as_ref();
    let transactional = !batch && cs.run_in_transaction() && db.info().supports_ddl_transactions;
    let (exec_type, state) = if candidacy.is_rerun() {
        (ExecType::Reran, ChangeSetState::Reran)
    } else {
        (ExecType::Executed, ChangeSetState::Executed)
    };
    log::info!(
        "Applying change set; change_set={}, reason={}, transactional={}",
        name,
        candidacy.describe(),
        transactional || batch
    );

    if transactional {
        db.begin().await?;
    }

    if let Err(e) = run_statements(db, cs).await {
        // Nothing can be rolled back or recorded over a dead session.
        if is_transient_error(&e) {
            log::error!("Connection lost while applying change set; change_set={}, error={}", name, e);
            return Err(e);
        }
        if transactional {
            if let Err(rb) = db.rollback().await {
                log::warn!("Rollback of failed change set failed; change_set={}, error={}", name, rb);
            }
        }
        // Inside a batch the failure has already poisoned the shared transaction.
        if !batch && !cs.fail_on_error() {
            log::warn!(
                "Change set failed, continuing because fail_on_error is false; change_set={}, error={}",
                name,
                e
            );
            ctx.history.append(cs, ExecType::Failed, deployment_id).await?;
            return Ok(detail(cs, ChangeSetState::Failed, Some(e.to_string()), started));
        }
        log::error!("Change set failed; change_set={}, error={}", name, e);
        return Err(TidemarkError::ExecutionFailed {
            change_set: name,
            reason: e.to_string(),
        });
    }

    if let Err(e) = ctx.history.append(cs, exec_type, deployment_id).await {
        if transactional {
            if let Err(rb) = db.rollback().await {
                log::warn!("Rollback after ledger failure failed; change_set={}, error={}", name, rb);
            }
        }
        return Err(TidemarkError::ExecutionFailed {
            change_set: name,
            reason: format!("statements ran but the ledger row could not be written: {}", e),
        });
    }

    if transactional {
        db.commit().await?;
    }
    Ok(detail(cs, state, None, started))
}

async fn run_statements(db: &dyn Database, cs: &ChangeSet) -> Result<()> {
    for statement in cs.forward_statements() {
        log::debug!(
            "Executing statement; change_set={}, sql={}",
            cs.identity(),
            statement
        );
        db.execute(&statement).await?;
    }
    Ok(())
}
