//! Record pending change sets as MARK_RAN without executing them.
//!
//! Used to adopt a database whose schema was created by other means.

use serde::Serialize;

use crate::changelog::Changelog;
use crate::error::Result;
use crate::history::ExecType;

use super::validate;
use super::{candidacy, deployment_id, index_rows, EngineContext};

/// Report returned by the sync command.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub deployment_id: String,
    /// Identities recorded as MARK_RAN, in changelog order.
    pub marked: Vec<String>,
}

/// Execute the sync command.
pub async fn execute(
    ctx: &EngineContext,
    changelog: &Changelog,
    contexts: &[String],
    labels: &[String],
) -> Result<SyncReport> {
    let guard = ctx.lock().await?;
    let result = run_sync(ctx, changelog, contexts, labels).await;
    let result = ctx.finish(guard, result).await;
    match &result {
        Ok(report) => log::info!("Sync completed; marked={}", report.marked.len()),
        Err(e) => log::error!("Sync failed: {}", e),
    }
    result
}

async fn run_sync(
    ctx: &EngineContext,
    changelog: &Changelog,
    contexts: &[String],
    labels: &[String],
) -> Result<SyncReport> {
    ctx.history.reset();
    ctx.history.init().await?;
    let ran = ctx.history.ran_change_sets().await?;
    let sweep = validate::sweep(changelog, &ran, ctx.settings.batch_transaction).into_result()?;
    for (identity, sum) in &sweep.checksum_rewrites {
        ctx.history.update_checksum(identity, sum).await?;
    }

    let mut report = SyncReport {
        deployment_id: deployment_id(),
        marked: Vec::new(),
    };
    let dialect = ctx.database.info().dialect.clone();
    let rows = index_rows(&ran);
    for cs in changelog.change_sets() {
        if !candidacy(cs, rows.get(cs.identity()).copied()).should_run() {
            continue;
        }
        if cs.filter_reason(contexts, labels, &dialect).is_some() {
            continue;
        }
        ctx.history
            .append(cs, ExecType::MarkRan, &report.deployment_id)
            .await?;
        log::debug!("Change set marked ran; change_set={}", cs.identity());
        report.marked.push(cs.identity().to_string());
    }
    Ok(report)
}
