//! Read the ledger.

use crate::error::Result;
use crate::history::RanChangeSet;

use super::EngineContext;

/// Execute the history command: every ledger row in execution order.
///
/// A database that was never migrated has an empty history; the ledger
/// table is not created.
pub async fn execute(ctx: &EngineContext) -> Result<Vec<RanChangeSet>> {
    ctx.history.reset();
    let mut rows = ctx.history.ran_change_sets().await?;
    rows.sort_by_key(|r| r.order_executed);
    log::debug!("History read; rows={}", rows.len());
    Ok(rows)
}
