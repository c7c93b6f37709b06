//! Stamp the current ledger position with a name.

use crate::error::{Result, TidemarkError};
use crate::history::RanChangeSet;

use super::EngineContext;

/// Execute the tag command. Returns the row that now carries the tag.
pub async fn execute(ctx: &EngineContext, name: &str) -> Result<RanChangeSet> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TidemarkError::ConfigError("Tag name cannot be empty".to_string()));
    }

    let guard = ctx.lock().await?;
    let result = async {
        ctx.history.reset();
        ctx.history.init().await?;
        if ctx.history.tag_exists(name).await? {
            log::warn!("Tag already exists, moving it to the latest row; tag={}", name);
        }
        ctx.history.tag(name).await
    }
    .await;
    ctx.finish(guard, result).await
}
