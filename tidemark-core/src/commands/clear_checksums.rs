//! Null every stored checksum so the next migrate recomputes them.

use crate::error::Result;

use super::EngineContext;

/// Execute the clear-checksums command. Returns the number of rows cleared.
pub async fn execute(ctx: &EngineContext) -> Result<u64> {
    let guard = ctx.lock().await?;
    let result = ctx.history.clear_checksums().await;
    let result = ctx.finish(guard, result).await;
    if let Ok(count) = &result {
        log::info!("Checksums cleared; rows={}", count);
    }
    result
}
