//! Inspect and clear the changelog lock.

use crate::error::Result;
use crate::lock::LockRecord;

use super::EngineContext;

/// Execute the release-locks command. Returns whether a lock was held.
///
/// Clears the lock whoever holds it. Only safe when the holder is known to be gone.
pub async fn release(ctx: &EngineContext) -> Result<bool> {
    ctx.lock.force_release_all().await
}

/// Execute the list-locks command.
pub async fn list(ctx: &EngineContext) -> Result<LockRecord> {
    ctx.lock.current().await
}
