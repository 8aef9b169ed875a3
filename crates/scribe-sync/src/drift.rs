//! Drift recovery: escape hatches for when the caches and the remote have
//! diverged beyond what TTL expiry fixes on its own.
//!
//! `force_resync` drops the caches and re-walks the live remote, so local
//! state converges in one run instead of waiting out the TTL. `full_rebuild`
//! additionally throws away the local tree, trading local-only entities for
//! a guaranteed-faithful reconstruction.

use std::sync::atomic::Ordering;
use tracing::{info, warn};

use crate::engine::{EngineError, Result, SyncEngine};
use crate::remote::{RemoteError, RemoteStore};

impl<R: RemoteStore + 'static> SyncEngine<R> {
    /// Resync against live remote state, bypassing the caches.
    ///
    /// Runs to settlement. If the remote rejects the walk with expired
    /// credentials, reauthenticates and retries once; a second auth failure
    /// surfaces to the caller.
    pub async fn force_resync(&self) -> Result<()> {
        // Let an in-progress run settle first so it cannot repopulate the
        // caches while we are dropping them.
        self.settled().await;
        info!("forced resync: dropping cached listings and contents");
        self.drop_caches();
        self.sync_with_auth_retry().await
    }

    /// Discard every cache entry and the whole local tree, then rebuild from
    /// the remote. Local-only entities are lost; this is the recovery of
    /// last resort.
    pub async fn full_rebuild(&self) -> Result<()> {
        self.settled().await;
        info!("full rebuild: clearing caches and resetting the local tree");
        // Each clear() empties the whole shared durable store; clearing both
        // views also drops both in-memory layers.
        self.inner.listings.clear();
        self.inner.contents.clear();
        self.inner.workspace.lock().unwrap().reset();
        self.inner.has_synced.store(false, Ordering::SeqCst);
        self.sync_with_auth_retry().await
    }

    /// Run a sync to settlement; on expired credentials, reauthenticate and
    /// retry exactly once. Covers the whole run: an auth failure during the
    /// detached content pass surfaces through the settled outcome and is
    /// retried the same as a structural one.
    async fn sync_with_auth_retry(&self) -> Result<()> {
        match self.sync_to_settled().await {
            Err(EngineError::Remote(RemoteError::AuthExpired)) => {
                warn!("credentials expired during sync, reauthenticating");
                self.inner
                    .remote
                    .reauthenticate()
                    .await
                    .map_err(EngineError::from)?;
                self.drop_caches();
                self.sync_to_settled().await
            }
            other => other,
        }
    }

    /// Run a sync and report the whole run's outcome, including a failure of
    /// the detached content pass, which the engine parks at settlement.
    async fn sync_to_settled(&self) -> Result<()> {
        self.sync().await?;
        self.settled().await;
        match self.inner.last_error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn drop_caches(&self) {
        self.inner.listings.invalidate_prefix("listing:");
        self.inner.contents.invalidate_prefix("content:");
    }
}
