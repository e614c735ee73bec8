//! Daemon shutdown for the mining loop.
//!
//! The miner has no mid-operation cancellation: `Miner::stop` flips
//! its exit flag and the loop drains at the next phase boundary, never
//! mid-confirm. Shutdown therefore signals the miner and then waits
//! for the loop task, bounded by a timeout in case a collaborator is
//! wedged inside the critical section.

use crate::miner::Miner;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// How long to wait for the mining loop to reach a phase boundary
/// after a stop request.
const DRAIN_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(10);

/// Block until ctrl+c, then stop the miner and drain its loop.
///
/// Detached broadcast tasks are deliberately not waited on: they are
/// fire-and-forget and allowed to outlive the loop.
pub async fn wait_for_shutdown(miner: Arc<Miner>, mining_loop: JoinHandle<()>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        return;
    }

    tracing::info!("shutdown signal received");
    miner.stop();

    match tokio::time::timeout(DRAIN_TIMEOUT, mining_loop).await {
        Ok(_) => tracing::info!("mining loop drained"),
        Err(_) => tracing::warn!("shutdown timeout: mining loop did not reach a phase boundary"),
    }
}
