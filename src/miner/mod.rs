//! Block production and synchronization for one chain replica.
//!
//! The miner is the single writer over the ledger, the state machine,
//! the consensus engine and the confirmed side-tables. Everything that
//! mutates them is serialized by one miner mutex: producing a block,
//! the critical section of a sync, and consensus-driven truncation.
//! The mutex is a `tokio::sync::Mutex` because the sync path holds it
//! across block downloads.

mod stake;
mod sync;

use crate::block::{Block, ConsensusStorage};
use crate::config::BroadcastMode;
use crate::consensus::Consensus;
use crate::context::ChainContext;
use crate::error::MinerError;
use crate::ledger::Ledger;
use crate::network::message::NetworkMessage;
use crate::network::Network;
use crate::state::State;
use crate::types::{BlockId, Transaction, ZERO_ID};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Sleep between iterations after an error, so a wedged collaborator
/// cannot spin the loop hot.
const ERROR_RETRY_DELAY: tokio::time::Duration = tokio::time::Duration::from_secs(3);

pub struct Miner {
    ctx: Arc<ChainContext>,
    /// Serializes mining, sync confirmation and truncation.
    miner_mutex: tokio::sync::Mutex<()>,
    /// Blocks currently admitted through `proc_block`.
    miner_queue: AtomicI64,
    in_sync_target_height: AtomicI64,
    in_sync_target_block_id: parking_lot::Mutex<BlockId>,
    exit: CancellationToken,
}

/// Decrements the ingress queue counter when an admitted block leaves
/// `proc_block`, on every path.
struct QueueGuard<'a>(&'a AtomicI64);

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(-1, Ordering::SeqCst);
    }
}

impl Miner {
    pub fn new(ctx: Arc<ChainContext>) -> Arc<Self> {
        Arc::new(Miner {
            ctx,
            miner_mutex: tokio::sync::Mutex::new(()),
            miner_queue: AtomicI64::new(0),
            in_sync_target_height: AtomicI64::new(0),
            in_sync_target_block_id: parking_lot::Mutex::new(ZERO_ID),
            exit: CancellationToken::new(),
        })
    }

    pub fn is_exit(&self) -> bool {
        self.exit.is_cancelled()
    }

    /// Signal the mining loop to stop. The loop drains at the next
    /// phase boundary; await the handle returned by the spawner to
    /// block until it does.
    pub fn stop(&self) {
        self.exit.cancel();
    }

    pub fn queue_len(&self) -> i64 {
        self.miner_queue.load(Ordering::SeqCst)
    }

    /// The long-lived mining loop. One iteration: repair state/ledger
    /// divergence, compete for the next block, run the cycle
    /// housekeeping, sync if behind, produce if elected, then clear
    /// matured un-bonding rows.
    pub async fn run(self: Arc<Self>) {
        let mut last_err: Option<MinerError> = None;

        while !self.is_exit() {
            let meta = self.ctx.ledger.meta();
            let state_tip = self.ctx.state.latest_block_id();
            tracing::trace!(
                trunk_height = meta.trunk_height,
                tip = %hex::encode(meta.tip_block_id),
                state_tip = %hex::encode(state_tip),
                "miner running"
            );

            let mut result: Result<(), MinerError> = Ok(());
            if meta.tip_block_id != state_tip {
                result = self.ctx.state.walk(&meta.tip_block_id, false);
            }

            let mut is_miner = false;
            let mut is_sync = false;
            if result.is_ok() {
                match self.ctx.consensus.compete_master(meta.trunk_height + 1) {
                    Ok((miner, sync)) => {
                        is_miner = miner;
                        is_sync = sync;
                        tracing::trace!(
                            height = meta.trunk_height + 1,
                            is_miner,
                            is_sync,
                            "compete master result"
                        );
                    }
                    Err(e) => result = Err(e),
                }
            }

            let new_cycle = self.read_term_table();
            if new_cycle {
                self.update_cache_table();
            }

            if result.is_ok() && is_miner && is_sync {
                result = self.try_sync_block(None).await;
            }
            if result.is_ok() && is_miner {
                result = self.mine_once(new_cycle).await;
            }

            let cleared_height = self.ctx.ledger.meta().trunk_height - 1;
            if let Err(e) = self.clear_thaw(cleared_height) {
                tracing::warn!(height = cleared_height, err = %e, "clear thaw failed");
            }

            if let Err(e) = result {
                if !self.is_exit() {
                    tracing::warn!(err = %e, "miner run occurred error, sleep 3s try");
                    last_err = Some(e);
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_RETRY_DELAY) => {}
                        _ = self.exit.cancelled() => {}
                    }
                }
            } else {
                last_err = None;
            }
        }

        let meta = self.ctx.ledger.meta();
        tracing::info!(
            trunk_height = meta.trunk_height,
            tip = %hex::encode(meta.tip_block_id),
            last_err = ?last_err,
            "miner exited"
        );
    }

    /// Produce one block: walk, consensus pre-hook (with optional
    /// truncate), pack, confirm fan-out, detached broadcast.
    pub async fn mine_once(&self, new_cycle: bool) -> Result<(), MinerError> {
        tracing::debug!("mining start");
        let _guard = self.miner_mutex.lock().await;

        let ledger_tip = self.ctx.ledger.meta().tip_block_id;
        if ledger_tip != self.ctx.state.latest_block_id() {
            self.ctx.state.walk(&ledger_tip, false).map_err(|e| {
                tracing::warn!(err = %e, "mining walk failed");
                MinerError::State("mining walk failed".to_string())
            })?;
        }

        let mut height = self.ctx.ledger.meta().trunk_height + 1;
        let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let (truncate_target, ext_data) = self
            .ctx
            .consensus
            .process_before_miner(now_ns)
            .map_err(|e| {
                tracing::warn!(err = %e, "consensus process before miner failed");
                MinerError::Consensus("consensus process before miner failed".to_string())
            })?;

        if let Some(target) = truncate_target {
            self.truncate_for_miner(&target)?;
            height = self.ctx.ledger.meta().trunk_height + 1;
        }

        let mut block = self.pack_block(height, now_ns, &ext_data, new_cycle)?;
        tracing::debug!(
            height,
            block_id = %hex::encode(block.block_id),
            "pack block succ"
        );

        self.confirm_block_for_miner(&mut block)?;
        self.spawn_broadcast(block.clone());

        tracing::info!(
            height,
            block_id = %hex::encode(block.block_id),
            tx_count = block.tx_count(),
            size = block.size(),
            "finish new block generation"
        );
        Ok(())
    }

    /// Roll the ledger back to the target the consensus engine asked
    /// for, state machine first.
    fn truncate_for_miner(&self, target: &BlockId) -> Result<(), MinerError> {
        self.ctx.ledger.query_block_header(target).map_err(|e| {
            tracing::warn!(err = %e, "truncate failed because query target error");
            e
        })?;
        self.ctx.state.walk(target, false).map_err(|e| {
            tracing::warn!(err = %e, "truncate failed because state walk error");
            e
        })?;
        self.ctx.ledger.truncate(target).map_err(|e| {
            tracing::warn!(err = %e, "truncate failed because ledger truncate error");
            e
        })
    }

    /// Assemble the block for `height`. The tx order is consensus:
    /// award, timer (only with extension outputs), mempool txs within
    /// the size budget, thaw reverse transfers, vote awards.
    pub fn pack_block(
        &self,
        height: i64,
        now_ns: i64,
        ext_data: &[u8],
        new_cycle: bool,
    ) -> Result<Block, MinerError> {
        let mut size_limit = self.ctx.state.max_tx_size_per_block()?;

        let (award_tx, remain_award) = self.award_tx(height, new_cycle, now_ns)?;
        size_limit = size_limit.saturating_sub(award_tx.size());

        let timer_tx = self.timer_tx(height)?;
        if !timer_tx.outputs_ext.is_empty() {
            size_limit = size_limit.saturating_sub(timer_tx.size());
        }

        let general_txs = self.unconfirmed_txs_within(size_limit)?;
        tracing::debug!(tx_count = general_txs.len(), "pack block get general tx succ");

        let thaw_txs = match self.thaw_txs(height) {
            Ok(txs) => txs,
            Err(e) => {
                tracing::warn!(err = %e, "query thaw info failed while packing");
                Vec::new()
            }
        };

        let mut txs = Vec::with_capacity(2 + general_txs.len() + thaw_txs.len());
        txs.push(award_tx);
        if !timer_tx.outputs_ext.is_empty() {
            txs.push(timer_tx);
        }
        txs.extend(general_txs);
        txs.extend(thaw_txs);

        if remain_award > 0 && !new_cycle {
            match self.vote_award_txs(remain_award, now_ns) {
                Ok(vote_txs) => txs.extend(vote_txs),
                Err(e) => tracing::warn!(err = %e, "failed to generate vote award"),
            }
        }

        let cons: ConsensusStorage = if ext_data.is_empty() {
            ConsensusStorage::default()
        } else {
            serde_json::from_slice(ext_data).map_err(|e| {
                tracing::warn!(err = %e, "convert consensus data failed");
                MinerError::Consensus("convert consensus data failed".to_string())
            })?
        };

        self.ctx.ledger.format_miner_block(crate::ledger::FormatBlockArgs {
            txs,
            proposer: &self.ctx.keypair.address,
            signing_key: &self.ctx.keypair.signing_key,
            timestamp_ns: now_ns,
            cur_term: cons.cur_term,
            cur_block_num: cons.cur_block_num,
            pre_hash: self.ctx.state.latest_block_id(),
            target_bits: cons.target_bits,
            state_total: self.ctx.state.total(),
            justify: cons.justify,
            height,
        })
    }

    fn timer_tx(&self, height: i64) -> Result<Transaction, MinerError> {
        self.ctx.state.timer_tx(height).map_err(|e| {
            tracing::error!(err = %e, "get timer tx error");
            MinerError::GenerateTimerTxFailed
        })
    }

    /// Mempool txs in admission order, stopping at the first tx that
    /// would overflow the remaining budget. Stopping (rather than
    /// skipping) keeps the packed prefix deterministic.
    fn unconfirmed_txs_within(&self, mut size_limit: usize) -> Result<Vec<Transaction>, MinerError> {
        let unconfirmed = self.ctx.state.unconfirmed_txs()?;

        let mut txs = Vec::new();
        for tx in unconfirmed {
            let size = tx.size();
            if size > size_limit {
                break;
            }
            size_limit -= size;
            txs.push(tx);
        }
        Ok(txs)
    }

    /// Confirm the freshly packed block: consensus id finalization,
    /// ledger confirm, state advance, consensus accounting. Ordering
    /// is mandatory and runs entirely under the miner mutex.
    fn confirm_block_for_miner(&self, block: &mut Block) -> Result<(), MinerError> {
        let original_id = block.block_id;
        self.ctx.consensus.calculate_block(block).map_err(|e| {
            tracing::warn!(err = %e, block_id = %hex::encode(original_id), "consensus calculate block failed");
            MinerError::Consensus("consensus calculate block failed".to_string())
        })?;
        tracing::trace!(
            original_id = %hex::encode(original_id),
            new_id = %hex::encode(block.block_id),
            "start confirm block for miner"
        );

        let status = self.ctx.ledger.confirm_block(block, false);
        if !status.succ {
            tracing::warn!(
                err = ?status.error,
                block_id = %hex::encode(block.block_id),
                "ledger confirm block failed"
            );
            return Err(MinerError::Ledger("ledger confirm block error".to_string()));
        }
        if status.orphan {
            tracing::trace!(
                block_id = %hex::encode(block.block_id),
                "the mined block was attached to branch, no need to play"
            );
            return Ok(());
        }

        self.ctx.state.play_for_miner(&block.block_id).map_err(|e| {
            tracing::warn!(err = %e, block_id = %hex::encode(block.block_id), "state play error");
            e
        })?;

        self.ctx.consensus.process_confirm_block(block).map_err(|e| {
            tracing::warn!(err = %e, block_id = %hex::encode(block.block_id), "consensus confirm block error");
            e
        })?;

        tracing::trace!(block_id = %hex::encode(block.block_id), "confirm block for miner succ");
        Ok(())
    }

    /// Handle a block pushed by the network: gate it, then hand it to
    /// the sync engine as an explicit target.
    pub async fn proc_block(&self, block: Block) -> Result<(), MinerError> {
        let block_size = block.size();
        let max_block_size = self.ctx.state.max_block_size();
        if block_size > max_block_size {
            tracing::warn!(
                block_size,
                max_block_size,
                "forbidden proc block because block is too large"
            );
            return Err(MinerError::Forbidden("block is too large".to_string()));
        }

        let in_sync_height = self.in_sync_target_height.load(Ordering::SeqCst);
        let in_sync_id = *self.in_sync_target_block_id.lock();
        if block.height < in_sync_height || block.block_id == in_sync_id {
            tracing::trace!(
                recv_height = block.height,
                recv_block_id = %hex::encode(block.block_id),
                in_sync_height,
                "forbidden proc block because recv block height lower than in sync height"
            );
            return Err(MinerError::Forbidden(
                "recv block height lower than in sync height".to_string(),
            ));
        }

        for (index, tx) in block.transactions.iter().enumerate() {
            if !self.ctx.ledger.is_valid_tx(index, tx, &block) {
                tracing::warn!(
                    txid = %hex::encode(tx.txid()),
                    block_id = %hex::encode(block.block_id),
                    "forbidden proc block because invalid tx got from the block"
                );
                return Err(MinerError::Forbidden(
                    "invalid tx got from the block".to_string(),
                ));
            }
        }

        self.miner_queue.fetch_add(1, Ordering::SeqCst);
        let _queue_guard = QueueGuard(&self.miner_queue);
        if self.miner_queue.load(Ordering::SeqCst) >= self.ctx.options.max_block_queue_size {
            tracing::warn!(
                queue = self.queue_len(),
                recv_height = block.height,
                "forbidden proc block because miner queue full"
            );
            return Err(MinerError::Forbidden("miner queue full".to_string()));
        }

        tracing::info!(
            recv_height = block.height,
            recv_block_id = %hex::encode(block.block_id),
            tx_count = block.tx_count(),
            size = block_size,
            "recv new block"
        );
        self.try_sync_block(Some(block)).await
    }

    /// Broadcast the freshly produced block on a detached task. The
    /// originator pushes the full block unless the node is configured
    /// interactive-only; failures are logged and swallowed.
    fn spawn_broadcast(&self, block: Block) {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let block_id = block.block_id;
            let height = block.height;
            let msg = match ctx.options.broadcast_mode {
                BroadcastMode::Interactive => NetworkMessage::NewBlockId(block_id),
                BroadcastMode::Full | BroadcastMode::Mixed => NetworkMessage::SendBlock(block),
            };
            match ctx.network.send_message(msg).await {
                Ok(()) => tracing::trace!(
                    block_id = %hex::encode(block_id),
                    "broadcast block succ"
                ),
                Err(e) => tracing::warn!(
                    height,
                    block_id = %hex::encode(block_id),
                    err = %e,
                    "broadcast block error"
                ),
            }
        });
    }
}
