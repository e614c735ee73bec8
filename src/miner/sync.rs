//! Chain synchronization: chase the whole-network-longest tip and
//! repair the local ledger by backfilling missing blocks.
//!
//! Discovery (status broadcast + confirmation probe) runs outside the
//! miner mutex so peers can be queried while a block is producing; the
//! confirm section runs under it.

use super::Miner;
use crate::block::Block;
use crate::consensus::Consensus;
use crate::error::MinerError;
use crate::ledger::Ledger;
use crate::network::message::{ChainStatus, NetworkMessage, NetworkResponse};
use crate::network::Network;
use crate::state::State;
use crate::types::{BlockId, ZERO_ID};
use std::sync::atomic::Ordering;

impl Miner {
    /// Sync the local ledger toward `target`. Without a target, probe
    /// neighbours for the longest confirmed tip first.
    pub async fn try_sync_block(&self, target: Option<Block>) -> Result<(), MinerError> {
        let target = match target {
            Some(block) => block,
            None => self.whole_net_longest_block().await.map_err(|e| {
                tracing::warn!(err = %e, "get whole network longest block failed, sync block exit");
                MinerError::Network(
                    "try sync block get whole network longest block failed".to_string(),
                )
            })?,
        };
        tracing::debug!(
            target_height = target.height,
            target_id = %hex::encode(target.block_id),
            in_sync_height = self.in_sync_target_height.load(Ordering::SeqCst),
            "try sync block"
        );

        let guard = self.miner_mutex.lock().await;
        let result = self.sync_under_lock(&target).await;
        if result.is_err() {
            // Re-admit retries for this target range.
            let meta = self.ctx.ledger.meta();
            self.in_sync_target_height
                .store(meta.trunk_height, Ordering::SeqCst);
            *self.in_sync_target_block_id.lock() = meta.tip_block_id;
        }
        drop(guard);

        // Defensive post-walk: if the ledger moved and the state did
        // not follow, repair before the next iteration observes it.
        let meta = self.ctx.ledger.meta();
        if self.ctx.state.latest_block_id() != meta.tip_block_id {
            if let Err(e) = self.ctx.state.walk(&meta.tip_block_id, false) {
                tracing::warn!(err = %e, "sync block walk failed");
            }
        }

        result
    }

    async fn sync_under_lock(&self, target: &Block) -> Result<(), MinerError> {
        // Ignore targets below the in-flight sync or already handled.
        if target.height < self.in_sync_target_height.load(Ordering::SeqCst)
            || target.block_id == *self.in_sync_target_block_id.lock()
        {
            tracing::trace!(
                target_height = target.height,
                target_id = %hex::encode(target.block_id),
                "ignore block because target block height lower than in sync height"
            );
            return Ok(());
        }
        if self.ctx.ledger.exist_block(&target.block_id) {
            tracing::trace!(
                target_id = %hex::encode(target.block_id),
                "ignore block because target block has in ledger"
            );
            return Ok(());
        }

        self.in_sync_target_height
            .store(target.height, Ordering::SeqCst);
        *self.in_sync_target_block_id.lock() = target.block_id;

        let ledger_tip = self.ctx.ledger.meta().tip_block_id;
        if ledger_tip != self.ctx.state.latest_block_id() {
            self.ctx.state.walk(&ledger_tip, false).map_err(|e| {
                tracing::warn!(err = %e, "try sync block walk failed");
                MinerError::State("try sync block walk failed".to_string())
            })?;
        }

        self.sync_block(target).await.map_err(|e| {
            tracing::warn!(
                err = %e,
                target_id = %hex::encode(target.block_id),
                "try sync block failed"
            );
            e
        })
    }

    async fn sync_block(&self, target: &Block) -> Result<(), MinerError> {
        let meta = self.ctx.ledger.meta();
        if target.height < meta.trunk_height || target.block_id == meta.tip_block_id {
            return Ok(());
        }

        let block_ids = self.download_missing_blocks(target).await.map_err(|e| {
            tracing::warn!(err = %e, "download miss block failed");
            e
        })?;

        tracing::debug!(block_count = block_ids.len(), "batch confirm block");
        self.batch_confirm_blocks(&block_ids).map_err(|e| {
            tracing::warn!(err = %e, block_count = block_ids.len(), "batch confirm block to ledger failed");
            e
        })
    }

    /// Walk backwards from `target` until a known ancestor, stashing
    /// every fetched block as pending. Returns ids newest-first.
    /// Dead-ends before meeting the local ledger mean the peer grew
    /// from a different genesis.
    async fn download_missing_blocks(&self, target: &Block) -> Result<Vec<BlockId>, MinerError> {
        self.ctx.ledger.save_pending_block(target).map_err(|e| {
            tracing::warn!(
                block_id = %hex::encode(target.block_id),
                err = %e,
                "save pending block error"
            );
            e
        })?;

        let mut block_ids = vec![target.block_id];
        let mut cursor = target.clone();

        while !self.ctx.ledger.exist_block(&cursor.pre_hash) {
            if cursor.pre_hash == ZERO_ID || cursor.height == 0 {
                tracing::error!(
                    local_root = %hex::encode(self.ctx.ledger.meta().root_block_id),
                    sync_block_id = %hex::encode(cursor.block_id),
                    "the genesis block is different"
                );
                return Err(MinerError::GenesisBlockDiff);
            }

            if let Some(block) = self.ctx.ledger.pending_block(&cursor.pre_hash) {
                block_ids.push(block.block_id);
                cursor = block;
                continue;
            }

            let block = self.fetch_block(&cursor.pre_hash).await?;
            self.ctx.ledger.save_pending_block(&block)?;
            block_ids.push(block.block_id);
            cursor = block;
        }

        Ok(block_ids)
    }

    /// Fetch one block from neighbours, first usable response wins.
    async fn fetch_block(&self, block_id: &BlockId) -> Result<Block, MinerError> {
        let responses = self
            .ctx
            .network
            .send_message_with_response(NetworkMessage::GetBlock {
                block_id: *block_id,
                need_content: true,
            })
            .await?;

        for response in responses {
            let NetworkResponse::BlockInfo(info) = response else {
                continue;
            };
            let Some(block) = info.block else {
                tracing::warn!(block_id = %hex::encode(block_id), "block is nil");
                continue;
            };
            tracing::info!(
                height = block.height,
                block_id = %hex::encode(block.block_id),
                "download block succ"
            );
            return Ok(block);
        }

        Err(MinerError::Network("no response".to_string()))
    }

    /// Append the downloaded range to the ledger, oldest first. Any
    /// failure aborts the whole batch.
    fn batch_confirm_blocks(&self, block_ids: &[BlockId]) -> Result<(), MinerError> {
        for block_id in block_ids.iter().rev() {
            let block = self.ctx.ledger.pending_block(block_id).ok_or_else(|| {
                tracing::warn!(block_id = %hex::encode(block_id), "ledger get pending block error");
                MinerError::Ledger("get pending block failed from ledger".to_string())
            })?;

            if !self.ctx.ledger.verify_block(&block)? {
                tracing::warn!(block_id = %hex::encode(block_id), "the verification of block failed");
                return Err(MinerError::Ledger(
                    "the verification of block failed from ledger".to_string(),
                ));
            }

            if !self.ctx.consensus.check_miner_match(&block)? {
                tracing::warn!(block_id = %hex::encode(block_id), "consensus check miner match failed");
                return Err(MinerError::Consensus(
                    "consensus check miner match failed".to_string(),
                ));
            }

            let status = self.ctx.ledger.confirm_block(&block, false);
            if !status.succ {
                tracing::warn!(
                    block_id = %hex::encode(block_id),
                    err = ?status.error,
                    "ledger confirm block failed"
                );
                return Err(MinerError::Ledger("ledger confirm block failed".to_string()));
            }

            if self.ctx.state.latest_block_id() == block.pre_hash {
                self.ctx
                    .state
                    .play_and_repost(&block.block_id, false, false)
                    .map_err(|e| {
                        tracing::warn!(
                            err = %e,
                            height = block.height,
                            block_id = %hex::encode(block.block_id),
                            "state play error"
                        );
                        e
                    })?;
            }

            self.ctx.consensus.process_confirm_block(&block).map_err(|e| {
                tracing::warn!(block_id = %hex::encode(block_id), err = %e, "consensus process confirm block failed");
                MinerError::Consensus("consensus process confirm block failed".to_string())
            })?;

            tracing::info!(
                height = block.height,
                block_id = %hex::encode(block.block_id),
                tx_count = block.tx_count(),
                "confirm block finish"
            );
        }

        tracing::trace!(block_count = block_ids.len(), "batch confirm block to ledger succ");
        Ok(())
    }

    /// Broadcast a status query and return the highest tip that the
    /// neighbourhood confirms as trunk.
    async fn whole_net_longest_block(&self) -> Result<Block, MinerError> {
        let responses = self
            .ctx
            .network
            .send_message_with_response(NetworkMessage::GetChainStatus)
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "get block chain status error");
                e
            })?;

        let mut statuses: Vec<ChainStatus> = responses
            .into_iter()
            .filter_map(|response| match response {
                NetworkResponse::ChainStatus(status) => Some(status),
                _ => None,
            })
            .collect();
        statuses.sort_by(|a, b| b.ledger_meta.trunk_height.cmp(&a.ledger_meta.trunk_height));

        for status in &statuses {
            if self.is_confirmed(status).await {
                return Ok(status.tip_block.clone());
            }
        }

        Err(MinerError::Network("not found longest block".to_string()))
    }

    /// Ask neighbours whether a candidate tip is their trunk tip.
    async fn is_confirmed(&self, status: &ChainStatus) -> bool {
        let replies = match self
            .ctx
            .network
            .send_message_with_response(NetworkMessage::ConfirmChainStatus {
                block_id: status.tip_block.block_id,
            })
            .await
        {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(err = %e, "confirm block chain status error");
                return false;
            }
        };

        count_confirm_votes(&replies)
    }
}

/// Quorum rule over confirmation-probe replies: supporters must be at
/// least the objectors and at least a third of all replies. Replies
/// that are not tip statuses still count toward the reply total.
pub(crate) fn count_confirm_votes(replies: &[NetworkResponse]) -> bool {
    let mut agree = 0usize;
    let mut disagree = 0usize;
    for reply in replies {
        if let NetworkResponse::TipStatus(tip) = reply {
            if tip.is_trunk_tip {
                agree += 1;
            } else {
                disagree += 1;
            }
        }
    }

    agree >= disagree && agree >= replies.len() / 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::TipStatus;

    fn agree() -> NetworkResponse {
        NetworkResponse::TipStatus(TipStatus { is_trunk_tip: true })
    }

    fn disagree() -> NetworkResponse {
        NetworkResponse::TipStatus(TipStatus {
            is_trunk_tip: false,
        })
    }

    fn replies(a: usize, d: usize, invalid: usize) -> Vec<NetworkResponse> {
        let mut all = Vec::new();
        all.extend((0..a).map(|_| agree()));
        all.extend((0..d).map(|_| disagree()));
        all.extend((0..invalid).map(|_| NetworkResponse::Invalid));
        all
    }

    #[test]
    fn unanimous_agreement_accepts() {
        assert!(count_confirm_votes(&replies(4, 0, 0)));
    }

    #[test]
    fn majority_objection_rejects() {
        assert!(!count_confirm_votes(&replies(1, 2, 0)));
    }

    #[test]
    fn tie_with_enough_share_accepts() {
        // 6 replies, 2 agree, 2 disagree, 2 invalid: 2 >= 2 and
        // 2 >= 6/3, so the candidate is accepted.
        assert!(count_confirm_votes(&replies(2, 2, 2)));
    }

    #[test]
    fn small_agreement_share_rejects() {
        // 9 replies with only 2 supporters: 2 < 9/3.
        assert!(!count_confirm_votes(&replies(2, 2, 5)));
    }

    #[test]
    fn empty_reply_set_accepts_trivially() {
        // 0 >= 0 and 0 >= 0; the caller never probes without peers.
        assert!(count_confirm_votes(&[]));
    }
}
