//! Consensus plug-in contract and the round-robin DPoS engine.
//!
//! The engine rotates block production over a fixed validator set and
//! counts terms in `blocks_per_term`-sized windows. It is the smallest
//! engine that exercises the full miner contract: leader election,
//! pre-mine ext data, id finalization and post-confirm accounting.

use crate::block::{Block, ConsensusStorage};
use crate::error::MinerError;
use crate::types::BlockId;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Clone, Debug, Default)]
pub struct ConsensusStatus {
    pub current_term: i64,
}

pub trait Consensus: Send + Sync {
    /// Decide whether this replica produces the block at `height`.
    /// Returns `(is_miner, need_sync)`.
    fn compete_master(&self, height: i64) -> Result<(bool, bool), MinerError>;

    /// Pre-mine hook. May return a truncate target when the engine
    /// wants the ledger rolled back before producing, plus the ext
    /// data blob sealed into the block.
    fn process_before_miner(&self, now_ns: i64) -> Result<(Option<BlockId>, Vec<u8>), MinerError>;

    /// Finalize the block id. Engines with expensive sealing (pow)
    /// mutate the id here.
    fn calculate_block(&self, block: &mut Block) -> Result<(), MinerError>;

    /// Post-confirm accounting for leader election.
    fn process_confirm_block(&self, block: &Block) -> Result<(), MinerError>;

    /// Check that `block` was produced by the proposer scheduled for
    /// its height.
    fn check_miner_match(&self, block: &Block) -> Result<bool, MinerError>;

    fn status(&self) -> Result<ConsensusStatus, MinerError>;
}

pub struct TdposEngine {
    address: String,
    validators: Vec<String>,
    blocks_per_term: i64,
    has_peers: bool,
    /// Height of the next block this replica competes for, refreshed
    /// by `compete_master` and bumped by confirmed blocks.
    next_height: AtomicI64,
}

impl TdposEngine {
    pub fn new(
        address: String,
        mut validators: Vec<String>,
        blocks_per_term: i64,
        has_peers: bool,
    ) -> Self {
        if validators.is_empty() {
            validators.push(address.clone());
        }
        TdposEngine {
            address,
            validators,
            blocks_per_term: blocks_per_term.max(1),
            has_peers,
            next_height: AtomicI64::new(1),
        }
    }

    fn proposer_for(&self, height: i64) -> &str {
        let index = (height.max(0) as usize) % self.validators.len();
        &self.validators[index]
    }

    fn term_for(&self, height: i64) -> i64 {
        1 + height.max(0) / self.blocks_per_term
    }
}

impl Consensus for TdposEngine {
    fn compete_master(&self, height: i64) -> Result<(bool, bool), MinerError> {
        self.next_height.store(height, Ordering::SeqCst);
        let is_miner = self.proposer_for(height) == self.address;
        Ok((is_miner, is_miner && self.has_peers))
    }

    fn process_before_miner(&self, _now_ns: i64) -> Result<(Option<BlockId>, Vec<u8>), MinerError> {
        let height = self.next_height.load(Ordering::SeqCst);
        let storage = ConsensusStorage {
            cur_term: self.term_for(height),
            cur_block_num: height % self.blocks_per_term,
            target_bits: 0,
            justify: vec![],
        };
        let ext = serde_json::to_vec(&storage)
            .map_err(|e| MinerError::Consensus(e.to_string()))?;
        Ok((None, ext))
    }

    fn calculate_block(&self, block: &mut Block) -> Result<(), MinerError> {
        block.block_id = block.content_hash();
        Ok(())
    }

    fn process_confirm_block(&self, block: &Block) -> Result<(), MinerError> {
        self.next_height
            .fetch_max(block.height + 1, Ordering::SeqCst);
        Ok(())
    }

    fn check_miner_match(&self, block: &Block) -> Result<bool, MinerError> {
        Ok(self.proposer_for(block.height) == block.proposer)
    }

    fn status(&self) -> Result<ConsensusStatus, MinerError> {
        let height = self.next_height.load(Ordering::SeqCst);
        Ok(ConsensusStatus {
            current_term: self.term_for(height),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_validator_always_elected() {
        let engine = TdposEngine::new("dp1solo".to_string(), vec![], 10, false);
        let (is_miner, need_sync) = engine.compete_master(1).unwrap();
        assert!(is_miner);
        assert!(!need_sync);
    }

    #[test]
    fn proposers_rotate_by_height() {
        let engine = TdposEngine::new(
            "dp1a".to_string(),
            vec!["dp1a".to_string(), "dp1b".to_string(), "dp1c".to_string()],
            10,
            true,
        );
        assert_eq!(engine.proposer_for(3), "dp1a");
        assert_eq!(engine.proposer_for(4), "dp1b");
        assert_eq!(engine.proposer_for(5), "dp1c");

        let (is_miner, need_sync) = engine.compete_master(4).unwrap();
        assert!(!is_miner);
        assert!(!need_sync);
    }

    #[test]
    fn term_advances_every_window() {
        let engine = TdposEngine::new("dp1a".to_string(), vec![], 3, false);
        engine.compete_master(1).unwrap();
        assert_eq!(engine.status().unwrap().current_term, 1);
        engine.compete_master(3).unwrap();
        assert_eq!(engine.status().unwrap().current_term, 2);
        engine.compete_master(6).unwrap();
        assert_eq!(engine.status().unwrap().current_term, 3);
    }

    #[test]
    fn miner_match_checks_schedule() {
        let engine = TdposEngine::new(
            "dp1a".to_string(),
            vec!["dp1a".to_string(), "dp1b".to_string()],
            10,
            true,
        );
        let mut block = Block {
            height: 2,
            proposer: "dp1a".to_string(),
            ..Default::default()
        };
        assert!(engine.check_miner_match(&block).unwrap());
        block.proposer = "dp1b".to_string();
        assert!(!engine.check_miner_match(&block).unwrap());
    }
}
