//! Block format for the DPoS chain.
//!
//! A block is identified by the sha256 of its header content; the
//! producer signs that id. Consensus bookkeeping (term, in-term block
//! number, difficulty bits, justify blob) rides in the header so every
//! replica can replay leader election.

use crate::types::{Hash256, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Build a merkle root over a list of hashes.
fn build_merkle_root(mut hashes: Vec<Hash256>) -> Hash256 {
    if hashes.is_empty() {
        return [0u8; 32];
    }

    while hashes.len() > 1 {
        if hashes.len() % 2 == 1 {
            hashes.push(*hashes.last().expect("non-empty"));
        }
        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0]);
                hasher.update(pair[1]);
                hasher.finalize().into()
            })
            .collect();
    }
    hashes[0]
}

pub fn calculate_merkle_root(txs: &[Transaction]) -> Hash256 {
    build_merkle_root(txs.iter().map(|tx| tx.txid()).collect())
}

/// Consensus storage blob attached to each block.
///
/// The consensus engine hands this over as a JSON ext-data buffer from
/// `process_before_miner`; an empty buffer decodes to the default.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusStorage {
    #[serde(default)]
    pub cur_term: i64,
    #[serde(default)]
    pub cur_block_num: i64,
    #[serde(default)]
    pub target_bits: i32,
    #[serde(default)]
    pub justify: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub block_id: Hash256,
    pub pre_hash: Hash256,
    pub height: i64,
    /// Nanosecond timestamp set by the producer.
    pub timestamp: i64,
    pub proposer: String,
    pub proposer_pubkey: Vec<u8>,
    pub sign: Vec<u8>,
    pub merkle_root: Hash256,
    pub cur_term: i64,
    pub cur_block_num: i64,
    pub target_bits: i32,
    pub justify: Vec<u8>,
    /// Total circulating amount as seen by the producer's state machine.
    pub state_total: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(0)
    }

    /// Hash of the consensus-critical header fields. The signature and
    /// the id itself are excluded so the id can be recomputed by any
    /// replica for verification.
    pub fn content_hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.pre_hash);
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.proposer.as_bytes());
        hasher.update(self.merkle_root);
        hasher.update(self.cur_term.to_le_bytes());
        hasher.update(self.cur_block_num.to_le_bytes());
        hasher.update(self.target_bits.to_le_bytes());
        hasher.update(&self.justify);
        hasher.update(self.state_total.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }
}

/// Read-only snapshot of the ledger's trunk position.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerMeta {
    pub tip_block_id: Hash256,
    pub trunk_height: i64,
    pub root_block_id: Hash256,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transaction;

    #[test]
    fn merkle_root_of_empty_list_is_zero() {
        assert_eq!(calculate_merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn merkle_root_of_single_tx_is_txid() {
        let tx = Transaction::award("dp1aa", 10, b"award", 1);
        assert_eq!(calculate_merkle_root(&[tx.clone()]), tx.txid());
    }

    #[test]
    fn content_hash_ignores_signature() {
        let mut block = Block {
            height: 3,
            proposer: "dp1aa".to_string(),
            ..Default::default()
        };
        let before = block.content_hash();
        block.sign = vec![1, 2, 3];
        assert_eq!(before, block.content_hash());
    }

    #[test]
    fn consensus_storage_decodes_from_partial_json() {
        let cons: ConsensusStorage = serde_json::from_slice(b"{\"cur_term\":7}").unwrap();
        assert_eq!(cons.cur_term, 7);
        assert_eq!(cons.cur_block_num, 0);
    }
}
