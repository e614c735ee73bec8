use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];
pub type BlockId = Hash256;

/// Sentinel id used for "no parent" (the genesis pre-hash).
pub const ZERO_ID: BlockId = [0u8; 32];

/// Derive the textual address for a verifying key.
pub fn address_from_pubkey(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("dp1{}", hex::encode(&digest[..20]))
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    pub ref_txid: Hash256,
    pub ref_offset: u32,
    pub from: String,
    pub amount: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: u64,
    pub to: String,
}

/// Extension output: a key/value write against a contract bucket.
/// Timer transactions carry their scheduled work here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutputExt {
    pub bucket: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub outputs_ext: Vec<TxOutputExt>,
    pub desc: Vec<u8>,
    pub initiator: String,
    pub timestamp: i64,
    /// Coinbase-style tx minted by the block producer (award, vote award).
    pub coinbase: bool,
    /// Generated by the state machine rather than a user (thaw, timer).
    pub autogen: bool,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        let bytes = bincode::serialize(self).expect("tx serialization is infallible");
        Sha256::digest(bytes).into()
    }

    /// Serialized size in bytes, as counted against the block size limit.
    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(0)
    }

    /// Block award minted to the producer.
    pub fn award(to: &str, amount: u64, desc: &[u8], timestamp: i64) -> Self {
        Transaction {
            version: 1,
            outputs: vec![TxOutput {
                amount,
                to: to.to_string(),
            }],
            desc: desc.to_vec(),
            initiator: to.to_string(),
            timestamp,
            coinbase: true,
            ..Default::default()
        }
    }

    /// Share of the per-block reward pool credited to one voter.
    pub fn vote_award(miner: &str, voter: &str, amount: u64, timestamp: i64) -> Self {
        Transaction {
            version: 1,
            outputs: vec![TxOutput {
                amount,
                to: voter.to_string(),
            }],
            desc: b"vote_award".to_vec(),
            initiator: miner.to_string(),
            timestamp,
            coinbase: true,
            ..Default::default()
        }
    }

    /// Reverse transfer releasing a frozen amount back to its owner.
    /// Built out of thin air: it moves no node totals.
    pub fn reverse_transfer(to: &str, amount: u64, timestamp: i64) -> Self {
        Transaction {
            version: 1,
            outputs: vec![TxOutput {
                amount,
                to: to.to_string(),
            }],
            desc: b"thaw".to_vec(),
            initiator: to.to_string(),
            timestamp,
            autogen: true,
            ..Default::default()
        }
    }
}
