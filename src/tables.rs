//! Records persisted in the confirmed side-table.
//!
//! The miner is the only writer of these rows; peers observe them
//! indirectly through replayed blocks. Maps are `BTreeMap` so that tx
//! generation driven by them iterates in the same order on every
//! replica.

use crate::error::StorageError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Term counter with the one-shot new-cycle flag.
pub const TERM_TABLE_KEY: &str = "tdpos_term";
/// Set of candidate addresses with aggregate vote data.
pub const CANDIDATE_SET_KEY: &str = "tdpos_freezes_total_assets";
/// Un-bonding schedule: height -> amounts due for release.
pub const THAW_SCHEDULE_KEY: &str = "nodeinfo_tdos_thaw_total_assets";

pub fn cache_key(address: &str) -> String {
    format!("cache_{address}")
}

pub fn ballot_key(address: &str) -> String {
    format!("ballot_{address}")
}

pub fn frozen_key(address: &str) -> String {
    format!("amount_{address}")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermRecord {
    pub term: i64,
    pub new_cycle: bool,
}

/// All current candidates, keyed by address. The value mirrors the key
/// in the contract's representation; only the key set matters here.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateSet {
    pub candidates: BTreeMap<String, String>,
}

/// Authoritative per-candidate voter record written by the staking
/// contract: who votes for the candidate, with how much, and the
/// candidate's commission ratio in percent.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateRatio {
    pub voting_user: BTreeMap<String, u64>,
    pub ratio: u32,
    pub be_voted_total: u64,
}

/// Cycle-start snapshot of a candidate's voters, frozen for the term so
/// reward distribution is unaffected by mid-term vote churn.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheVoteCandidate {
    pub voting_user: BTreeMap<String, u64>,
    pub ratio: u32,
    pub total_vote: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrozenDetail {
    pub amount: u64,
    pub height: i64,
}

/// Per-address frozen-asset row.
///
/// Invariant: `total == sum(frozen_detail) + sum(thaw_detail)`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrozenAssetsTable {
    pub total: u64,
    pub frozen_detail: BTreeMap<String, FrozenDetail>,
    pub thaw_detail: BTreeMap<String, FrozenDetail>,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeThawEntry {
    pub address: String,
    pub amount: u64,
}

/// Node-wide un-bonding schedule, written by contract transactions and
/// consumed by the miner at each height.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeThawTable {
    pub node_details: BTreeMap<i64, Vec<NodeThawEntry>>,
}

pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let mut table = FrozenAssetsTable {
            total: 150,
            timestamp: 42,
            ..Default::default()
        };
        table.thaw_detail.insert(
            "t0".to_string(),
            FrozenDetail {
                amount: 150,
                height: 9,
            },
        );

        let bytes = encode_record(&table).unwrap();
        let back: FrozenAssetsTable = decode_record(&bytes).unwrap();
        assert_eq!(table, back);
    }

    #[test]
    fn keys_embed_address() {
        assert_eq!(cache_key("dp1aa"), "cache_dp1aa");
        assert_eq!(ballot_key("dp1aa"), "ballot_dp1aa");
        assert_eq!(frozen_key("dp1aa"), "amount_dp1aa");
    }
}
