//! State machine contract and the balance-map reference implementation.
//!
//! `UtxoState` replays the ledger trunk into per-address balances. It
//! is deliberately small: the miner only needs the contract surface
//! (tip tracking, walk/play, the mempool view and autogen transaction
//! construction).

use crate::block::Block;
use crate::error::MinerError;
use crate::ledger::{ConfirmBatch, Ledger, SledLedger};
use crate::types::{BlockId, Transaction};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;

/// Bytes reserved for the block header when budgeting transactions.
const BLOCK_HEADER_RESERVE: usize = 2048;

pub trait State: Send + Sync {
    fn latest_block_id(&self) -> BlockId;

    /// Re-point the state machine at `target`, replaying the chain
    /// that leads to it. Used to repair ledger/state divergence.
    fn walk(&self, target: &BlockId, dont_repost: bool) -> Result<(), MinerError>;

    /// Advance exactly one block that the local miner just produced.
    fn play_for_miner(&self, block_id: &BlockId) -> Result<(), MinerError>;

    /// Advance one block received from the network.
    fn play_and_repost(
        &self,
        block_id: &BlockId,
        dont_repost: bool,
        tip_changed: bool,
    ) -> Result<(), MinerError>;

    /// Mempool snapshot in admission order.
    fn unconfirmed_txs(&self) -> Result<Vec<Transaction>, MinerError>;

    /// Scheduled (timer) transaction for a height. Carries extension
    /// outputs only when there is scheduled work.
    fn timer_tx(&self, height: i64) -> Result<Transaction, MinerError>;

    fn max_tx_size_per_block(&self) -> Result<usize, MinerError>;

    fn max_block_size(&self) -> usize;

    /// Total circulating amount.
    fn total(&self) -> u64;

    /// Build a reverse transfer releasing `amount` back to `address`.
    /// The tx is conjured by the state machine and does not move node
    /// totals; the batch is the staging area used by the caller.
    fn reverse_tx(
        &self,
        address: &str,
        batch: &ConfirmBatch,
        amount: u64,
    ) -> Result<Transaction, MinerError>;
}

pub struct UtxoState {
    ledger: Arc<SledLedger>,
    latest: RwLock<BlockId>,
    balances: DashMap<String, u64>,
    mempool: Mutex<Vec<Transaction>>,
    max_block_size: usize,
}

impl UtxoState {
    pub fn new(ledger: Arc<SledLedger>, max_block_size: usize) -> Result<Arc<Self>, MinerError> {
        let state = Arc::new(UtxoState {
            ledger,
            latest: RwLock::new(crate::types::ZERO_ID),
            balances: DashMap::new(),
            mempool: Mutex::new(Vec::new()),
            max_block_size,
        });
        let tip = state.ledger.meta().tip_block_id;
        state.walk(&tip, false)?;
        Ok(state)
    }

    /// Admit a transaction to the mempool. Duplicates by txid are
    /// silently ignored.
    pub fn submit_tx(&self, tx: Transaction) {
        let mut pool = self.mempool.lock();
        let txid = tx.txid();
        if pool.iter().any(|t| t.txid() == txid) {
            return;
        }
        pool.push(tx);
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.balances.get(address).map(|v| *v).unwrap_or(0)
    }

    /// Chain of blocks from the root to `target`, oldest first.
    fn chain_to(&self, target: &BlockId) -> Result<Vec<Block>, MinerError> {
        let mut chain = Vec::new();
        let mut cursor = *target;
        loop {
            let block = self
                .ledger
                .get_block(&cursor)
                .map_err(MinerError::Storage)?
                .ok_or_else(|| MinerError::State("walk target chain is broken".to_string()))?;
            let pre_hash = block.pre_hash;
            let is_genesis = block.is_genesis();
            chain.push(block);
            if is_genesis {
                break;
            }
            cursor = pre_hash;
        }
        chain.reverse();
        Ok(chain)
    }

    fn credit_and_debit(balances: &DashMap<String, u64>, block: &Block) {
        for tx in &block.transactions {
            for input in &tx.inputs {
                let mut entry = balances.entry(input.from.clone()).or_insert(0);
                *entry = entry.saturating_sub(input.amount);
            }
            for output in &tx.outputs {
                *balances.entry(output.to.clone()).or_insert(0) += output.amount;
            }
        }
    }

    fn prune_mempool(&self, block: &Block) {
        let confirmed: HashSet<_> = block.transactions.iter().map(|tx| tx.txid()).collect();
        self.mempool.lock().retain(|tx| !confirmed.contains(&tx.txid()));
    }

    fn play_one(&self, block_id: &BlockId) -> Result<(), MinerError> {
        let block = self
            .ledger
            .get_block(block_id)
            .map_err(MinerError::Storage)?
            .ok_or_else(|| MinerError::State("play target not in ledger".to_string()))?;

        let mut latest = self.latest.write();
        if block.pre_hash != *latest {
            return Err(MinerError::State(format!(
                "block {} does not extend state tip",
                hex::encode(block_id)
            )));
        }
        Self::credit_and_debit(&self.balances, &block);
        *latest = *block_id;
        drop(latest);

        self.prune_mempool(&block);
        Ok(())
    }
}

impl State for UtxoState {
    fn latest_block_id(&self) -> BlockId {
        *self.latest.read()
    }

    fn walk(&self, target: &BlockId, _dont_repost: bool) -> Result<(), MinerError> {
        let chain = self.chain_to(target)?;

        let fresh = DashMap::new();
        for block in &chain {
            Self::credit_and_debit(&fresh, block);
        }

        self.balances.clear();
        for (address, amount) in fresh {
            self.balances.insert(address, amount);
        }
        *self.latest.write() = *target;

        tracing::debug!(
            target_id = %hex::encode(target),
            blocks = chain.len(),
            "state walked"
        );
        Ok(())
    }

    fn play_for_miner(&self, block_id: &BlockId) -> Result<(), MinerError> {
        self.play_one(block_id)
    }

    fn play_and_repost(
        &self,
        block_id: &BlockId,
        _dont_repost: bool,
        _tip_changed: bool,
    ) -> Result<(), MinerError> {
        self.play_one(block_id)
    }

    fn unconfirmed_txs(&self) -> Result<Vec<Transaction>, MinerError> {
        Ok(self.mempool.lock().clone())
    }

    fn timer_tx(&self, height: i64) -> Result<Transaction, MinerError> {
        // No contract scheduler in the reference state: the timer tx
        // carries no extension outputs and is dropped by the packer.
        Ok(Transaction {
            version: 1,
            desc: b"timer".to_vec(),
            timestamp: height,
            autogen: true,
            ..Default::default()
        })
    }

    fn max_tx_size_per_block(&self) -> Result<usize, MinerError> {
        Ok(self.max_block_size.saturating_sub(BLOCK_HEADER_RESERVE))
    }

    fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    fn total(&self) -> u64 {
        self.balances.iter().map(|entry| *entry.value()).sum()
    }

    fn reverse_tx(
        &self,
        address: &str,
        _batch: &ConfirmBatch,
        amount: u64,
    ) -> Result<Transaction, MinerError> {
        if address.is_empty() {
            return Err(MinerError::Parameter("reverse tx address is empty"));
        }
        let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Ok(Transaction::reverse_transfer(address, amount, now_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{FormatBlockArgs, Ledger};
    use crate::types::address_from_pubkey;
    use ed25519_dalek::SigningKey;

    fn fixture() -> (Arc<SledLedger>, Arc<UtxoState>, SigningKey, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("chain")).unwrap();
        let ledger = SledLedger::open(&db).unwrap();
        let state = UtxoState::new(Arc::clone(&ledger), 1 << 20).unwrap();
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        (ledger, state, key, dir)
    }

    fn mine_award(
        ledger: &SledLedger,
        state: &UtxoState,
        key: &SigningKey,
        height: i64,
        amount: u64,
    ) -> Block {
        let proposer = address_from_pubkey(&key.verifying_key());
        let block = ledger
            .format_miner_block(FormatBlockArgs {
                txs: vec![Transaction::award(&proposer, amount, b"award", height)],
                proposer: &proposer,
                signing_key: key,
                timestamp_ns: height,
                cur_term: 1,
                cur_block_num: height,
                pre_hash: state.latest_block_id(),
                target_bits: 0,
                state_total: state.total(),
                justify: vec![],
                height,
            })
            .unwrap();
        assert!(ledger.confirm_block(&block, false).succ);
        block
    }

    #[test]
    fn play_advances_tip_and_credits_award() {
        let (ledger, state, key, _tmp) = fixture();
        let proposer = address_from_pubkey(&key.verifying_key());

        let block = mine_award(&ledger, &state, &key, 1, 75);
        state.play_for_miner(&block.block_id).unwrap();

        assert_eq!(state.latest_block_id(), block.block_id);
        assert_eq!(state.balance(&proposer), 75);
        assert_eq!(state.total(), 75);
    }

    #[test]
    fn play_rejects_non_extending_block() {
        let (ledger, state, key, _tmp) = fixture();
        let b1 = mine_award(&ledger, &state, &key, 1, 10);
        state.play_for_miner(&b1.block_id).unwrap();
        let b2 = mine_award(&ledger, &state, &key, 2, 10);
        state.play_for_miner(&b2.block_id).unwrap();

        // Replaying b1 no longer extends the state tip.
        assert!(state.play_for_miner(&b1.block_id).is_err());
    }

    #[test]
    fn walk_repairs_divergence() {
        let (ledger, state, key, _tmp) = fixture();
        let proposer = address_from_pubkey(&key.verifying_key());

        // Two blocks land in the ledger while the state lags.
        let b1 = mine_award(&ledger, &state, &key, 1, 10);
        state.play_for_miner(&b1.block_id).unwrap();
        let b2 = mine_award(&ledger, &state, &key, 2, 20);

        assert_ne!(state.latest_block_id(), ledger.meta().tip_block_id);
        state.walk(&ledger.meta().tip_block_id, false).unwrap();
        assert_eq!(state.latest_block_id(), b2.block_id);
        assert_eq!(state.balance(&proposer), 30);
    }

    #[test]
    fn mempool_dedupes_and_prunes() {
        let (ledger, state, key, _tmp) = fixture();
        let tx = Transaction::award("dp1user", 5, b"p", 1);
        state.submit_tx(tx.clone());
        state.submit_tx(tx.clone());
        assert_eq!(state.unconfirmed_txs().unwrap().len(), 1);

        let proposer = address_from_pubkey(&key.verifying_key());
        let block = ledger
            .format_miner_block(FormatBlockArgs {
                txs: vec![
                    Transaction::award(&proposer, 1, b"award", 1),
                    tx.clone(),
                ],
                proposer: &proposer,
                signing_key: &key,
                timestamp_ns: 1,
                cur_term: 1,
                cur_block_num: 1,
                pre_hash: state.latest_block_id(),
                target_bits: 0,
                state_total: 0,
                justify: vec![],
                height: 1,
            })
            .unwrap();
        assert!(ledger.confirm_block(&block, false).succ);
        state.play_for_miner(&block.block_id).unwrap();
        assert!(state.unconfirmed_txs().unwrap().is_empty());
    }
}
