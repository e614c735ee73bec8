//! Ledger contract and the sled-backed reference implementation.
//!
//! The ledger owns three append-side structures (block store, trunk
//! index, pending-block stash) and two shared handles the miner leans
//! on: the confirmed side-table and the transactional confirm batch.

use crate::block::{calculate_merkle_root, Block, LedgerMeta};
use crate::error::{MinerError, StorageError};
use crate::tables::{decode_record, encode_record};
use crate::types::{address_from_pubkey, BlockId, Transaction, ZERO_ID};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

const META_KEY: &[u8] = b"meta";

/// Base award in atomic units, halved every `AWARD_HALVING_INTERVAL`
/// blocks.
const BASE_AWARD: i64 = 100_000_000;
const AWARD_HALVING_INTERVAL: i64 = 5_000_000;

#[derive(Clone, Debug, Default)]
pub struct ConfirmStatus {
    pub succ: bool,
    /// Block was attached to a branch instead of extending the trunk.
    pub orphan: bool,
    pub error: Option<String>,
}

impl ConfirmStatus {
    fn ok() -> Self {
        ConfirmStatus {
            succ: true,
            ..Default::default()
        }
    }

    fn orphaned() -> Self {
        ConfirmStatus {
            succ: true,
            orphan: true,
            error: None,
        }
    }

    fn failed(msg: impl Into<String>) -> Self {
        ConfirmStatus {
            succ: false,
            orphan: false,
            error: Some(msg.into()),
        }
    }
}

/// Everything the miner hands the ledger to seal a block.
pub struct FormatBlockArgs<'a> {
    pub txs: Vec<Transaction>,
    pub proposer: &'a str,
    pub signing_key: &'a SigningKey,
    pub timestamp_ns: i64,
    pub cur_term: i64,
    pub cur_block_num: i64,
    pub pre_hash: BlockId,
    pub target_bits: i32,
    pub state_total: u64,
    pub justify: Vec<u8>,
    pub height: i64,
}

/// Key/value view over the confirmed side-table. Values are bincode
/// records.
pub struct ConfirmedTable {
    tree: sled::Tree,
}

impl ConfirmedTable {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        self.tree.insert(key.as_bytes(), encode_record(value)?)?;
        Ok(())
    }
}

/// Transactional write set shared between the miner and the ledger.
///
/// Writes are staged with `put_record` and land atomically on
/// `write()`. The stage is drained on every commit, so a failed or
/// skipped iteration cannot leak rows into the next one.
pub struct ConfirmBatch {
    tree: sled::Tree,
    staged: Mutex<sled::Batch>,
}

impl ConfirmBatch {
    pub fn put_record<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = encode_record(value)?;
        self.staged.lock().insert(key.as_bytes(), bytes);
        Ok(())
    }

    pub fn write(&self) -> Result<(), StorageError> {
        let batch = std::mem::take(&mut *self.staged.lock());
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    /// Drop everything staged without committing. Callers that abort
    /// an operation midway use this so the next commit does not flush
    /// their partial writes.
    pub fn discard(&self) {
        *self.staged.lock() = sled::Batch::default();
    }
}

pub trait Ledger: Send + Sync {
    fn meta(&self) -> LedgerMeta;

    /// Block award for a given height, from the genesis emission
    /// schedule. May legitimately reach zero; never negative.
    fn calc_award(&self, height: i64) -> i64;

    fn format_miner_block(&self, args: FormatBlockArgs<'_>) -> Result<Block, MinerError>;

    fn confirm_block(&self, block: &Block, is_root: bool) -> ConfirmStatus;

    /// Roll the trunk back to `target`, discarding all descendants.
    fn truncate(&self, target: &BlockId) -> Result<(), MinerError>;

    fn save_pending_block(&self, block: &Block) -> Result<(), MinerError>;

    fn pending_block(&self, block_id: &BlockId) -> Option<Block>;

    fn exist_block(&self, block_id: &BlockId) -> bool;

    fn query_block_header(&self, block_id: &BlockId) -> Result<Block, MinerError>;

    fn verify_block(&self, block: &Block) -> Result<bool, MinerError>;

    fn is_valid_tx(&self, index: usize, tx: &Transaction, block: &Block) -> bool;

    fn confirm_batch(&self) -> Arc<ConfirmBatch>;

    fn confirmed_table(&self) -> Arc<ConfirmedTable>;
}

pub struct SledLedger {
    blocks: sled::Tree,
    trunk: sled::Tree,
    pending: sled::Tree,
    meta: RwLock<LedgerMeta>,
    meta_tree: sled::Tree,
    confirmed: Arc<ConfirmedTable>,
    batch: Arc<ConfirmBatch>,
}

impl SledLedger {
    pub fn open(db: &sled::Db) -> Result<Arc<Self>, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let trunk = db.open_tree("trunk")?;
        let pending = db.open_tree("pending")?;
        let confirmed_tree = db.open_tree("confirmed")?;
        let meta_tree = db.open_tree("meta")?;

        let meta = match meta_tree.get(META_KEY)? {
            Some(bytes) => decode_record(&bytes)?,
            None => LedgerMeta::default(),
        };

        let ledger = Arc::new(SledLedger {
            blocks,
            trunk,
            pending,
            meta: RwLock::new(meta),
            meta_tree,
            confirmed: Arc::new(ConfirmedTable {
                tree: confirmed_tree.clone(),
            }),
            batch: Arc::new(ConfirmBatch {
                tree: confirmed_tree,
                staged: Mutex::new(sled::Batch::default()),
            }),
        });

        if ledger.blocks.is_empty() {
            let genesis = Self::genesis_block();
            let status = ledger.confirm_block(&genesis, true);
            if !status.succ {
                return Err(StorageError::DatabaseOp(
                    status.error.unwrap_or_else(|| "genesis confirm failed".to_string()),
                ));
            }
            tracing::info!(
                block_id = %hex::encode(genesis.block_id),
                "created genesis block"
            );
        }

        Ok(ledger)
    }

    /// The genesis block is fully deterministic so that every replica
    /// starts from the same root id.
    fn genesis_block() -> Block {
        let mut genesis = Block {
            pre_hash: ZERO_ID,
            height: 0,
            timestamp: 0,
            ..Default::default()
        };
        genesis.merkle_root = calculate_merkle_root(&genesis.transactions);
        genesis.block_id = genesis.content_hash();
        genesis
    }

    pub fn get_block(&self, block_id: &BlockId) -> Result<Option<Block>, StorageError> {
        match self.blocks.get(block_id)? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn persist_meta(&self, meta: &LedgerMeta) -> Result<(), StorageError> {
        self.meta_tree.insert(META_KEY, encode_record(meta)?)?;
        Ok(())
    }

    fn store_block(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks.insert(block.block_id, encode_record(block)?)?;
        Ok(())
    }
}

impl Ledger for SledLedger {
    fn meta(&self) -> LedgerMeta {
        self.meta.read().clone()
    }

    fn calc_award(&self, height: i64) -> i64 {
        let halvings = (height / AWARD_HALVING_INTERVAL).min(62);
        BASE_AWARD >> halvings
    }

    fn format_miner_block(&self, args: FormatBlockArgs<'_>) -> Result<Block, MinerError> {
        if args.proposer.is_empty() {
            return Err(MinerError::Parameter("proposer address is empty"));
        }

        let mut block = Block {
            pre_hash: args.pre_hash,
            height: args.height,
            timestamp: args.timestamp_ns,
            proposer: args.proposer.to_string(),
            proposer_pubkey: args.signing_key.verifying_key().as_bytes().to_vec(),
            merkle_root: calculate_merkle_root(&args.txs),
            cur_term: args.cur_term,
            cur_block_num: args.cur_block_num,
            target_bits: args.target_bits,
            justify: args.justify,
            state_total: args.state_total,
            transactions: args.txs,
            ..Default::default()
        };
        block.block_id = block.content_hash();
        block.sign = args.signing_key.sign(&block.block_id).to_bytes().to_vec();
        Ok(block)
    }

    fn confirm_block(&self, block: &Block, is_root: bool) -> ConfirmStatus {
        if self.exist_block(&block.block_id) {
            return ConfirmStatus::ok();
        }

        let mut meta = self.meta.write();

        if is_root {
            if let Err(e) = self.store_block(block) {
                return ConfirmStatus::failed(e.to_string());
            }
            if let Err(e) = self.trunk.insert(block.height.to_be_bytes(), block.block_id.to_vec()) {
                return ConfirmStatus::failed(e.to_string());
            }
            *meta = LedgerMeta {
                tip_block_id: block.block_id,
                trunk_height: block.height,
                root_block_id: block.block_id,
            };
            if let Err(e) = self.persist_meta(&meta) {
                return ConfirmStatus::failed(e.to_string());
            }
            return ConfirmStatus::ok();
        }

        if block.pre_hash == meta.tip_block_id {
            if block.height != meta.trunk_height + 1 {
                return ConfirmStatus::failed(format!(
                    "height {} does not extend trunk at {}",
                    block.height, meta.trunk_height
                ));
            }
            if let Err(e) = self.store_block(block) {
                return ConfirmStatus::failed(e.to_string());
            }
            if let Err(e) = self.trunk.insert(block.height.to_be_bytes(), block.block_id.to_vec()) {
                return ConfirmStatus::failed(e.to_string());
            }
            meta.tip_block_id = block.block_id;
            meta.trunk_height = block.height;
            if let Err(e) = self.persist_meta(&meta) {
                return ConfirmStatus::failed(e.to_string());
            }
            return ConfirmStatus::ok();
        }

        // Known parent off the tip: keep the block as a branch. Trunk
        // switching is driven by the sync engine via truncate.
        match self.get_block(&block.pre_hash) {
            Ok(Some(_)) => {
                if let Err(e) = self.store_block(block) {
                    return ConfirmStatus::failed(e.to_string());
                }
                ConfirmStatus::orphaned()
            }
            Ok(None) => ConfirmStatus::failed("unknown pre hash"),
            Err(e) => ConfirmStatus::failed(e.to_string()),
        }
    }

    fn truncate(&self, target: &BlockId) -> Result<(), MinerError> {
        let target_block = self
            .get_block(target)
            .map_err(MinerError::Storage)?
            .ok_or_else(|| MinerError::Ledger("truncate target not found".to_string()))?;

        let mut meta = self.meta.write();
        for height in (target_block.height + 1)..=meta.trunk_height {
            self.trunk
                .remove(height.to_be_bytes())
                .map_err(|e| MinerError::Storage(e.into()))?;
        }
        meta.tip_block_id = target_block.block_id;
        meta.trunk_height = target_block.height;
        self.persist_meta(&meta).map_err(MinerError::Storage)?;

        tracing::info!(
            height = target_block.height,
            block_id = %hex::encode(target_block.block_id),
            "ledger truncated"
        );
        Ok(())
    }

    fn save_pending_block(&self, block: &Block) -> Result<(), MinerError> {
        let bytes = encode_record(block).map_err(MinerError::Storage)?;
        self.pending
            .insert(block.block_id, bytes)
            .map_err(|e| MinerError::Storage(e.into()))?;
        Ok(())
    }

    fn pending_block(&self, block_id: &BlockId) -> Option<Block> {
        self.pending
            .get(block_id)
            .ok()
            .flatten()
            .and_then(|bytes| decode_record(&bytes).ok())
    }

    fn exist_block(&self, block_id: &BlockId) -> bool {
        self.blocks.contains_key(block_id).unwrap_or(false)
    }

    fn query_block_header(&self, block_id: &BlockId) -> Result<Block, MinerError> {
        self.get_block(block_id)
            .map_err(MinerError::Storage)?
            .ok_or_else(|| MinerError::Ledger("block not found".to_string()))
    }

    fn verify_block(&self, block: &Block) -> Result<bool, MinerError> {
        if block.block_id != block.content_hash() {
            return Ok(false);
        }
        if block.merkle_root != calculate_merkle_root(&block.transactions) {
            return Ok(false);
        }

        let pubkey_bytes: [u8; 32] = match block.proposer_pubkey.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        let Ok(pubkey) = VerifyingKey::from_bytes(&pubkey_bytes) else {
            return Ok(false);
        };
        if address_from_pubkey(&pubkey) != block.proposer {
            return Ok(false);
        }
        let Ok(signature) = Signature::from_slice(&block.sign) else {
            return Ok(false);
        };
        Ok(pubkey.verify(&block.block_id, &signature).is_ok())
    }

    fn is_valid_tx(&self, _index: usize, tx: &Transaction, _block: &Block) -> bool {
        tx.coinbase || tx.autogen || !tx.outputs.is_empty() || !tx.outputs_ext.is_empty()
    }

    fn confirm_batch(&self) -> Arc<ConfirmBatch> {
        Arc::clone(&self.batch)
    }

    fn confirmed_table(&self) -> Arc<ConfirmedTable> {
        Arc::clone(&self.confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_ledger() -> (Arc<SledLedger>, sled::Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("chain")).unwrap();
        let ledger = SledLedger::open(&db).unwrap();
        (ledger, db, dir)
    }

    fn sealed_block(ledger: &SledLedger, key: &SigningKey, height: i64) -> Block {
        let proposer = address_from_pubkey(&key.verifying_key());
        ledger
            .format_miner_block(FormatBlockArgs {
                txs: vec![Transaction::award(&proposer, 10, b"award", height)],
                proposer: &proposer,
                signing_key: key,
                timestamp_ns: height * 1_000,
                cur_term: 1,
                cur_block_num: height,
                pre_hash: ledger.meta().tip_block_id,
                target_bits: 0,
                state_total: 0,
                justify: vec![],
                height,
            })
            .unwrap()
    }

    #[test]
    fn genesis_is_deterministic() {
        let (a, _dba, _ta) = temp_ledger();
        let (b, _dbb, _tb) = temp_ledger();
        assert_eq!(a.meta().root_block_id, b.meta().root_block_id);
        assert_eq!(a.meta().trunk_height, 0);
    }

    #[test]
    fn confirm_extends_trunk_and_detects_orphans() {
        let (ledger, _db, _tmp) = temp_ledger();
        let key = SigningKey::generate(&mut rand::rngs::OsRng);

        let b1 = sealed_block(&ledger, &key, 1);
        let status = ledger.confirm_block(&b1, false);
        assert!(status.succ && !status.orphan);
        assert_eq!(ledger.meta().trunk_height, 1);

        // A second block at height 1 from the same parent is a branch.
        let mut fork = sealed_block(&ledger, &key, 1);
        fork.pre_hash = ledger.meta().root_block_id;
        fork.timestamp += 1;
        fork.block_id = fork.content_hash();
        let status = ledger.confirm_block(&fork, false);
        assert!(status.succ && status.orphan);
        assert_eq!(ledger.meta().trunk_height, 1);
        assert_eq!(ledger.meta().tip_block_id, b1.block_id);
    }

    #[test]
    fn truncate_rolls_back_to_target() {
        let (ledger, _db, _tmp) = temp_ledger();
        let key = SigningKey::generate(&mut rand::rngs::OsRng);

        let b1 = sealed_block(&ledger, &key, 1);
        assert!(ledger.confirm_block(&b1, false).succ);
        let b2 = sealed_block(&ledger, &key, 2);
        assert!(ledger.confirm_block(&b2, false).succ);

        ledger.truncate(&b1.block_id).unwrap();
        let meta = ledger.meta();
        assert_eq!(meta.trunk_height, 1);
        assert_eq!(meta.tip_block_id, b1.block_id);
    }

    #[test]
    fn verify_rejects_tampered_block() {
        let (ledger, _db, _tmp) = temp_ledger();
        let key = SigningKey::generate(&mut rand::rngs::OsRng);

        let mut block = sealed_block(&ledger, &key, 1);
        assert!(ledger.verify_block(&block).unwrap());

        block.state_total += 1;
        assert!(!ledger.verify_block(&block).unwrap());
    }

    #[test]
    fn award_halves_on_schedule() {
        let (ledger, _db, _tmp) = temp_ledger();
        let early = ledger.calc_award(1);
        let late = ledger.calc_award(AWARD_HALVING_INTERVAL + 1);
        assert_eq!(early, BASE_AWARD);
        assert_eq!(late, BASE_AWARD / 2);
        assert!(ledger.calc_award(i64::MAX) >= 0);
    }

    #[test]
    fn confirm_batch_drains_on_write() {
        let (ledger, _db, _tmp) = temp_ledger();
        let batch = ledger.confirm_batch();
        let table = ledger.confirmed_table();

        batch.put_record("k1", &1u64).unwrap();
        batch.write().unwrap();
        assert_eq!(table.get::<u64>("k1").unwrap(), Some(1));

        // A second commit without staging must not replay the first.
        ledger.confirmed.tree.remove("k1").unwrap();
        batch.write().unwrap();
        assert_eq!(table.get::<u64>("k1").unwrap(), None);
    }
}
