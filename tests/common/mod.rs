//! Shared fixtures: a node wired over a temp sled database, a
//! scripted network and a scripted consensus engine.

#![allow(dead_code)]

use async_trait::async_trait;
use dpos_node::block::{Block, ConsensusStorage};
use dpos_node::config::BroadcastMode;
use dpos_node::consensus::{Consensus, ConsensusStatus, TdposEngine};
use dpos_node::context::{ChainContext, EngineOptions, NodeKeypair};
use dpos_node::error::MinerError;
use dpos_node::ledger::{Ledger, SledLedger};
use dpos_node::miner::Miner;
use dpos_node::network::message::{BlockInfo, NetworkMessage, NetworkResponse};
use dpos_node::network::Network;
use dpos_node::state::UtxoState;
use dpos_node::types::BlockId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub const MAX_BLOCK_SIZE: usize = 1 << 20;

/// Network double: scripted responses, recorded sends.
#[derive(Default)]
pub struct StubNetwork {
    pub blocks: Mutex<HashMap<BlockId, Block>>,
    pub chain_status: Mutex<Vec<NetworkResponse>>,
    pub tip_votes: Mutex<Vec<NetworkResponse>>,
    pub sent: Mutex<Vec<NetworkMessage>>,
}

impl StubNetwork {
    pub fn add_block(&self, block: Block) {
        self.blocks.lock().insert(block.block_id, block);
    }
}

#[async_trait]
impl Network for StubNetwork {
    async fn send_message(&self, msg: NetworkMessage) -> Result<(), MinerError> {
        self.sent.lock().push(msg);
        Ok(())
    }

    async fn send_message_with_response(
        &self,
        msg: NetworkMessage,
    ) -> Result<Vec<NetworkResponse>, MinerError> {
        match msg {
            NetworkMessage::GetChainStatus => Ok(self.chain_status.lock().clone()),
            NetworkMessage::ConfirmChainStatus { .. } => Ok(self.tip_votes.lock().clone()),
            NetworkMessage::GetBlock { block_id, .. } => {
                Ok(match self.blocks.lock().get(&block_id) {
                    Some(block) => vec![NetworkResponse::BlockInfo(BlockInfo {
                        block: Some(block.clone()),
                    })],
                    None => Vec::new(),
                })
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Consensus double with an externally driven term counter and an
/// optional one-shot truncate target.
pub struct ScriptedConsensus {
    pub term: AtomicI64,
    pub truncate_target: Mutex<Option<BlockId>>,
}

impl ScriptedConsensus {
    pub fn new(term: i64) -> Arc<Self> {
        Arc::new(ScriptedConsensus {
            term: AtomicI64::new(term),
            truncate_target: Mutex::new(None),
        })
    }

    pub fn set_term(&self, term: i64) {
        self.term.store(term, Ordering::SeqCst);
    }

    pub fn set_truncate_target(&self, target: BlockId) {
        *self.truncate_target.lock() = Some(target);
    }
}

impl Consensus for ScriptedConsensus {
    fn compete_master(&self, _height: i64) -> Result<(bool, bool), MinerError> {
        Ok((true, false))
    }

    fn process_before_miner(&self, _now_ns: i64) -> Result<(Option<BlockId>, Vec<u8>), MinerError> {
        let storage = ConsensusStorage {
            cur_term: self.term.load(Ordering::SeqCst),
            ..Default::default()
        };
        let ext = serde_json::to_vec(&storage).expect("consensus storage serializes");
        Ok((self.truncate_target.lock().take(), ext))
    }

    fn calculate_block(&self, block: &mut Block) -> Result<(), MinerError> {
        block.block_id = block.content_hash();
        Ok(())
    }

    fn process_confirm_block(&self, _block: &Block) -> Result<(), MinerError> {
        Ok(())
    }

    fn check_miner_match(&self, _block: &Block) -> Result<bool, MinerError> {
        Ok(true)
    }

    fn status(&self) -> Result<ConsensusStatus, MinerError> {
        Ok(ConsensusStatus {
            current_term: self.term.load(Ordering::SeqCst),
        })
    }
}

pub struct Fixture {
    pub miner: Arc<Miner>,
    pub ctx: Arc<ChainContext>,
    pub ledger: Arc<SledLedger>,
    pub state: Arc<UtxoState>,
    pub network: Arc<StubNetwork>,
    pub address: String,
    _tmp: tempfile::TempDir,
}

fn build(consensus: Arc<dyn Consensus>, keypair: NodeKeypair) -> Fixture {
    build_with_queue_cap(consensus, keypair, 16)
}

fn build_with_queue_cap(
    consensus: Arc<dyn Consensus>,
    keypair: NodeKeypair,
    max_block_queue_size: i64,
) -> Fixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = sled::open(tmp.path().join("chain")).expect("sled open");
    let ledger = SledLedger::open(&db).expect("ledger open");
    let state = UtxoState::new(Arc::clone(&ledger), MAX_BLOCK_SIZE).expect("state replay");
    let network = Arc::new(StubNetwork::default());
    let address = keypair.address.clone();

    let ctx = Arc::new(ChainContext {
        chain_name: "dpos".to_string(),
        keypair,
        ledger: Arc::clone(&ledger) as Arc<dyn Ledger>,
        state: Arc::clone(&state) as Arc<dyn dpos_node::state::State>,
        consensus,
        network: Arc::clone(&network) as Arc<dyn Network>,
        options: EngineOptions {
            max_block_queue_size,
            broadcast_mode: BroadcastMode::Full,
        },
    });

    Fixture {
        miner: Miner::new(Arc::clone(&ctx)),
        ctx,
        ledger,
        state,
        network,
        address,
        _tmp: tmp,
    }
}

/// Solo producer: this node is the only validator.
pub fn solo_node() -> Fixture {
    let keypair = NodeKeypair::generate();
    let consensus = Arc::new(TdposEngine::new(keypair.address.clone(), vec![], 100, false));
    build(consensus, keypair)
}

/// Node driven by a scripted consensus engine.
pub fn scripted_node(consensus: Arc<ScriptedConsensus>) -> Fixture {
    build(consensus, NodeKeypair::generate())
}

/// Follower that accepts blocks produced by `producer_address`.
pub fn follower_node(producer_address: &str) -> Fixture {
    follower_node_with_queue_cap(producer_address, 16)
}

/// Follower with an explicit ingress admission cap.
pub fn follower_node_with_queue_cap(producer_address: &str, max_block_queue_size: i64) -> Fixture {
    let keypair = NodeKeypair::generate();
    let consensus = Arc::new(TdposEngine::new(
        keypair.address.clone(),
        vec![producer_address.to_string()],
        100,
        true,
    ));
    build_with_queue_cap(consensus, keypair, max_block_queue_size)
}

/// Mine one block and return it.
pub async fn mine_block(fixture: &Fixture) -> Block {
    fixture.miner.mine_once(false).await.expect("mine");
    let meta = fixture.ledger.meta();
    fixture
        .ledger
        .query_block_header(&meta.tip_block_id)
        .expect("tip block")
}
