//! Shared chain context handed to the miner.
//!
//! The miner, consensus engine and stores reference each other only
//! through this struct, keeping the collaborators free of
//! back-pointers.

use crate::config::BroadcastMode;
use crate::consensus::Consensus;
use crate::error::MinerError;
use crate::ledger::Ledger;
use crate::network::Network;
use crate::state::State;
use crate::types::address_from_pubkey;
use ed25519_dalek::SigningKey;
use std::path::Path;
use std::sync::Arc;

pub struct NodeKeypair {
    pub address: String,
    pub signing_key: SigningKey,
}

impl NodeKeypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        NodeKeypair::from_signing_key(signing_key)
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_from_pubkey(&signing_key.verifying_key());
        NodeKeypair {
            address,
            signing_key,
        }
    }

    /// Load the node key from `path`, generating and persisting a new
    /// one on first run.
    pub fn load_or_create(path: &Path) -> Result<Self, MinerError> {
        if let Ok(content) = std::fs::read_to_string(path) {
            let bytes = hex::decode(content.trim())
                .map_err(|_| MinerError::Parameter("node key file is not hex"))?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| MinerError::Parameter("node key must be 32 bytes"))?;
            return Ok(NodeKeypair::from_signing_key(SigningKey::from_bytes(&bytes)));
        }

        let keypair = NodeKeypair::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MinerError::State(format!("create key dir: {e}")))?;
        }
        std::fs::write(path, hex::encode(keypair.signing_key.to_bytes()))
            .map_err(|e| MinerError::State(format!("write node key: {e}")))?;
        Ok(keypair)
    }
}

/// Engine-level knobs the miner consults at runtime.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub max_block_queue_size: i64,
    pub broadcast_mode: BroadcastMode,
}

pub struct ChainContext {
    pub chain_name: String,
    pub keypair: NodeKeypair,
    pub ledger: Arc<dyn Ledger>,
    pub state: Arc<dyn State>,
    pub consensus: Arc<dyn Consensus>,
    pub network: Arc<dyn Network>,
    pub options: EngineOptions,
}
