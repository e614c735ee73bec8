//! P2P transport contract.
//!
//! The miner only needs two primitives: fire-and-forget broadcast and
//! scatter/gather request-response. The wire schema lives in
//! `message`; transports implement `Network`.

pub mod message;

use crate::error::MinerError;
use async_trait::async_trait;
use message::{NetworkMessage, NetworkResponse};

#[async_trait]
pub trait Network: Send + Sync {
    /// Broadcast to all peers, best effort.
    async fn send_message(&self, msg: NetworkMessage) -> Result<(), MinerError>;

    /// Scatter to neighbours and gather their responses.
    async fn send_message_with_response(
        &self,
        msg: NetworkMessage,
    ) -> Result<Vec<NetworkResponse>, MinerError>;
}

/// Peerless transport for solo operation: broadcasts vanish and
/// queries come back empty.
pub struct NullNetwork;

#[async_trait]
impl Network for NullNetwork {
    async fn send_message(&self, _msg: NetworkMessage) -> Result<(), MinerError> {
        Ok(())
    }

    async fn send_message_with_response(
        &self,
        _msg: NetworkMessage,
    ) -> Result<Vec<NetworkResponse>, MinerError> {
        Ok(Vec::new())
    }
}
