use crate::block::{Block, LedgerMeta};
use crate::types::BlockId;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum NetworkMessage {
    /// Ask neighbours for their chain status.
    GetChainStatus,
    /// Ask neighbours whether `block_id` is their trunk tip.
    ConfirmChainStatus { block_id: BlockId },
    /// Fetch a block by id.
    GetBlock { block_id: BlockId, need_content: bool },
    /// Push a full block (full broadcast mode).
    SendBlock(Block),
    /// Announce a block id only (interactive broadcast mode).
    NewBlockId(BlockId),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum NetworkResponse {
    ChainStatus(ChainStatus),
    TipStatus(TipStatus),
    BlockInfo(BlockInfo),
    /// A reply that could not be decoded. Still counted when sizing a
    /// response set.
    Invalid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChainStatus {
    pub ledger_meta: LedgerMeta,
    pub tip_block: Block,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TipStatus {
    pub is_trunk_tip: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BlockInfo {
    pub block: Option<Block>,
}
