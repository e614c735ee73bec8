use thiserror::Error;

#[derive(Error, Debug)]
pub enum MinerError {
    #[error("invalid parameter: {0}")]
    Parameter(&'static str),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("the genesis block is different")]
    GenesisBlockDiff,

    #[error("generate timer tx failed")]
    GenerateTimerTxFailed,

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("state error: {0}")]
    State(String),

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to open {name} database: {source}")]
    DatabaseOpen {
        name: String,
        #[source]
        source: sled::Error,
    },

    #[error("database operation failed: {0}")]
    DatabaseOp(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::DatabaseOp(e.to_string())
    }
}
