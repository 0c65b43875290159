use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid compressed point")]
    InvalidPoint,
    #[error("small-order point")]
    SmallOrderPoint,
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("wallet RPC timeout for {0}")]
    Timeout(&'static str),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, WalletError>;
