use thiserror::Error;

use crate::coins::AmountError;
use crate::db::DbError;
use crate::eth::EthError;
use crate::sender::SenderError;
use crate::types::Status;

/// Error taxonomy of the swap protocol.
///
/// Errors local to one swap never tear the process down; the state machine
/// maps each variant to a status-dependent reaction (abort before funds are
/// at risk, keep the swap ongoing afterwards so recovery can retry).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Bad input or a mismatch between a message/log and the agreed swap.
    /// Fatal to the operation, swap status unaffected.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A persistence write failed.
    #[error("storage failed: {0}")]
    StorageFailed(#[from] DbError),

    /// The external signer did not return a transaction hash in time.
    #[error("timed out waiting for transaction to be signed")]
    SignTimeout,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A submitted transaction reverted; `reason` is the simulated revert
    /// string.
    #[error("transaction reverted: {reason}")]
    TxReverted { reason: String },

    /// Cooperative shutdown; swap state is preserved.
    #[error("operation cancelled")]
    Cancelled,

    /// A state that must be unreachable was observed. Logged loudly; the
    /// swap is left ongoing for operator intervention.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("unexpected status {actual} (expected {expected})")]
    UnexpectedStatus { expected: Status, actual: Status },

    #[error(transparent)]
    Chain(EthError),

    #[error(transparent)]
    Wallet(#[from] xmr_wallet::WalletError),

    #[error(transparent)]
    Network(#[from] crate::net::NetError),
}

impl From<AmountError> for ProtocolError {
    fn from(err: AmountError) -> Self {
        ProtocolError::Validation(err.to_string())
    }
}

impl From<EthError> for ProtocolError {
    fn from(err: EthError) -> Self {
        match err {
            EthError::Reverted { reason } => ProtocolError::TxReverted { reason },
            other => ProtocolError::Chain(other),
        }
    }
}

impl From<SenderError> for ProtocolError {
    fn from(err: SenderError) -> Self {
        match err {
            SenderError::SignTimeout => ProtocolError::SignTimeout,
            SenderError::Unsupported(what) => ProtocolError::Unsupported(what),
            SenderError::TxReverted { reason } => ProtocolError::TxReverted { reason },
            SenderError::Chain(err) => err.into(),
        }
    }
}
