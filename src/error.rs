use revm::primitives::{Address, B256};
use thiserror::Error;

/// Errors surfaced by [`crate::chain::BlockchainReader`] implementations.
#[derive(Debug, Clone, Error)]
pub enum ReaderError {
    #[error("not found")]
    NotFound,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("reader closed")]
    Closed,
}

/// Errors recorded by state implementations while serving the EVM.
///
/// The EVM-facing state interface is infallible, so provider failures are
/// parked in a `last_error` slot and checked by the runner after each
/// transaction.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("state provider error: {0}")]
    Provider(#[from] ReaderError),
    #[error("unknown code hash {0}")]
    UnknownCodeHash(B256),
}

/// Transaction admission failures reported by the runner before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,
    #[error("insufficient funds for transfer")]
    InsufficientFundsForTransfer,
    #[error("intrinsic gas too low")]
    IntrinsicGas,
    #[error("nonce mismatch: tx {tx}, state {state}")]
    Nonce { tx: u64, state: u64 },
    #[error("invalid transaction: {0}")]
    Other(String),
}

impl AdmissionError {
    /// The subset of admission errors the attack search silently skips a
    /// candidate on (prerequisite replays legitimately run out of funds or
    /// gas when the window is sliced).
    pub fn is_whitelisted(&self) -> bool {
        matches!(
            self,
            AdmissionError::InsufficientFunds
                | AdmissionError::InsufficientFundsForTransfer
                | AdmissionError::IntrinsicGas
        )
    }
}

/// Errors returned by the transaction runner.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("invalid block header: {0}")]
    Header(String),
    #[error("pseudo transaction failed: {0}")]
    Pseudo(String),
    /// An internal invariant violation captured at the replay boundary.
    #[error("TxExecutionError: {msg}")]
    TxExecution { msg: String, stack: String },
}

impl EngineError {
    pub fn is_whitelisted(&self) -> bool {
        matches!(self, EngineError::Admission(e) if e.is_whitelisted())
    }
}

/// Errors from the attack search / analysis pipeline.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("transaction {0} not found in history session")]
    TxNotInSession(B256),
    #[error("block {0} out of session range")]
    BlockOutOfRange(u64),
    #[error("contract verification failed for {0}")]
    Verification(Address),
    #[error("search cancelled")]
    Cancelled,
}
