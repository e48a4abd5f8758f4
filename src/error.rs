use thiserror::Error;

pub type MvTreeResult<T, E = MvTreeError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum MvTreeError {
    #[error("Not support: {0}")]
    NotSupport(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Corrupted payload: {0}")]
    Corrupted(String),

    #[error("Transaction error: {0}")]
    Transaction(String),
}
