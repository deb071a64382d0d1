use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed head: {0}")]
    MalformedHead(&'static str),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("unknown transform: {0}")]
    UnknownTransform(String),
    #[error("incomplete record starting at byte {0}")]
    IncompleteRecord(u64),
    #[error("invalid partition: {0}")]
    InvalidPartition(String),
    #[error("insufficient future window for {0}")]
    InsufficientFutureWindow(String),
}

pub type Result<T> = std::result::Result<T, Error>;
