use thiserror::Error;

pub type Result<T> = std::result::Result<T, RosterError>;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unresolved identity: {0}")]
    UnresolvedIdentity(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
