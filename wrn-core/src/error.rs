use thiserror::Error;

#[derive(Error, Debug)]
pub enum WrenError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not the channel leader (leader hint: {0})")]
    NotChannelLeader(u64),

    #[error("not the user leader (leader hint: {0})")]
    NotUserLeader(u64),

    #[error("proposal dropped")]
    ProposalDropped,

    #[error("log compacted below requested index {0}")]
    LogCompacted(u64),

    #[error("replication group is read-only: {0}")]
    GroupReadOnly(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("connection not found: uid={uid} conn_id={conn_id}")]
    ConnNotFound { uid: String, conn_id: u64 },

    #[error("node {0} unreachable")]
    NodeUnreachable(u64),

    #[error("request timed out: {0}")]
    Timeout(&'static str),

    #[error("channel disconnected: {0}")]
    ChannelDisconnected(&'static str),

    #[error("queue over capacity: {0}")]
    QueueFull(&'static str),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WrenError>;
