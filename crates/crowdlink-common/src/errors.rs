use std::path::PathBuf;

/// Transport-level failures.
///
/// The session layer treats most of these as "log and continue": sends
/// are fire-and-forget and teardown is best-effort, so callers only see
/// an error where a session genuinely could not be established.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("channel closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),

    #[error("not subscribed to topic: {0}")]
    NotSubscribed(String),
}

/// Identity persistence failures. Never fatal: the identity store falls
/// back to an in-memory id when the storage medium is unavailable.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no data directory available")]
    NoDataDir,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
