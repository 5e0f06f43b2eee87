use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write stalled for {0:?}")]
    WriteStalled(std::time::Duration),

    #[error("Connection closed")]
    Closed,
}
