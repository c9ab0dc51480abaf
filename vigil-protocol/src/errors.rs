use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid UTF-8 in message: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("line exceeds maximum size of {limit} bytes")]
    LineTooLong { limit: usize },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to agent: {0}")]
    Connect(#[source] std::io::Error),

    #[error("failed to send {command}: {source}")]
    Send {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to receive response: {0}")]
    Receive(#[source] std::io::Error),

    #[error("agent closed the connection")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
