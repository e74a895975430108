use thiserror::Error;

/// Errors raised by the data plane. Codec errors terminate the connection,
/// everything else terminates at most one stream.
#[derive(Error, Debug)]
pub enum TrellisError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("deserialize error on request {request_id}: {msg}")]
    Deserialize { request_id: u32, msg: String },

    #[error("connection has closed")]
    ConnectionClosed,

    #[error("no route found")]
    NoRouteFound,

    #[error("no healthy upstream")]
    NoHealthyUpstream,

    #[error("upstream request timeout")]
    RequestTimeout,

    #[error("upstream overflow")]
    Overflow,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TrellisError {
    /// Whether the error corrupts codec state and must close the connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, TrellisError::Codec(_))
    }
}

impl From<String> for TrellisError {
    fn from(msg: String) -> Self {
        TrellisError::Other(msg)
    }
}

impl From<&str> for TrellisError {
    fn from(msg: &str) -> Self {
        TrellisError::Other(msg.to_owned())
    }
}
