use thiserror::Error;

/// Errors surfaced by the circuit-broken node client.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The breaker is open or the client is disconnected. Surfaced
    /// immediately, without touching the node.
    #[error("upstream node unavailable")]
    Unavailable,

    /// The node reports the requested object is absent from its blockstore.
    #[error("block not found")]
    NotFound,

    /// A JSON-RPC error other than not-found.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("network: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Classifies a JSON-RPC error object from the node. Lotus-style nodes
    /// report a missing block as a plain error whose message names the
    /// blockstore miss, so the match is on the message.
    #[must_use]
    pub fn from_rpc(code: i64, message: String) -> Self {
        if message.contains("not found") {
            Self::NotFound
        } else {
            Self::Rpc { code, message }
        }
    }

    /// Whether the error should count against the breaker's consecutive
    /// failure threshold. A not-found answer is a completed round trip, not
    /// a node failure, so it never contributes to tripping the circuit.
    #[must_use]
    pub fn counts_as_breaker_failure(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}
