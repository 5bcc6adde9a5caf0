use thiserror::Error;

/// Failure of a single client command. Never fatal to the connection or to
/// shared state; the originator receives an `error` event and nothing is broadcast.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("not allowed to {0}")]
    Forbidden(&'static str),

    #[error("storage failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl GatewayError {
    /// Message safe to show the client. Storage details stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            Self::Store(_) => "internal error, please retry".to_string(),
            other => other.to_string(),
        }
    }
}
