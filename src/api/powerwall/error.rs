use thiserror::Error as ThisError;

/// Failure classification for gateway calls.
///
/// A transport failure means the connection itself is broken and further
/// calls within the same pass are pointless. An application failure means the
/// gateway answered, but the response could not be used; it is isolated to
/// the call that produced it.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("failed to reach the gateway: {0:#}")]
    Transport(anyhow::Error),

    #[error("unusable gateway response: {0:#}")]
    Application(anyhow::Error),
}

impl Error {
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() || error.is_request() {
            Self::Transport(error.into())
        } else {
            Self::Application(error.into())
        }
    }
}
