use tokio_tungstenite::tungstenite;

/// Errors surfaced at the relay boundary (HTTP and control channel).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("relay is unavailable")]
    Unavailable,

    #[error("not authorized")]
    Unauthorized,

    #[error("relay returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Unavailable
        } else if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            Self::Unauthorized
        } else {
            Self::Other(err.into())
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Io(io_err)
                if matches!(
                    io_err.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                Self::Unavailable
            }
            tungstenite::Error::Http(resp)
                if resp.status() == tungstenite::http::StatusCode::UNAUTHORIZED =>
            {
                Self::Unauthorized
            }
            _ => Self::Other(err.into()),
        }
    }

    /// Failures that may clear up on their own (relay down or restarting).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Local override validation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("hue must be within 0..=359, got {0}")]
    InvalidHue(u16),
}
