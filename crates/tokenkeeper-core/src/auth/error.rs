use thiserror::Error;

/// Outcome of a failed refresh exchange.
///
/// Cloneable so every caller attached to one in-flight exchange receives
/// the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The server rejected the refresh token (expired or revoked). Ends the session.
    #[error("Refresh denied: {0}")]
    Denied(String),

    /// Transient failure reaching the server. The session survives.
    #[error("Network failure during refresh: {0}")]
    Network(String),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Refresh token denied by server: {0}")]
    RefreshDenied(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Token subjects differ: access={access_subject}, refresh={refresh_subject}")]
    IntegrityMismatch {
        access_subject: String,
        refresh_subject: String,
    },

    #[error("Remote revocation failed: {0}")]
    RevocationFailed(String),

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<RefreshError> for AuthError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Denied(msg) => AuthError::RefreshDenied(msg),
            RefreshError::Network(msg) => AuthError::NetworkFailure(msg),
        }
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        AuthError::Storage(format!("{:#}", err))
    }
}
