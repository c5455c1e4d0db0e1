use crate::crypto::CryptoError;

#[derive(Debug, Clone, thiserror::Error)]
#[derive(uniffi::Error)]
pub enum MediaSDKError {
    #[error("Precondition failed: {reason}")]
    PreconditionFailed { reason: String },

    #[error("Token missing")]
    TokenMissing,

    #[error("Error handling the request: {err_str}")]
    TransportError { err_str: String, status: Option<u16> },

    #[error("Error decrypting data: {err_str}")]
    DecryptionError { err_str: String },

    #[error("Blob cache error: {err_str}")]
    CacheError { err_str: String },

    #[error("Error converting file: {err_str}")]
    ConversionError { err_str: String },

    #[error("Invalid playlist: {err_str}")]
    PlaylistError { err_str: String },

    #[error("Error parsing JSON: {err_str} \nWith message: {err_msg}")]
    SerdeJsonError { err_msg: String, err_str: String },

    #[error("Invalid configuration: {err_str}")]
    ConfigError { err_str: String },

    #[error("IO Error: {err_str}")]
    IOError { err_str: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Stream ended")]
    StreamEnded,

    #[error("Unknown Error: {err_str}")]
    UnknownError { err_str: String },
}

impl MediaSDKError {
    pub(crate) fn not_initialized() -> Self {
        MediaSDKError::PreconditionFailed {
            reason: "Attempting to use an uninitialized download manager".to_string(),
        }
    }

    /// Only transient transport failures are worth another attempt. Network level errors carry
    /// no status, server side errors and rate limiting carry 5xx / 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            MediaSDKError::TransportError { status: None, .. } => true,
            MediaSDKError::TransportError { status: Some(status), .. } => {
                *status >= 500 || *status == 429
            }
            _ => false,
        }
    }
}

impl From<CryptoError> for MediaSDKError {
    fn from(err: CryptoError) -> Self {
        MediaSDKError::DecryptionError { err_str: err.to_string() }
    }
}

impl From<reqwest::Error> for MediaSDKError {
    fn from(err: reqwest::Error) -> Self {
        MediaSDKError::TransportError {
            err_str: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

impl From<std::io::Error> for MediaSDKError {
    fn from(err: std::io::Error) -> Self {
        MediaSDKError::IOError { err_str: err.to_string() }
    }
}

impl From<serde_json::Error> for MediaSDKError {
    fn from(err: serde_json::Error) -> Self {
        MediaSDKError::SerdeJsonError {
            err_msg: err.to_string(),
            err_str: "Failed to parse JSON".to_string(),
        }
    }
}

impl From<ron::Error> for MediaSDKError {
    fn from(err: ron::Error) -> Self {
        MediaSDKError::ConfigError { err_str: err.to_string() }
    }
}

impl From<ron::error::SpannedError> for MediaSDKError {
    fn from(err: ron::error::SpannedError) -> Self {
        MediaSDKError::ConfigError { err_str: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let network = MediaSDKError::TransportError { err_str: "reset".to_string(), status: None };
        let server = MediaSDKError::TransportError { err_str: "bad gateway".to_string(), status: Some(502) };
        let throttled = MediaSDKError::TransportError { err_str: "slow down".to_string(), status: Some(429) };
        let not_found = MediaSDKError::TransportError { err_str: "missing".to_string(), status: Some(404) };

        assert!(network.is_retryable());
        assert!(server.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!not_found.is_retryable());
        assert!(!MediaSDKError::TokenMissing.is_retryable());
        assert!(!MediaSDKError::not_initialized().is_retryable());
        assert!(!MediaSDKError::DecryptionError { err_str: "tag".to_string() }.is_retryable());
    }
}
