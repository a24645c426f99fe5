use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Browser launch failed: {0}")]
    LaunchFailure(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Login rejected: {0}")]
    Auth(String),

    #[error("Login succeeded but the essential auth cookie is missing")]
    SessionCookieMissing,

    #[error("Session expired: the platform redirected to {0}")]
    SessionExpired(String),

    #[error("Verification code was not accepted")]
    TwoFactorInvalid,

    #[error("No active login session for workspace {0}")]
    NoActiveSession(String),

    #[error("Login attempt exceeded the {0}s session cap")]
    Timeout(u64),

    #[error("Login cancelled")]
    Cancelled,

    #[error("Cookie validation failed: {0}")]
    InvalidCookies(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Encryption error: {0}")]
    Cipher(String),

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether this error belongs to the network/proxy class that is allowed
    /// to trigger the single proxy-to-direct navigation fallback. Navigation
    /// timeouts arrive as `Network("...timed out")`; the session-cap
    /// `Timeout` must never restart a navigation.
    pub fn is_network_class(&self) -> bool {
        match self {
            Self::Network(msg) | Self::Cdp(msg) => is_network_failure_message(msg),
            _ => false,
        }
    }
}

/// Substring classification of browser/network failure strings. Chrome
/// surfaces these as `net::ERR_*` codes; raw socket errors appear when the
/// proxy tunnel collapses mid-handshake.
pub fn is_network_failure_message(msg: &str) -> bool {
    const MARKERS: &[&str] = &[
        "net::ERR_",
        "ERR_TUNNEL_CONNECTION_FAILED",
        "ERR_PROXY_CONNECTION_FAILED",
        "ERR_CONNECTION_RESET",
        "ERR_CONNECTION_REFUSED",
        "ERR_TIMED_OUT",
        "ERR_EMPTY_RESPONSE",
        "ECONNRESET",
        "ECONNREFUSED",
        "socket hang up",
        "tunnel",
        "proxy",
        "timed out",
        "timeout",
    ];

    let lowered = msg.to_lowercase();
    MARKERS.iter().any(|m| lowered.contains(&m.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_chrome_net_errors_as_network() {
        assert!(is_network_failure_message(
            "net::ERR_TUNNEL_CONNECTION_FAILED at https://example.com/login"
        ));
        assert!(is_network_failure_message("ECONNRESET"));
        assert!(is_network_failure_message("navigation timed out after 30s"));
    }

    #[test]
    fn does_not_classify_auth_failures_as_network() {
        assert!(!is_network_failure_message("wrong password"));
        assert!(!EngineError::Auth("invalid credentials".into()).is_network_class());
    }

    #[test]
    fn session_cap_timeout_is_not_network_class() {
        assert!(!EngineError::Timeout(300).is_network_class());
        assert!(EngineError::Network("navigation to x timed out".into()).is_network_class());
    }
}
