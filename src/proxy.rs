//! Proxy lease model and provider credential conventions.
//!
//! The allocation service itself lives outside this crate; the engine only
//! consumes leases through the [`ProxyAllocator`] seam. What does live here
//! is the per-provider sticky-session username formatting, because getting
//! it wrong silently rotates the egress IP between login and validation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One leased upstream proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Provider tag, lowercase (e.g. "iproyal", "oxylabs")
    pub provider: String,
    /// Provider-assigned proxy id
    pub id: String,
    /// Sticky-session id binding repeated connections to one egress IP
    pub sticky_session_id: Option<String>,
}

/// An exclusively-owned allocation of a proxy to one login attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyLease {
    pub allocation_id: String,
    pub endpoint: ProxyEndpoint,
}

impl ProxyLease {
    /// The lineage persisted with a captured cookie bundle so later
    /// validation replays the same network identity.
    pub fn lineage(&self) -> ProxyLineage {
        ProxyLineage {
            allocation_id: self.allocation_id.clone(),
            proxy_id: self.endpoint.id.clone(),
            sticky_session_id: self.endpoint.sticky_session_id.clone(),
        }
    }

    /// `host:port` form for `--proxy-server`.
    pub fn server_arg(&self) -> String {
        format!("{}:{}", self.endpoint.host, self.endpoint.port)
    }
}

/// Proxy identity recorded at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyLineage {
    pub allocation_id: String,
    pub proxy_id: String,
    pub sticky_session_id: Option<String>,
}

/// External proxy-allocation service.
#[async_trait]
pub trait ProxyAllocator: Send + Sync {
    /// Best-effort lease. `Ok(None)` means no proxy available; the caller
    /// proceeds without one.
    async fn acquire(&self, user_id: &str, workspace_id: &str) -> Result<Option<ProxyLease>>;

    async fn release(&self, user_id: &str, workspace_id: &str);
}

/// Format the auth username per provider sticky-session convention.
/// Without a sticky-session id every provider passes through unchanged.
pub fn format_username(endpoint: &ProxyEndpoint) -> String {
    let Some(session) = endpoint.sticky_session_id.as_deref() else {
        return endpoint.username.clone();
    };

    match endpoint.provider.as_str() {
        // Comma-separated parameter list appended to the base username
        "dataimpulse" => format!("{},session_{}", endpoint.username, session),

        // Underscore-prefixed session segment
        "iproyal" => format!("{}_session-{}", endpoint.username, session),

        // Session id embedded mid-username; rewrite it in place if present,
        // append otherwise
        "oxylabs" => rewrite_sessid_segment(&endpoint.username, session),

        // Gateway port 7000 takes the full templated username; every other
        // port for this provider is passed through untouched
        "decodo" if endpoint.port == 7000 => format!(
            "user-{}-session-{}-sessionduration-30",
            endpoint.username, session
        ),

        _ => endpoint.username.clone(),
    }
}

fn rewrite_sessid_segment(username: &str, session: &str) -> String {
    if let Some(start) = username.find("-sessid-") {
        let tail_start = start + "-sessid-".len();
        let tail = &username[tail_start..];
        let rest = match tail.find('-') {
            Some(idx) => &tail[idx..],
            None => "",
        };
        format!("{}-sessid-{}{}", &username[..start], session, rest)
    } else {
        format!("{}-sessid-{}", username, session)
    }
}
