//! Cookie bundle model and the persistence/encryption seams.
//!
//! Cookies are security-sensitive: the bundle is serialized, encrypted via
//! the external [`CredentialCipher`], and only then handed to the
//! [`SessionStore`]. Plaintext cookies never cross the store boundary.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::proxy::ProxyLineage;

/// One platform cookie as captured or supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Unix epoch seconds
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

/// The set of cookies scoped to the platform domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieBundle {
    pub cookies: Vec<StoredCookie>,
}

impl CookieBundle {
    pub fn new(cookies: Vec<StoredCookie>) -> Self {
        Self { cookies }
    }

    pub fn get(&self, name: &str) -> Option<&StoredCookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Fill in defaults for manually pasted cookies: platform domain,
    /// root path, expiry roughly a year out.
    pub fn normalize(&mut self, platform_domain: &str) {
        let default_expiry = (Utc::now() + Duration::days(365)).timestamp() as f64;

        for cookie in &mut self.cookies {
            if cookie.domain.as_deref().map_or(true, str::is_empty) {
                cookie.domain = Some(format!(".www.{}", platform_domain));
            }
            if cookie.path.as_deref().map_or(true, str::is_empty) {
                cookie.path = Some("/".to_string());
            }
            if cookie.expires.is_none() {
                cookie.expires = Some(default_expiry);
            }
        }
    }
}

/// How a stored bundle was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Captured by the login state machine
    Login,
    /// Captured after a two-factor challenge
    TwoFactor,
    /// Pasted by the user, accepted on structural checks alone
    Manual,
    /// Refreshed by the proxy-routed validator
    Validated,
}

/// The persisted record for one workspace, cookie bundle encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub workspace_id: String,
    pub user_id: String,
    pub encrypted_cookies: String,
    pub captured_at: DateTime<Utc>,
    pub display_name: String,
    pub is_active: bool,
    pub error_count: u32,
    pub last_error_at: Option<DateTime<Utc>>,
    pub provenance: Provenance,
    pub proxy_lineage: Option<ProxyLineage>,
}

impl SessionRecord {
    pub fn new(
        workspace_id: &str,
        user_id: &str,
        encrypted_cookies: String,
        display_name: String,
        provenance: Provenance,
        proxy_lineage: Option<ProxyLineage>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            encrypted_cookies,
            captured_at: Utc::now(),
            display_name,
            is_active: true,
            error_count: 0,
            last_error_at: None,
            provenance,
            proxy_lineage,
        }
    }
}

/// External keyed store for session records. Implementations must support
/// soft-deletion (`deactivate`) and the operational error counter.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert(&self, record: SessionRecord) -> Result<()>;

    async fn get(&self, workspace_id: &str) -> Result<Option<SessionRecord>>;

    /// Soft-delete: flips `is_active` off, keeps the record.
    async fn deactivate(&self, workspace_id: &str) -> Result<()>;

    /// Bump the error counter and stamp `last_error_at`.
    async fn record_error(&self, workspace_id: &str, message: &str) -> Result<()>;
}

/// External encryption service applied to the serialized bundle.
#[async_trait]
pub trait CredentialCipher: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<String>;
    async fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Serialize and encrypt a bundle for persistence.
pub async fn seal_bundle(cipher: &dyn CredentialCipher, bundle: &CookieBundle) -> Result<String> {
    let plaintext = serde_json::to_string(bundle)?;
    cipher.encrypt(&plaintext).await
}

/// Decrypt and deserialize a persisted bundle.
pub async fn unseal_bundle(
    cipher: &dyn CredentialCipher,
    ciphertext: &str,
) -> Result<CookieBundle> {
    let plaintext = cipher.decrypt(ciphertext).await?;
    serde_json::from_str(&plaintext).map_err(EngineError::from)
}
