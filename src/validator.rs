//! Session cookie validation.
//!
//! Two deliberately different entry points. The trust-store path accepts a
//! pasted cookie set on structural checks alone and never touches the
//! network: replaying a user's live cookies through a different egress IP
//! can make the platform invalidate that session everywhere. The
//! proxy-routed path does the opposite: it leases a proxy, injects the
//! cookies into a real browser, and requires positive DOM evidence of an
//! authenticated session, failing closed on anything ambiguous.

use chromiumoxide::cdp::browser_protocol::network::{CookieParam, TimeSinceEpoch};
use chromiumoxide::Page;

use crate::browser::provisioner::provision;
use crate::classifier::PageState;
use crate::engine::SessionEngine;
use crate::error::{EngineError, Result};
use crate::fingerprint;
use crate::proxy::ProxyLease;
use crate::store::{seal_bundle, CookieBundle, Provenance, SessionRecord, StoredCookie};

/// Outcome of a successful validation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub message: String,
    pub display_name: Option<String>,
    pub warnings: Vec<String>,
    /// The platform presented a checkpoint; the cookies may be fine but
    /// the session needs interactive verification.
    pub needs_verification: bool,
}

/// DOM markers that positively confirm an authenticated session.
const AUTH_MARKER_JS: &str = r#"
    !!document.querySelector(
        '.global-nav__me-photo, .feed-identity-module, [data-control-name="nav.settings"]'
    )
"#;

impl SessionEngine {
    /// Accept a caller-supplied cookie set without network validation.
    /// Structural checks only; normalizes, encrypts and persists with
    /// provenance `manual`.
    pub async fn connect_with_cookies(
        &self,
        workspace_id: &str,
        user_id: &str,
        cookies: Vec<StoredCookie>,
    ) -> Result<ValidationReport> {
        let platform = &self.config.platform;
        let mut bundle = CookieBundle::new(cookies);

        if !bundle.contains(&platform.essential_cookie) {
            return Err(EngineError::InvalidCookies(format!(
                "missing essential cookie '{}'",
                platform.essential_cookie
            )));
        }

        let mut warnings = Vec::new();
        if !bundle.contains(&platform.secondary_cookie) {
            tracing::warn!(
                workspace = %workspace_id,
                cookie = %platform.secondary_cookie,
                "secondary session cookie missing"
            );
            warnings.push(format!(
                "secondary cookie '{}' missing; some platform features may re-prompt",
                platform.secondary_cookie
            ));
        }

        let mut message = "cookies accepted".to_string();
        if bundle.len() < platform.min_cookie_count {
            let note = format!(
                "only {} cookies supplied (expected at least {})",
                bundle.len(),
                platform.min_cookie_count
            );
            message = format!("{}; {}", message, note);
            warnings.push(note);
        }

        bundle.normalize(&platform.domain);

        let sealed = seal_bundle(self.cipher.as_ref(), &bundle).await?;
        let record = SessionRecord::new(
            workspace_id,
            user_id,
            sealed,
            platform.display_name_placeholder.clone(),
            Provenance::Manual,
            None,
        );
        self.store.upsert(record).await?;

        tracing::info!(workspace = %workspace_id, cookies = bundle.len(), "cookies stored from trust-store path");

        Ok(ValidationReport {
            message,
            display_name: None,
            warnings,
            needs_verification: false,
        })
    }

    /// Validate a cookie set by replaying it through a leased proxy and a
    /// real browser. Fails closed: absent markers or a DOM evaluation
    /// failure both report invalid cookies.
    pub async fn validate_through_proxy(
        &self,
        workspace_id: &str,
        user_id: &str,
        cookies: Vec<StoredCookie>,
    ) -> Result<ValidationReport> {
        let profile = fingerprint::generate(user_id);

        let lease = match self.allocator.acquire(user_id, workspace_id).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(workspace = %workspace_id, "proxy acquire failed: {}", e);
                None
            }
        };

        let browser = match provision(&self.config, &profile, lease.as_ref()).await {
            Ok(browser) => browser,
            Err(e) => {
                if lease.is_some() {
                    self.allocator.release(user_id, workspace_id).await;
                }
                return Err(e);
            }
        };

        let result = self
            .run_proxied_validation(browser.page(), workspace_id, user_id, cookies, lease.as_ref())
            .await;

        // Unlike login success, the validator returns its lease on every
        // exit path; the stored lineage alone preserves network identity.
        browser.close().await;
        if lease.is_some() {
            self.allocator.release(user_id, workspace_id).await;
        }

        if let Err(e) = &result {
            let _ = self.store.record_error(workspace_id, &e.to_string()).await;
        }

        result
    }

    async fn run_proxied_validation(
        &self,
        page: &Page,
        workspace_id: &str,
        user_id: &str,
        cookies: Vec<StoredCookie>,
        lease: Option<&ProxyLease>,
    ) -> Result<ValidationReport> {
        let platform = &self.config.platform;

        let mut bundle = CookieBundle::new(cookies);
        if !bundle.contains(&platform.essential_cookie) {
            return Err(EngineError::InvalidCookies(format!(
                "missing essential cookie '{}'",
                platform.essential_cookie
            )));
        }
        bundle.normalize(&platform.domain);

        let params = bundle
            .cookies
            .iter()
            .map(cookie_param)
            .collect::<Result<Vec<_>>>()?;
        page.set_cookies(params)
            .await
            .map_err(|e| EngineError::Cdp(format!("injecting cookies: {}", e)))?;

        let feed_url = platform.feed_url.clone();
        let nav = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.timeouts.navigation_secs),
            page.goto(feed_url.as_str()),
        )
        .await;
        match nav {
            Err(_) => return Err(EngineError::Network("validation navigation timed out".into())),
            Ok(Err(e)) => return Err(EngineError::Network(e.to_string())),
            Ok(Ok(_)) => {}
        }

        let (url, dom) = self.observe_page(page).await?;
        match self.classifier.classify(&url, &dom) {
            // Redirected to the guest surface: the session is gone. No DOM
            // evaluation happens on this branch.
            PageState::Authwall | PageState::LoginForm => {
                let _ = self.store.deactivate(workspace_id).await;
                return Err(EngineError::SessionExpired(url));
            }
            PageState::Checkpoint => {
                return Ok(ValidationReport {
                    message: "session needs verification before it can be used".to_string(),
                    display_name: None,
                    warnings: Vec::new(),
                    needs_verification: true,
                });
            }
            PageState::NavigationFailure => {
                return Err(EngineError::Network(format!("navigation failed at {}", url)));
            }
            PageState::LoggedIn => {}
        }

        // URL looks authenticated; require positive DOM evidence. A
        // mid-check navigation makes the evaluate call fail, and that is
        // treated as invalid too - fail closed.
        let confirmed = match page.evaluate(AUTH_MARKER_JS).await {
            Ok(result) => result.into_value::<bool>().unwrap_or(false),
            Err(e) => {
                tracing::debug!("marker evaluation failed: {}", e);
                false
            }
        };
        if !confirmed {
            return Err(EngineError::InvalidCookies(
                "no authenticated-session markers present".to_string(),
            ));
        }

        let (display_name, refreshed) = self
            .capture_and_store(
                page,
                workspace_id,
                user_id,
                Provenance::Validated,
                lease.map(|l| l.lineage()),
            )
            .await?;

        Ok(ValidationReport {
            message: format!("session valid ({} cookies refreshed)", refreshed.len()),
            display_name: Some(display_name),
            warnings: Vec::new(),
            needs_verification: false,
        })
    }
}

fn cookie_param(cookie: &StoredCookie) -> Result<CookieParam> {
    let mut builder = CookieParam::builder()
        .name(&cookie.name)
        .value(&cookie.value)
        .secure(cookie.secure)
        .http_only(cookie.http_only);

    if let Some(domain) = &cookie.domain {
        builder = builder.domain(domain);
    }
    if let Some(path) = &cookie.path {
        builder = builder.path(path);
    }
    if let Some(expires) = cookie.expires {
        builder = builder.expires(TimeSinceEpoch::new(expires));
    }

    builder.build().map_err(EngineError::Cdp)
}
