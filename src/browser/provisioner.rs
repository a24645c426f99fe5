//! Browser context provisioning.
//!
//! Launches Chrome with the anti-detection flag set, optionally routed
//! through a leased proxy, resolves the executable through an ordered
//! candidate chain, authenticates the proxy via the CDP Fetch domain, and
//! applies the identity fingerprint before the first navigation.

use std::path::PathBuf;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EventAuthRequired, EventRequestPaused,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use super::stealth;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::fingerprint::FingerprintProfile;
use crate::proxy::{format_username, ProxyLease};

/// A launched browser with its event-handler task and opened page.
pub struct ProvisionedBrowser {
    browser: Browser,
    handler_task: JoinHandle<()>,
    auth_task: Option<JoinHandle<()>>,
    page: Page,
}

impl ProvisionedBrowser {
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Tear the browser down. Safe to call exactly once; the session owner
    /// wraps this in an Option so repeated cleanup is a no-op.
    pub async fn close(mut self) {
        if let Some(task) = self.auth_task.take() {
            task.abort();
        }
        if let Err(e) = self.browser.close().await {
            tracing::debug!("browser close: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

/// Resolve the browser executable: configured path, then a `which` lookup,
/// then the configured known-good fallbacks. `None` lets chromiumoxide use
/// its own cached binary.
pub fn resolve_executable(config: &Config) -> Option<PathBuf> {
    if let Some(path) = config.browser_executable() {
        if path.is_file() {
            return Some(path);
        }
        tracing::warn!(path = %path.display(), "configured browser path is not executable");
    }

    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    for candidate in &config.browser.fallback_paths {
        let path = PathBuf::from(shellexpand::tilde(candidate).to_string());
        if path.is_file() {
            return Some(path);
        }
    }

    None
}

/// Launch a browser, open one page, authenticate the proxy if credentials
/// were supplied, and apply the fingerprint. Any failure here is fatal for
/// the login attempt.
pub async fn provision(
    config: &Config,
    profile: &FingerprintProfile,
    lease: Option<&ProxyLease>,
) -> Result<ProvisionedBrowser> {
    let mut args = stealth::anti_detection_args(
        config.browser.window_width,
        config.browser.window_height,
    );
    if let Some(lease) = lease {
        args.push(format!("--proxy-server={}", lease.server_arg()));
    }

    let mut builder = BrowserConfig::builder().args(args);
    if !config.browser.headless {
        builder = builder.with_head();
    }
    if let Some(executable) = resolve_executable(config) {
        tracing::debug!(path = %executable.display(), "using browser executable");
        builder = builder.chrome_executable(executable);
    }

    let browser_config = builder.build().map_err(EngineError::LaunchFailure)?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .map_err(|e| EngineError::LaunchFailure(e.to_string()))?;

    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });

    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| EngineError::LaunchFailure(format!("opening page: {}", e)))?;

    let auth_task = match lease {
        Some(lease) => Some(enable_proxy_auth(&page, lease).await?),
        None => None,
    };

    stealth::apply_fingerprint(&page, profile).await?;

    tracing::info!(
        proxied = lease.is_some(),
        "browser context provisioned"
    );

    Ok(ProvisionedBrowser {
        browser,
        handler_task,
        auth_task,
        page,
    })
}

/// Answer proxy auth challenges over the CDP Fetch domain. With auth
/// handling enabled every request pauses at the Request stage and must be
/// continued, so both event streams are serviced by one task.
async fn enable_proxy_auth(page: &Page, lease: &ProxyLease) -> Result<JoinHandle<()>> {
    let username = format_username(&lease.endpoint);
    let password = lease.endpoint.password.clone();

    let mut auth_events = page
        .event_listener::<EventAuthRequired>()
        .await
        .map_err(|e| EngineError::LaunchFailure(format!("auth listener: {}", e)))?;
    let mut paused_events = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| EngineError::LaunchFailure(format!("pause listener: {}", e)))?;

    page.execute(fetch::EnableParams {
        patterns: None,
        handle_auth_requests: Some(true),
    })
    .await
    .map_err(|e| EngineError::LaunchFailure(format!("fetch enable: {}", e)))?;

    let auth_page = page.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = auth_events.next() => {
                    let response = AuthChallengeResponse::builder()
                        .response(AuthChallengeResponseResponse::ProvideCredentials)
                        .username(username.clone())
                        .password(password.clone())
                        .build();
                    let Ok(response) = response else { continue };
                    let params = ContinueWithAuthParams::builder()
                        .request_id(event.request_id.clone())
                        .auth_challenge_response(response)
                        .build();
                    if let Ok(params) = params {
                        if let Err(e) = auth_page.execute(params).await {
                            tracing::debug!("continueWithAuth: {}", e);
                        }
                    }
                }
                Some(event) = paused_events.next() => {
                    let params = ContinueRequestParams::builder()
                        .request_id(event.request_id.clone())
                        .build();
                    if let Ok(params) = params {
                        let _ = auth_page.execute(params).await;
                    }
                }
                else => break,
            }
        }
    });

    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrowserConfig as BrowserSection;

    #[test]
    fn configured_path_must_exist_to_win() {
        let config = Config {
            browser: BrowserSection {
                executable: Some("/nonexistent/chrome-binary".to_string()),
                fallback_paths: vec![],
                ..BrowserSection::default()
            },
            ..Config::default()
        };

        // A missing configured path falls through instead of being trusted
        let resolved = resolve_executable(&config);
        if let Some(path) = resolved {
            assert_ne!(path, PathBuf::from("/nonexistent/chrome-binary"));
        }
    }

    #[test]
    fn missing_fallbacks_resolve_to_none_or_system_binary() {
        let config = Config {
            browser: BrowserSection {
                executable: None,
                fallback_paths: vec!["/nonexistent/a".to_string(), "/nonexistent/b".to_string()],
                ..BrowserSection::default()
            },
            ..Config::default()
        };

        // Either a real system chrome or None; never a nonexistent path
        if let Some(path) = resolve_executable(&config) {
            assert!(path.is_file());
        }
    }
}
