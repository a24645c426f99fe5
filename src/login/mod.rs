//! The login state machine.
//!
//! Drives a single login attempt: lease a proxy (best effort), provision a
//! stealth browser, navigate to the login page with a single proxy-to-direct
//! fallback, enter credentials like a human, then branch on where the
//! platform lands us: two-factor checkpoint, inline credential rejection,
//! or straight to cookie capture.

pub mod two_factor;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Element, Page};

use crate::browser::provisioner::provision;
use crate::classifier::{PageState, TwoFactorMethod};
use crate::engine::{CancelKind, LoginSession, LoginStatus, SessionEngine};
use crate::error::{EngineError, Result};
use crate::fingerprint;
use crate::humanize::{self, Curve, TypingStyle};
use crate::store::Provenance;

const USERNAME_SELECTORS: &[&str] = &[
    "#username",
    "input[name=\"session_key\"]",
    "input[autocomplete=\"username\"]",
];

const PASSWORD_SELECTORS: &[&str] = &[
    "#password",
    "input[name=\"session_password\"]",
    "input[type=\"password\"]",
];

const SUBMIT_SELECTORS: &[&str] = &["button[type=\"submit\"]", ".btn__primary--large"];

const INLINE_ERROR_SELECTORS: &[&str] = &[
    "#error-for-username",
    "#error-for-password",
    ".form__error",
    "[role=\"alert\"]",
];

/// Input to a login attempt.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub workspace_id: String,
    pub user_id: String,
    pub email: String,
    pub password: String,
}

/// How a login attempt resolved without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success { display_name: String },
    /// The session is suspended waiting for a verification code.
    TwoFactorRequired { method: TwoFactorMethod },
}

type StageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Run `attempt` once; if it fails with a network-class error while a proxy
/// was in use, run it exactly once more in direct mode. This is the only
/// retry in the engine, and the single place it is implemented.
pub(crate) async fn with_proxy_fallback<S, T>(
    state: &mut S,
    proxied: bool,
    mut attempt: impl for<'a> FnMut(&'a mut S, bool) -> StageFuture<'a, T>,
) -> Result<T> {
    match attempt(state, proxied).await {
        Ok(value) => Ok(value),
        Err(e) if proxied && e.is_network_class() => {
            tracing::warn!("proxied navigation failed ({}), retrying direct", e);
            attempt(state, false).await
        }
        Err(e) => Err(e),
    }
}

/// Navigate with a hard timeout; failures are network-class by message.
async fn navigate(page: &Page, url: &str, timeout_secs: u64) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(timeout_secs), page.goto(url))
        .await
        .map_err(|_| EngineError::Network(format!("navigation to {} timed out", url)))?
        .map_err(|e| EngineError::Network(e.to_string()))?;
    Ok(())
}

async fn humanized_fill(
    page: &Page,
    element: &Element,
    text: &str,
    from: humanize::Point,
) -> Result<()> {
    if let Ok(point) = element.clickable_point().await {
        let target = humanize::Point::new(point.x, point.y);
        humanize::move_mouse(page, from, target, 12, Curve::Bezier).await?;
    }
    element
        .click()
        .await
        .map_err(|e| EngineError::Cdp(e.to_string()))?;
    humanize::type_text(element, text, &TypingStyle::default()).await
}

/// Everything the navigation stage needs, borrowed for one attempt pair.
/// Carried as the combinator's state so each retry re-borrows it cleanly.
struct NavStage<'e> {
    engine: &'e SessionEngine,
    session: &'e LoginSession,
    profile: &'e crate::fingerprint::FingerprintProfile,
    res: &'e mut crate::engine::SessionResources,
    login_url: &'e str,
    nav_secs: u64,
    fallback_secs: u64,
    started_proxied: bool,
}

impl NavStage<'_> {
    async fn run(&mut self, use_proxy: bool) -> Result<()> {
        if self.started_proxied && !use_proxy {
            // The one recovery: rebuild the browser without the proxy,
            // refingerprint, navigate with more headroom.
            if let Some(browser) = self.res.browser.take() {
                browser.close().await;
            }
            if self.res.lease.take().is_some() {
                self.engine
                    .allocator
                    .release(&self.session.user_id, &self.session.workspace_id)
                    .await;
            }
            let rebuilt = provision(&self.engine.config, self.profile, None).await?;
            self.res.browser = Some(rebuilt);
            navigate(self.res.page()?, self.login_url, self.fallback_secs).await
        } else {
            navigate(self.res.page()?, self.login_url, self.nav_secs).await
        }
    }
}

async fn read_inline_error(page: &Page) -> Option<String> {
    for selector in INLINE_ERROR_SELECTORS {
        if let Ok(element) = page.find_element(*selector).await {
            if let Ok(Some(text)) = element.inner_text().await {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}

impl SessionEngine {
    /// Start a login attempt for a workspace. Returns `Success` once the
    /// cookie bundle is persisted, or `TwoFactorRequired` with the session
    /// left suspended for [`SessionEngine::submit_two_factor`].
    ///
    /// Any prior in-flight session for the workspace is fully torn down
    /// before this attempt proceeds.
    pub async fn start_login(&self, request: LoginRequest) -> Result<LoginOutcome> {
        if let Some(previous) = self.registry.remove(&request.workspace_id).await {
            tracing::info!(workspace = %request.workspace_id, "superseding in-flight session");
            previous.request_cancel(CancelKind::Superseded);
            self.teardown(&previous, true, false).await;
        }

        let epoch = self.registry.next_epoch();
        let session = Arc::new(LoginSession::new(
            &request.workspace_id,
            &request.user_id,
            epoch,
        ));

        let cap = self.config.timeouts.session_cap_secs;
        let outcome = tokio::select! {
            _ = session.cancel.cancelled() => Err(match session.cancel_kind() {
                Some(CancelKind::Timeout) => EngineError::Timeout(cap),
                _ => EngineError::Cancelled,
            }),
            result = self.drive_login(&session, &request) => result,
        };

        match &outcome {
            // Session stays registered and alive for the code submission
            Ok(LoginOutcome::TwoFactorRequired { .. }) => {}
            Ok(LoginOutcome::Success { .. }) => {
                if let Some(done) = self
                    .registry
                    .remove_if_epoch(&request.workspace_id, epoch)
                    .await
                {
                    // Lease deliberately kept: its lineage is now bound to
                    // the captured cookies.
                    self.teardown(&done, false, false).await;
                }
            }
            Err(e) => {
                session.set_status(LoginStatus::Error);
                if let Some(failed) = self
                    .registry
                    .remove_if_epoch(&request.workspace_id, epoch)
                    .await
                {
                    self.teardown(&failed, true, false).await;
                }
                let _ = self
                    .store
                    .record_error(&request.workspace_id, &e.to_string())
                    .await;
            }
        }

        outcome
    }

    async fn drive_login(
        &self,
        session: &Arc<LoginSession>,
        request: &LoginRequest,
    ) -> Result<LoginOutcome> {
        let profile = fingerprint::generate(&request.email);

        // Proxy lease is best effort; a missing proxy degrades, not fails.
        let lease = match self
            .allocator
            .acquire(&request.user_id, &request.workspace_id)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(workspace = %request.workspace_id, "proxy acquire failed: {}", e);
                None
            }
        };
        if lease.is_none() {
            tracing::warn!(workspace = %request.workspace_id, "no proxy available, connecting direct");
        }

        session.set_status(LoginStatus::LaunchingBrowser);
        let browser = match provision(&self.config, &profile, lease.as_ref()).await {
            Ok(browser) => browser,
            Err(e) => {
                if lease.is_some() {
                    self.allocator
                        .release(&request.user_id, &request.workspace_id)
                        .await;
                }
                return Err(e);
            }
        };

        {
            let mut res = session.resources.lock().await;
            res.browser = Some(browser);
            res.lease = lease;
        }

        // Registered from here on: cancel/timeout can reach the session.
        if let Some(displaced) = self
            .registry
            .upsert(&request.workspace_id, session.epoch, Arc::clone(session))
            .await
        {
            displaced.request_cancel(CancelKind::Superseded);
            self.teardown(&displaced, true, false).await;
        }
        let timer = self.arm_expiry_timer(session);
        session.resources.lock().await.timer = Some(timer);

        session.set_status(LoginStatus::Navigating);
        {
            let mut res = session.resources.lock().await;
            let proxied = res.lease.is_some();
            let mut stage = NavStage {
                engine: self,
                session: session.as_ref(),
                profile: &profile,
                res: &mut *res,
                login_url: &self.config.platform.login_url,
                nav_secs: self.config.timeouts.navigation_secs,
                fallback_secs: self.config.timeouts.fallback_navigation_secs,
                started_proxied: proxied,
            };
            with_proxy_fallback(&mut stage, proxied, |stage, use_proxy| {
                Box::pin(stage.run(use_proxy))
            })
            .await?;
        }

        session.set_status(LoginStatus::EnteringCredentials);
        let res = session.resources.lock().await;
        let page = res.page()?;

        let cursor_rest = humanize::viewport_center(
            self.config.browser.window_width,
            self.config.browser.window_height,
        );
        let username_field = self
            .wait_for_element(page, USERNAME_SELECTORS, Duration::from_secs(10))
            .await?;
        humanized_fill(page, &username_field, &request.email, cursor_rest).await?;

        let password_field = self
            .wait_for_element(page, PASSWORD_SELECTORS, Duration::from_secs(5))
            .await?;
        humanized_fill(page, &password_field, &request.password, cursor_rest).await?;

        session.set_status(LoginStatus::Submitting);
        match self
            .wait_for_element(page, SUBMIT_SELECTORS, Duration::from_secs(2))
            .await
        {
            Ok(button) => {
                button
                    .click()
                    .await
                    .map_err(|e| EngineError::Cdp(e.to_string()))?;
            }
            Err(_) => {
                password_field
                    .press_key("Enter")
                    .await
                    .map_err(|e| EngineError::Cdp(e.to_string()))?;
            }
        }

        // Either a navigation event arrives or the grace delay elapses.
        let grace = Duration::from_millis(self.config.timeouts.submit_grace_ms);
        let _ = tokio::time::timeout(grace, page.wait_for_navigation()).await;

        let (url, dom) = self.observe_page(page).await?;
        match self.classifier.classify(&url, &dom) {
            PageState::Checkpoint => {
                session.set_status(LoginStatus::WaitingForTwoFactor);
                let method = two_factor::select_verification_method(self, page).await;
                tracing::info!(workspace = %request.workspace_id, ?method, "verification code required");
                Ok(LoginOutcome::TwoFactorRequired { method })
            }
            PageState::LoginForm | PageState::Authwall => {
                let message = read_inline_error(page)
                    .await
                    .unwrap_or_else(|| "invalid credentials".to_string());
                Err(EngineError::Auth(message))
            }
            PageState::NavigationFailure => {
                Err(EngineError::Network(format!("navigation failed at {}", url)))
            }
            PageState::LoggedIn => {
                session.set_status(LoginStatus::CapturingCookies);
                let lineage = res.lease.as_ref().map(|l| l.lineage());
                let (display_name, _) = self
                    .capture_and_store(
                        page,
                        &request.workspace_id,
                        &request.user_id,
                        Provenance::Login,
                        lineage,
                    )
                    .await?;
                session.set_status(LoginStatus::Success);
                Ok(LoginOutcome::Success { display_name })
            }
        }
    }
}
