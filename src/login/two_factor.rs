//! Two-factor challenge handling.
//!
//! When a login lands on a checkpoint page the engine tries to steer the
//! platform toward a verification method the user can actually complete
//! (email before SMS before authenticator app), suspends the session, and
//! later resumes it with the user-supplied code. A code submission is
//! single-shot: only a rejected code keeps the session open.

use std::time::Duration;

use chromiumoxide::Page;

use super::humanized_fill;
use crate::classifier::{classify_factor, has_invalid_code_marker, PageState, TwoFactorMethod};
use crate::engine::{LoginSession, LoginStatus, SessionEngine};
use crate::error::{EngineError, Result};
use crate::login::LoginOutcome;
use crate::store::Provenance;

/// How a verification-method option is located on the checkpoint page.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Matcher {
    Css(&'static str),
    /// Click the first `tag` element whose visible text contains `needle`.
    Text {
        tag: &'static str,
        needle: &'static str,
    },
}

/// Prioritized method selection: for each method, CSS selectors first,
/// then text queries. Evaluated in order; the first hit is clicked and
/// probing stops.
pub(crate) const METHOD_MATCHERS: &[(TwoFactorMethod, Matcher)] = &[
    (TwoFactorMethod::Email, Matcher::Css("button[data-method=\"email\"]")),
    (TwoFactorMethod::Email, Matcher::Css("#select-email-method")),
    (TwoFactorMethod::Email, Matcher::Text { tag: "button", needle: "email" }),
    (TwoFactorMethod::Sms, Matcher::Css("button[data-method=\"sms\"]")),
    (TwoFactorMethod::Sms, Matcher::Css("#select-sms-method")),
    (TwoFactorMethod::Sms, Matcher::Text { tag: "button", needle: "phone" }),
    (TwoFactorMethod::Sms, Matcher::Text { tag: "button", needle: "sms" }),
    (TwoFactorMethod::Authenticator, Matcher::Css("button[data-method=\"totp\"]")),
    (TwoFactorMethod::Authenticator, Matcher::Text { tag: "button", needle: "authenticator" }),
];

const CODE_INPUT_SELECTORS: &[&str] = &[
    "input[name=\"pin\"]",
    "#input__phone_verification_pin",
    "input[autocomplete=\"one-time-code\"]",
    ".input_verification_pin",
];

const CODE_SUBMIT_SELECTORS: &[&str] = &["#two-step-submit-button", "button[type=\"submit\"]"];

async fn try_matcher(page: &Page, matcher: &Matcher) -> bool {
    match matcher {
        Matcher::Css(selector) => match page.find_element(*selector).await {
            Ok(element) => element.click().await.is_ok(),
            Err(_) => false,
        },
        Matcher::Text { tag, needle } => {
            let js = format!(
                r#"(() => {{
                    for (const el of document.querySelectorAll('{tag}')) {{
                        if (el.textContent.toLowerCase().includes('{needle}')) {{
                            el.click();
                            return true;
                        }}
                    }}
                    return false;
                }})()"#,
            );
            match page.evaluate(js).await {
                Ok(result) => result.into_value::<bool>().unwrap_or(false),
                Err(_) => false,
            }
        }
    }
}

/// Try to steer the checkpoint toward a preferred factor, then classify
/// what the page is actually asking for. Never fails: an unresolvable
/// challenge proceeds with the platform's default factor.
pub(crate) async fn select_verification_method(
    engine: &SessionEngine,
    page: &Page,
) -> TwoFactorMethod {
    let mut clicked = false;
    for (method, matcher) in METHOD_MATCHERS {
        if try_matcher(page, matcher).await {
            tracing::debug!(?method, "verification method option clicked");
            clicked = true;
            break;
        }
    }

    if !clicked {
        tracing::warn!("challenge offered no selectable factor, proceeding with platform default");
    } else {
        // Let the checkpoint page swap in the chosen factor's form
        tokio::time::sleep(Duration::from_millis(800)).await;
    }

    match engine.observe_page(page).await {
        Ok((url, dom)) => classify_factor(&url, &dom.body_text),
        Err(_) => TwoFactorMethod::Authenticator,
    }
}

impl SessionEngine {
    /// Resume a suspended login with a verification code.
    ///
    /// A rejected code returns [`EngineError::TwoFactorInvalid`] and keeps
    /// the session open for another try; every other outcome, success or
    /// failure, tears the session down.
    pub async fn submit_two_factor(&self, workspace_id: &str, code: &str) -> Result<LoginOutcome> {
        let session = self
            .registry
            .get(workspace_id)
            .await
            .filter(|s| s.status() == LoginStatus::WaitingForTwoFactor)
            .ok_or_else(|| EngineError::NoActiveSession(workspace_id.to_string()))?;

        let outcome = self.complete_two_factor(&session, code).await;

        match &outcome {
            Err(EngineError::TwoFactorInvalid) => {
                // Retryable: the session stays suspended
            }
            Ok(_) => {
                if let Some(done) = self.registry.remove_if_epoch(workspace_id, session.epoch).await
                {
                    // Lineage stays with the captured cookies
                    self.teardown(&done, false, false).await;
                }
            }
            Err(e) => {
                session.set_status(LoginStatus::Error);
                if let Some(failed) =
                    self.registry.remove_if_epoch(workspace_id, session.epoch).await
                {
                    self.teardown(&failed, true, false).await;
                }
                let _ = self.store.record_error(workspace_id, &e.to_string()).await;
            }
        }

        outcome
    }

    async fn complete_two_factor(
        &self,
        session: &LoginSession,
        code: &str,
    ) -> Result<LoginOutcome> {
        let res = session.resources.lock().await;
        let page = res.page()?;

        let cursor_rest = crate::humanize::viewport_center(
            self.config.browser.window_width,
            self.config.browser.window_height,
        );
        let code_input = self
            .wait_for_element(page, CODE_INPUT_SELECTORS, Duration::from_secs(5))
            .await?;
        humanized_fill(page, &code_input, code, cursor_rest).await?;

        match self
            .wait_for_element(page, CODE_SUBMIT_SELECTORS, Duration::from_secs(2))
            .await
        {
            Ok(button) => {
                button
                    .click()
                    .await
                    .map_err(|e| EngineError::Cdp(e.to_string()))?;
            }
            Err(_) => {
                code_input
                    .press_key("Enter")
                    .await
                    .map_err(|e| EngineError::Cdp(e.to_string()))?;
            }
        }

        let grace = Duration::from_millis(self.config.timeouts.submit_grace_ms);
        let _ = tokio::time::timeout(grace, page.wait_for_navigation()).await;

        let (url, dom) = self.observe_page(page).await?;
        if self.classifier.classify(&url, &dom) == PageState::Checkpoint
            && has_invalid_code_marker(&dom.body_text)
        {
            tracing::info!(workspace = %session.workspace_id, "verification code rejected");
            return Err(EngineError::TwoFactorInvalid);
        }

        session.set_status(LoginStatus::CapturingCookies);
        let lineage = res.lease.as_ref().map(|l| l.lineage());
        let (display_name, _) = self
            .capture_and_store(
                page,
                &session.workspace_id,
                &session.user_id,
                Provenance::TwoFactor,
                lineage,
            )
            .await?;

        session.set_status(LoginStatus::Success);
        Ok(LoginOutcome::Success { display_name })
    }
}
