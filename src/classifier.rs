//! Page-state classification heuristics.
//!
//! The platform gives no structured signal about where a navigation landed;
//! everything is inferred from URL substrings and page keywords. Those
//! heuristics are inherently fragile, so they sit behind the
//! [`PageClassifier`] strategy and a handful of pure functions that tests
//! can exercise without a browser.

/// Where a navigation landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// URL looks authenticated
    LoggedIn,
    /// Still on a login-class page
    LoginForm,
    /// Interstitial verification page (captcha, 2FA, risk challenge)
    Checkpoint,
    /// The guest wall shown to logged-out visitors
    Authwall,
    /// Browser-level navigation failure surfaced as a chrome-error URL
    NavigationFailure,
}

/// Which second factor the platform is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorMethod {
    Email,
    Sms,
    Authenticator,
}

/// Minimal DOM observation passed alongside the URL.
#[derive(Debug, Clone, Default)]
pub struct DomSnapshot {
    pub title: String,
    pub body_text: String,
}

/// Pluggable classification strategy. Fixtures replace this in tests.
pub trait PageClassifier: Send + Sync {
    fn classify(&self, url: &str, dom: &DomSnapshot) -> PageState;
}

/// Default URL-substring classifier.
#[derive(Debug, Default)]
pub struct UrlClassifier;

impl PageClassifier for UrlClassifier {
    fn classify(&self, url: &str, _dom: &DomSnapshot) -> PageState {
        let lowered = url.to_lowercase();

        if lowered.starts_with("chrome-error://") || lowered.contains("chrome-error") {
            PageState::NavigationFailure
        } else if lowered.contains("checkpoint") || lowered.contains("challenge") {
            PageState::Checkpoint
        } else if lowered.contains("authwall") {
            PageState::Authwall
        } else if lowered.contains("/login") || lowered.contains("/uas/login") {
            PageState::LoginForm
        } else {
            PageState::LoggedIn
        }
    }
}

/// Classify which factor a checkpoint page is asking for, from its URL and
/// visible text. The challenge URL often names the factor directly
/// (`/checkpoint/challenge/sms`) while the body text stays generic, so both
/// are scanned. SMS keywords win over email; everything else defaults to an
/// authenticator app, which is also the platform default.
pub fn classify_factor(url: &str, page_text: &str) -> TwoFactorMethod {
    let lowered = format!("{} {}", url, page_text).to_lowercase();

    const SMS_KEYWORDS: &[&str] = &["phone", "sms", "text message", "mobile number"];
    const EMAIL_KEYWORDS: &[&str] = &["email", "e-mail", "inbox"];

    if SMS_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        TwoFactorMethod::Sms
    } else if EMAIL_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        TwoFactorMethod::Email
    } else {
        TwoFactorMethod::Authenticator
    }
}

/// Whether a checkpoint page is reporting a rejected verification code.
pub fn has_invalid_code_marker(page_text: &str) -> bool {
    let lowered = page_text.to_lowercase();
    ["incorrect", "invalid", "wrong code", "try again"]
        .iter()
        .any(|k| lowered.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(url: &str) -> PageState {
        UrlClassifier.classify(url, &DomSnapshot::default())
    }

    #[test]
    fn checkpoint_urls_classify_as_checkpoint() {
        assert_eq!(
            classify("https://www.linkedin.com/checkpoint/challenge/verify"),
            PageState::Checkpoint
        );
        assert_eq!(
            classify("https://www.linkedin.com/uas/challenge?x=1"),
            PageState::Checkpoint
        );
    }

    #[test]
    fn authwall_beats_logged_in() {
        assert_eq!(
            classify("https://www.linkedin.com/authwall?trk=feed"),
            PageState::Authwall
        );
    }

    #[test]
    fn login_urls_classify_as_login_form() {
        assert_eq!(
            classify("https://www.linkedin.com/login?error=1"),
            PageState::LoginForm
        );
        assert_eq!(
            classify("https://www.linkedin.com/uas/login-submit"),
            PageState::LoginForm
        );
    }

    #[test]
    fn feed_url_classifies_as_logged_in() {
        assert_eq!(classify("https://www.linkedin.com/feed/"), PageState::LoggedIn);
    }

    #[test]
    fn chrome_error_url_is_navigation_failure() {
        assert_eq!(
            classify("chrome-error://chromewebdata/"),
            PageState::NavigationFailure
        );
    }

    #[test]
    fn sms_keywords_classify_as_sms() {
        let text = "We sent a code to your phone ending in 42";
        assert_eq!(classify_factor("", text), TwoFactorMethod::Sms);
    }

    #[test]
    fn sms_challenge_url_wins_over_generic_body_text() {
        assert_eq!(
            classify_factor(
                "https://www.linkedin.com/checkpoint/challenge/sms?x=1",
                "Enter the 6-digit code"
            ),
            TwoFactorMethod::Sms
        );
    }

    #[test]
    fn email_keywords_classify_as_email() {
        let text = "Check your email for a verification code";
        assert_eq!(classify_factor("", text), TwoFactorMethod::Email);
    }

    #[test]
    fn sms_wins_over_email_when_both_appear() {
        let text = "Enter the code we sent by text message or email";
        assert_eq!(classify_factor("", text), TwoFactorMethod::Sms);
    }

    #[test]
    fn unknown_text_defaults_to_authenticator() {
        assert_eq!(
            classify_factor(
                "https://www.linkedin.com/checkpoint/challenge/verify",
                "Enter the 6-digit code"
            ),
            TwoFactorMethod::Authenticator
        );
    }

    #[test]
    fn invalid_code_markers() {
        assert!(has_invalid_code_marker("The code you entered is incorrect."));
        assert!(has_invalid_code_marker("Invalid verification code"));
        assert!(!has_invalid_code_marker("Enter your code"));
    }
}
