//! Engine state shared by the login state machine, the two-factor handler
//! and the cookie validator: the per-workspace session object, the
//! idempotent teardown routine, and the cookie-capture path every success
//! branch funnels through.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chromiumoxide::Page;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::browser::provisioner::ProvisionedBrowser;
use crate::classifier::{DomSnapshot, PageClassifier, UrlClassifier};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::proxy::{ProxyAllocator, ProxyLease, ProxyLineage};
use crate::registry::SessionRegistry;
use crate::store::{
    seal_bundle, CookieBundle, CredentialCipher, Provenance, SessionRecord, SessionStore,
    StoredCookie,
};

/// Where a login session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    Starting,
    LaunchingBrowser,
    Navigating,
    EnteringCredentials,
    Submitting,
    WaitingForTwoFactor,
    CapturingCookies,
    Success,
    Error,
    Cancelled,
}

/// Why a session's cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    User,
    Timeout,
    Superseded,
}

/// Owned browser/proxy/timer resources of one session. Every field is an
/// Option taken exactly once, which is what makes teardown idempotent.
#[derive(Default)]
pub struct SessionResources {
    pub browser: Option<ProvisionedBrowser>,
    pub lease: Option<ProxyLease>,
    pub timer: Option<JoinHandle<()>>,
}

impl SessionResources {
    pub fn page(&self) -> Result<&Page> {
        self.browser
            .as_ref()
            .map(ProvisionedBrowser::page)
            .ok_or_else(|| EngineError::LaunchFailure("browser is no longer available".into()))
    }
}

/// One in-flight login session. At most one exists per workspace.
pub struct LoginSession {
    pub workspace_id: String,
    pub user_id: String,
    pub epoch: u64,
    pub cancel: CancellationToken,
    status: StdMutex<LoginStatus>,
    cancel_kind: StdMutex<Option<CancelKind>>,
    pub resources: Mutex<SessionResources>,
}

impl LoginSession {
    pub fn new(workspace_id: &str, user_id: &str, epoch: u64) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            epoch,
            cancel: CancellationToken::new(),
            status: StdMutex::new(LoginStatus::Starting),
            cancel_kind: StdMutex::new(None),
            resources: Mutex::new(SessionResources::default()),
        }
    }

    pub fn status(&self) -> LoginStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: LoginStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        tracing::debug!(workspace = %self.workspace_id, ?status, "login status");
    }

    /// Record why we are cancelling, then fire the token. The first caller
    /// wins; later kinds are ignored.
    pub fn request_cancel(&self, kind: CancelKind) {
        let mut slot = self.cancel_kind.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(kind);
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub fn cancel_kind(&self) -> Option<CancelKind> {
        *self.cancel_kind.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The session-acquisition engine. Cheap to clone; all collaborators are
/// injected and shared.
#[derive(Clone)]
pub struct SessionEngine {
    pub(crate) config: Arc<Config>,
    pub(crate) allocator: Arc<dyn ProxyAllocator>,
    pub(crate) cipher: Arc<dyn CredentialCipher>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) classifier: Arc<dyn PageClassifier>,
    pub(crate) registry: Arc<SessionRegistry<LoginSession>>,
}

impl SessionEngine {
    pub fn new(
        config: Config,
        allocator: Arc<dyn ProxyAllocator>,
        cipher: Arc<dyn CredentialCipher>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            allocator,
            cipher,
            store,
            classifier: Arc::new(UrlClassifier),
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    /// Swap the page classifier (tests use fixture classifiers).
    pub fn with_classifier(mut self, classifier: Arc<dyn PageClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn registry(&self) -> &SessionRegistry<LoginSession> {
        &self.registry
    }

    /// Cancel an in-flight login for a workspace.
    pub async fn cancel(&self, workspace_id: &str) -> Result<()> {
        let session = self
            .registry
            .remove(workspace_id)
            .await
            .ok_or_else(|| EngineError::NoActiveSession(workspace_id.to_string()))?;

        session.set_status(LoginStatus::Cancelled);
        session.request_cancel(CancelKind::User);
        self.teardown(&session, true, false).await;
        tracing::info!(workspace = %workspace_id, "login cancelled");
        Ok(())
    }

    /// Tear down every registered session (host shutdown).
    pub async fn shutdown(&self) {
        for session in self.registry.drain().await {
            session.request_cancel(CancelKind::User);
            self.teardown(&session, true, false).await;
        }
    }

    /// Release a session's resources. Idempotent: each resource is taken
    /// out of its Option exactly once, so racing callers (timer, cancel,
    /// the attempt itself) cannot double-free.
    ///
    /// `release_lease` is false only on the login success path, where the
    /// proxy lineage must stay bound to the captured cookies.
    pub(crate) async fn teardown(
        &self,
        session: &LoginSession,
        release_lease: bool,
        from_timer: bool,
    ) {
        let mut res = session.resources.lock().await;

        if let Some(timer) = res.timer.take() {
            // The timer task may be the one running this teardown; it must
            // not abort itself mid-cleanup.
            if !from_timer {
                timer.abort();
            }
        }

        if let Some(browser) = res.browser.take() {
            browser.close().await;
        }

        if res.lease.take().is_some() && release_lease {
            self.allocator
                .release(&session.user_id, &session.workspace_id)
                .await;
            tracing::debug!(workspace = %session.workspace_id, "proxy lease released");
        }
    }

    /// Arm the hard session-cap timer. On firing it runs the same teardown
    /// as every other exit path, regardless of what state the session is in.
    pub(crate) fn arm_expiry_timer(&self, session: &Arc<LoginSession>) -> JoinHandle<()> {
        let engine = self.clone();
        let session = Arc::clone(session);
        let cap = self.config.timeouts.session_cap_secs;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(cap)).await;
            tracing::warn!(workspace = %session.workspace_id, cap, "session cap hit");
            session.request_cancel(CancelKind::Timeout);
            if let Some(stale) = engine
                .registry
                .remove_if_epoch(&session.workspace_id, session.epoch)
                .await
            {
                engine.teardown(&stale, true, true).await;
            }
        })
    }

    /// Observe the page for classification: final URL plus a small DOM
    /// snapshot (title and visible text).
    pub(crate) async fn observe_page(&self, page: &Page) -> Result<(String, DomSnapshot)> {
        let url = page
            .url()
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?
            .unwrap_or_default();

        let title = page
            .get_title()
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?
            .unwrap_or_default();

        let body_text = page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?
            .into_value::<String>()
            .unwrap_or_default();

        Ok((url, DomSnapshot { title, body_text }))
    }

    /// Read the platform cookies, require the essential auth cookie,
    /// extract a display name, then encrypt and persist the bundle.
    /// Returns the display name and the captured bundle.
    pub(crate) async fn capture_and_store(
        &self,
        page: &Page,
        workspace_id: &str,
        user_id: &str,
        provenance: Provenance,
        lineage: Option<ProxyLineage>,
    ) -> Result<(String, CookieBundle)> {
        let platform = &self.config.platform;

        let raw = page
            .get_cookies()
            .await
            .map_err(|e| EngineError::Cdp(format!("reading cookies: {}", e)))?;

        let cookies: Vec<StoredCookie> = raw
            .into_iter()
            .filter(|c| c.domain.contains(&platform.domain))
            .map(|c| StoredCookie {
                name: c.name,
                value: c.value,
                domain: Some(c.domain),
                path: Some(c.path),
                expires: Some(c.expires),
                http_only: c.http_only,
                secure: c.secure,
            })
            .collect();

        let bundle = CookieBundle::new(cookies);
        if !bundle.contains(&platform.essential_cookie) {
            return Err(EngineError::SessionCookieMissing);
        }

        let display_name = self.extract_display_name(page).await;

        let sealed = seal_bundle(self.cipher.as_ref(), &bundle).await?;
        let record = SessionRecord::new(
            workspace_id,
            user_id,
            sealed,
            display_name.clone(),
            provenance,
            lineage,
        );
        self.store
            .upsert(record)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        tracing::info!(
            workspace = %workspace_id,
            cookies = bundle.len(),
            %display_name,
            "session cookies captured"
        );

        Ok((display_name, bundle))
    }

    /// Best-effort display-name extraction; never fatal. Title first, then
    /// a heading scan, then the legacy identity module, then the
    /// configured placeholder.
    pub(crate) async fn extract_display_name(&self, page: &Page) -> String {
        let platform = &self.config.platform;

        if let Ok(Some(title)) = page.get_title().await {
            if let Some(name) = display_name_from_title(&title, &platform.title_separator) {
                return name;
            }
        }

        let heading_js = r#"
            (() => {
                const skip = ['welcome', 'sign', 'verify', 'security', 'feed', 'join'];
                for (const el of document.querySelectorAll('h1, h2')) {
                    const text = el.textContent.trim();
                    if (!text || text.length > 60) continue;
                    if (skip.some(k => text.toLowerCase().includes(k))) continue;
                    return text;
                }
                return '';
            })()
        "#;
        if let Ok(result) = page.evaluate(heading_js).await {
            if let Ok(text) = result.into_value::<String>() {
                if !text.is_empty() {
                    return text;
                }
            }
        }

        if let Ok(element) = page.find_element(".feed-identity-module__actor-meta").await {
            if let Ok(Some(text)) = element.inner_text().await {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }

        platform.display_name_placeholder.clone()
    }

    /// Poll an ordered selector list until one matches or the deadline
    /// passes. First match wins.
    pub(crate) async fn wait_for_element(
        &self,
        page: &Page,
        selectors: &[&str],
        timeout: Duration,
    ) -> Result<chromiumoxide::Element> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            for selector in selectors {
                if let Ok(element) = page.find_element(*selector).await {
                    return Ok(element);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Cdp(format!(
                    "none of {:?} appeared within {:?}",
                    selectors, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Parse a display name out of a page title like `"(3) Ada Lovelace | …"`:
/// strip the notification-count parenthetical, split on the separator.
pub(crate) fn display_name_from_title(title: &str, separator: &str) -> Option<String> {
    let mut working = title.trim();

    if working.starts_with('(') {
        if let Some(end) = working.find(") ") {
            working = working[end + 2..].trim_start();
        }
    }

    let head = match working.find(separator) {
        Some(idx) => &working[..idx],
        None => working,
    };

    let head = head.trim();
    if head.is_empty() || head.len() > 60 {
        return None;
    }

    // Generic platform titles are not names
    let lowered = head.to_lowercase();
    if ["log in", "sign in", "security verification", "feed"]
        .iter()
        .any(|k| lowered.contains(k))
    {
        return None;
    }

    Some(head.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::proxy::ProxyEndpoint;

    #[derive(Default)]
    struct CountingAllocator {
        releases: AtomicUsize,
    }

    #[async_trait]
    impl ProxyAllocator for CountingAllocator {
        async fn acquire(&self, _: &str, _: &str) -> Result<Option<ProxyLease>> {
            Ok(None)
        }

        async fn release(&self, _: &str, _: &str) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullCipher;

    #[async_trait]
    impl CredentialCipher for NullCipher {
        async fn encrypt(&self, plaintext: &str) -> Result<String> {
            Ok(plaintext.to_string())
        }

        async fn decrypt(&self, ciphertext: &str) -> Result<String> {
            Ok(ciphertext.to_string())
        }
    }

    struct NullStore;

    #[async_trait]
    impl SessionStore for NullStore {
        async fn upsert(&self, _record: SessionRecord) -> Result<()> {
            Ok(())
        }

        async fn get(&self, _workspace_id: &str) -> Result<Option<SessionRecord>> {
            Ok(None)
        }

        async fn deactivate(&self, _workspace_id: &str) -> Result<()> {
            Ok(())
        }

        async fn record_error(&self, _workspace_id: &str, _message: &str) -> Result<()> {
            Ok(())
        }
    }

    fn stub_lease() -> ProxyLease {
        ProxyLease {
            allocation_id: "alloc-1".to_string(),
            endpoint: ProxyEndpoint {
                host: "gw.example.net".to_string(),
                port: 12321,
                username: "alice".to_string(),
                password: "secret".to_string(),
                provider: "iproyal".to_string(),
                id: "px-1".to_string(),
                sticky_session_id: Some("k9".to_string()),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_timer_tears_down_a_stuck_session_and_releases_the_lease() {
        let allocator = Arc::new(CountingAllocator::default());
        let engine = SessionEngine::new(
            Config::default(),
            Arc::clone(&allocator) as Arc<dyn ProxyAllocator>,
            Arc::new(NullCipher),
            Arc::new(NullStore),
        );

        // A session stuck mid-navigation, holding a lease
        let epoch = engine.registry.next_epoch();
        let session = Arc::new(LoginSession::new("ws", "user", epoch));
        session.set_status(LoginStatus::Navigating);
        session.resources.lock().await.lease = Some(stub_lease());
        engine
            .registry
            .upsert("ws", epoch, Arc::clone(&session))
            .await;

        // Paused time fast-forwards through the full session cap
        engine.arm_expiry_timer(&session).await.unwrap();

        assert!(engine.registry.is_empty().await);
        assert_eq!(session.cancel_kind(), Some(CancelKind::Timeout));
        assert_eq!(allocator.releases.load(Ordering::SeqCst), 1);
        assert!(session.resources.lock().await.lease.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_timer_never_touches_a_superseding_session() {
        let allocator = Arc::new(CountingAllocator::default());
        let engine = SessionEngine::new(
            Config::default(),
            Arc::clone(&allocator) as Arc<dyn ProxyAllocator>,
            Arc::new(NullCipher),
            Arc::new(NullStore),
        );

        let old_epoch = engine.registry.next_epoch();
        let old = Arc::new(LoginSession::new("ws", "user", old_epoch));
        let timer = engine.arm_expiry_timer(&old);

        // A fresh attempt replaces the old session before the timer fires
        let new_epoch = engine.registry.next_epoch();
        let new = Arc::new(LoginSession::new("ws", "user", new_epoch));
        new.resources.lock().await.lease = Some(stub_lease());
        engine
            .registry
            .upsert("ws", new_epoch, Arc::clone(&new))
            .await;

        timer.await.unwrap();

        assert_eq!(engine.registry.len().await, 1);
        assert!(new.resources.lock().await.lease.is_some());
        assert!(!new.cancel.is_cancelled());
        assert_eq!(allocator.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn title_with_notification_count_and_separator() {
        assert_eq!(
            display_name_from_title("(3) Ada Lovelace | LinkedIn", " | "),
            Some("Ada Lovelace".to_string())
        );
    }

    #[test]
    fn plain_title_without_separator() {
        assert_eq!(
            display_name_from_title("Ada Lovelace", " | "),
            Some("Ada Lovelace".to_string())
        );
    }

    #[test]
    fn generic_titles_are_rejected() {
        assert_eq!(display_name_from_title("Log In or Sign Up", " | "), None);
        assert_eq!(
            display_name_from_title("Security Verification | LinkedIn", " | "),
            None
        );
        assert_eq!(display_name_from_title("", " | "), None);
    }

    #[test]
    fn session_starts_in_starting_state() {
        let session = LoginSession::new("ws", "user", 1);
        assert_eq!(session.status(), LoginStatus::Starting);
        assert!(session.cancel_kind().is_none());
    }

    #[test]
    fn first_cancel_kind_wins() {
        let session = LoginSession::new("ws", "user", 1);
        session.request_cancel(CancelKind::Timeout);
        session.request_cancel(CancelKind::User);
        assert_eq!(session.cancel_kind(), Some(CancelKind::Timeout));
        assert!(session.cancel.is_cancelled());
    }
}
