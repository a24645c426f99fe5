//! Engine tests against in-memory collaborators. Everything here runs
//! without a browser: the trust-store cookie path, session lifecycle
//! errors, and lease accounting through cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sessionforge::engine::{LoginSession, LoginStatus};
use sessionforge::store::unseal_bundle;
use sessionforge::{
    Config, CredentialCipher, EngineError, Provenance, ProxyAllocator, ProxyEndpoint, ProxyLease,
    Result, SessionEngine, SessionRecord, SessionStore, StoredCookie,
};
use tokio::sync::Mutex;

#[derive(Default)]
struct FakeAllocator {
    acquires: AtomicUsize,
    releases: AtomicUsize,
    lease: Option<ProxyLease>,
}

#[async_trait]
impl ProxyAllocator for FakeAllocator {
    async fn acquire(&self, _user_id: &str, _workspace_id: &str) -> Result<Option<ProxyLease>> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(self.lease.clone())
    }

    async fn release(&self, _user_id: &str, _workspace_id: &str) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MemoryStore {
    records: Mutex<HashMap<String, SessionRecord>>,
    errors: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert(&self, record: SessionRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.workspace_id.clone(), record);
        Ok(())
    }

    async fn get(&self, workspace_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.records.lock().await.get(workspace_id).cloned())
    }

    async fn deactivate(&self, workspace_id: &str) -> Result<()> {
        if let Some(record) = self.records.lock().await.get_mut(workspace_id) {
            record.is_active = false;
        }
        Ok(())
    }

    async fn record_error(&self, workspace_id: &str, message: &str) -> Result<()> {
        self.errors
            .lock()
            .await
            .push(format!("{}: {}", workspace_id, message));
        Ok(())
    }
}

/// Reversible marker cipher so tests can read what was persisted.
struct PlainCipher;

#[async_trait]
impl CredentialCipher for PlainCipher {
    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(format!("enc:{}", plaintext))
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<String> {
        ciphertext
            .strip_prefix("enc:")
            .map(str::to_string)
            .ok_or_else(|| EngineError::Cipher("bad ciphertext".to_string()))
    }
}

struct Harness {
    engine: SessionEngine,
    allocator: Arc<FakeAllocator>,
    store: Arc<MemoryStore>,
}

fn harness() -> Harness {
    // RUST_LOG=debug makes test failures traceable
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let allocator = Arc::new(FakeAllocator::default());
    let store = Arc::new(MemoryStore::default());
    let engine = SessionEngine::new(
        Config::default(),
        Arc::clone(&allocator) as Arc<dyn ProxyAllocator>,
        Arc::new(PlainCipher),
        Arc::clone(&store) as Arc<dyn SessionStore>,
    );
    Harness {
        engine,
        allocator,
        store,
    }
}

fn cookie(name: &str, value: &str) -> StoredCookie {
    StoredCookie {
        name: name.to_string(),
        value: value.to_string(),
        domain: None,
        path: None,
        expires: None,
        http_only: true,
        secure: true,
    }
}

fn full_cookie_set() -> Vec<StoredCookie> {
    vec![
        cookie("li_at", "auth-token"),
        cookie("JSESSIONID", "ajax:123"),
        cookie("bcookie", "b"),
        cookie("bscookie", "bs"),
        cookie("lidc", "dc"),
    ]
}

#[tokio::test]
async fn trust_store_path_persists_without_any_network_activity() {
    let h = harness();

    let report = h
        .engine
        .connect_with_cookies("ws-1", "user-1", full_cookie_set())
        .await
        .unwrap();

    assert!(report.warnings.is_empty());
    assert!(!report.needs_verification);
    assert!(report.display_name.is_none());

    // Zero proxy traffic on this path
    assert_eq!(h.allocator.acquires.load(Ordering::SeqCst), 0);
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 0);

    let record = h.store.get("ws-1").await.unwrap().unwrap();
    assert!(record.is_active);
    assert_eq!(record.provenance, Provenance::Manual);
    assert_eq!(record.display_name, "Member");
    assert!(record.proxy_lineage.is_none());

    // Stored ciphertext unseals back to the normalized bundle
    let bundle = unseal_bundle(&PlainCipher, &record.encrypted_cookies)
        .await
        .unwrap();
    assert!(bundle.contains("li_at"));
    assert_eq!(
        bundle.get("li_at").unwrap().domain.as_deref(),
        Some(".www.linkedin.com")
    );
    assert_eq!(bundle.get("li_at").unwrap().path.as_deref(), Some("/"));
}

#[tokio::test]
async fn trust_store_path_rejects_a_set_without_the_essential_cookie() {
    let h = harness();

    let err = h
        .engine
        .connect_with_cookies("ws-1", "user-1", vec![cookie("JSESSIONID", "ajax:123")])
        .await
        .unwrap_err();

    match err {
        EngineError::InvalidCookies(msg) => assert!(msg.contains("li_at")),
        other => panic!("expected InvalidCookies, got {:?}", other),
    }
    assert!(h.store.get("ws-1").await.unwrap().is_none());
}

#[tokio::test]
async fn trust_store_path_warns_on_sparse_sets_but_accepts_them() {
    let h = harness();

    let report = h
        .engine
        .connect_with_cookies("ws-1", "user-1", vec![cookie("li_at", "auth-token")])
        .await
        .unwrap();

    // Missing secondary cookie plus a below-threshold count
    assert_eq!(report.warnings.len(), 2);
    assert!(report.warnings.iter().any(|w| w.contains("JSESSIONID")));
    assert!(report.message.contains("only 1 cookies"));
    assert!(h.store.get("ws-1").await.unwrap().is_some());
}

#[tokio::test]
async fn two_factor_submission_without_a_session_is_rejected() {
    let h = harness();

    let err = h
        .engine
        .submit_two_factor("ws-none", "123456")
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::NoActiveSession(ws) if ws == "ws-none"));
}

#[tokio::test]
async fn two_factor_submission_requires_a_suspended_session() {
    let h = harness();

    // A session that is mid-login, not waiting for a code
    let epoch = h.engine.registry().next_epoch();
    let session = Arc::new(LoginSession::new("ws-1", "user-1", epoch));
    session.set_status(LoginStatus::Navigating);
    h.engine.registry().upsert("ws-1", epoch, session).await;

    let err = h
        .engine
        .submit_two_factor("ws-1", "123456")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoActiveSession(_)));
}

#[tokio::test]
async fn cancel_without_a_session_is_rejected() {
    let h = harness();

    let err = h.engine.cancel("ws-none").await.unwrap_err();
    assert!(matches!(err, EngineError::NoActiveSession(ws) if ws == "ws-none"));
}

fn lease() -> ProxyLease {
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

#[tokio::test]
async fn cancel_releases_the_lease_exactly_once() {
    let h = harness();

    let epoch = h.engine.registry().next_epoch();
    let session = Arc::new(LoginSession::new("ws-1", "user-1", epoch));
    session.resources.lock().await.lease = Some(lease());
    session.set_status(LoginStatus::WaitingForTwoFactor);
    h.engine
        .registry()
        .upsert("ws-1", epoch, Arc::clone(&session))
        .await;

    h.engine.cancel("ws-1").await.unwrap();
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 1);
    assert_eq!(session.status(), LoginStatus::Cancelled);
    assert!(session.cancel.is_cancelled());
    assert!(h.engine.registry().is_empty().await);

    // Already removed and torn down
    assert!(h.engine.cancel("ws-1").await.is_err());
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_tears_down_every_registered_session() {
    let h = harness();

    for ws in ["ws-a", "ws-b"] {
        let epoch = h.engine.registry().next_epoch();
        let session = Arc::new(LoginSession::new(ws, "user-1", epoch));
        session.resources.lock().await.lease = Some(lease());
        h.engine.registry().upsert(ws, epoch, session).await;
    }

    h.engine.shutdown().await;
    assert!(h.engine.registry().is_empty().await);
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expired_session_record_can_be_deactivated_and_keeps_errors() {
    let h = harness();

    h.engine
        .connect_with_cookies("ws-1", "user-1", full_cookie_set())
        .await
        .unwrap();

    h.store.deactivate("ws-1").await.unwrap();
    h.store
        .record_error("ws-1", "session expired at https://example/login")
        .await
        .unwrap();

    let record = h.store.get("ws-1").await.unwrap().unwrap();
    assert!(!record.is_active);
    assert_eq!(h.store.errors.lock().await.len(), 1);
}
