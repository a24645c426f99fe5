//! Automated session acquisition for browser-gated platforms.
//!
//! `sessionforge` drives a real Chrome instance through a platform login
//! flow the way a person would: a deterministic per-identity fingerprint,
//! humanized mouse and keyboard input, a residential proxy with sticky
//! sessions and a single direct-connection fallback, and a suspend/resume
//! path for two-factor checkpoints. Captured cookies are encrypted and
//! persisted together with the proxy lineage that produced them.
//!
//! The [`SessionEngine`] is the single entry point; its collaborators
//! (proxy allocator, credential cipher, session store, page classifier)
//! are injected traits so hosts and tests can supply their own.

pub mod browser;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod humanize;
pub mod login;
pub mod proxy;
pub mod registry;
pub mod store;
pub mod validator;

pub use classifier::{PageClassifier, PageState, TwoFactorMethod, UrlClassifier};
pub use config::Config;
pub use engine::{CancelKind, LoginSession, LoginStatus, SessionEngine};
pub use error::{EngineError, Result};
pub use fingerprint::FingerprintProfile;
pub use login::{LoginOutcome, LoginRequest};
pub use proxy::{ProxyAllocator, ProxyEndpoint, ProxyLease, ProxyLineage};
pub use store::{
    CookieBundle, CredentialCipher, Provenance, SessionRecord, SessionStore, StoredCookie,
};
pub use validator::ValidationReport;
