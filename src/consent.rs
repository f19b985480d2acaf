//! Consent & egress gate
//!
//! No workbench content leaves the machine without a grant bound to the exact scope being sent:
//! provider, model, and the `(path, size)` listing of Published. Any change to that scope changes
//! the scope hash and invalidates the grant.
//!
//! Provider clients are only reachable through [`GatedClient`], which re-checks consent and logs
//! an egress event before every call.

use crate::error::{ErrorCode, ErrorInfo, InPhase, Phase};
use crate::provider::{ChatMessage, ChatResponse, ModelProviderClient, ToolDefinition};
use crate::store::{atomic, Manifest, WorkbenchStore};
use crate::types::{now_rfc3339, WorkbenchId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const CONSENT_SCHEMA_VERSION: u32 = 1;

/// Hosts model traffic may reach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressPolicy {
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
}

fn default_allowed_hosts() -> Vec<String> {
    vec!["api.openai.com".to_string()]
}

impl Default for EgressPolicy {
    fn default() -> Self {
        Self {
            allowed_hosts: default_allowed_hosts(),
        }
    }
}

impl EgressPolicy {
    /// Require an `https` URL whose named host is on the allowlist.
    pub fn check_url(&self, url: &str) -> Result<(), ErrorInfo> {
        let blocked = |detail: String| {
            ErrorInfo::new(ErrorCode::EgressBlockedByPolicy, Phase::Workshop, detail)
        };
        let parsed =
            reqwest::Url::parse(url).map_err(|_| blocked(format!("invalid provider url {url:?}")))?;
        if parsed.scheme() != "https" {
            return Err(blocked(format!("provider url must use https: {url}")));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| blocked(format!("provider url has no host: {url}")))?;
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<IpAddr>().is_ok() {
            return Err(blocked(format!("IP address hosts are not allowed: {host}")));
        }
        let host = host.to_ascii_lowercase();
        if !self
            .allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&host))
        {
            return Err(blocked(format!("host {host} is not on the egress allowlist")));
        }
        Ok(())
    }
}

/// Scope hash over provider, model and the sorted `(path, size)` pairs of Published.
pub fn scope_hash(provider_id: &str, model_id: &str, manifest: &Manifest) -> String {
    let mut files: Vec<(&str, u64)> = manifest
        .files
        .iter()
        .map(|f| (f.path.as_str(), f.size))
        .collect();
    files.sort();

    let mut hasher = blake3::Hasher::new();
    hasher.update(provider_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(model_id.as_bytes());
    hasher.update(&[0]);
    for (path, size) in files {
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(&size.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentGrant {
    pub provider_id: String,
    pub model_id: String,
    pub scope_hash: String,
    pub granted_at: String,
}

/// `meta/egress_consent.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsentFile {
    schema_version: u32,
    #[serde(default)]
    grants: Vec<ConsentGrant>,
}

impl Default for ConsentFile {
    fn default() -> Self {
        Self {
            schema_version: CONSENT_SCHEMA_VERSION,
            grants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentStatus {
    pub consented: bool,
    pub scope_hash: String,
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressEventKind {
    ConsentGranted,
    ConsentRevoked,
    ModelCall,
}

/// One line of `meta/egress_events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressEvent {
    pub timestamp: String,
    pub kind: EgressEventKind,
    pub provider_id: String,
    pub model_id: String,
    pub scope_hash: String,
}

type ScopeKey = (WorkbenchId, String, String);

/// Explicit consent store and the only way to obtain a provider client.
pub struct ConsentGate {
    store: WorkbenchStore,
    policy: EgressPolicy,
    session: Mutex<HashMap<ScopeKey, String>>,
}

impl ConsentGate {
    pub fn new(store: WorkbenchStore, policy: EgressPolicy) -> Self {
        Self {
            store,
            policy,
            session: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &EgressPolicy {
        &self.policy
    }

    fn key(id: &WorkbenchId, provider_id: &str, model_id: &str) -> ScopeKey {
        (id.clone(), provider_id.to_string(), model_id.to_string())
    }

    fn load_file(&self, id: &WorkbenchId) -> Result<ConsentFile, ErrorInfo> {
        let path = self.store.paths(id).consent_json();
        Ok(atomic::read_json(&path)
            .in_phase(Phase::Workshop)?
            .unwrap_or_default())
    }

    pub fn current_scope_hash(
        &self,
        id: &WorkbenchId,
        provider_id: &str,
        model_id: &str,
    ) -> Result<String, ErrorInfo> {
        let manifest = self.store.manifest(id).in_phase(Phase::Workshop)?;
        Ok(scope_hash(provider_id, model_id, &manifest))
    }

    pub fn status(
        &self,
        id: &WorkbenchId,
        provider_id: &str,
        model_id: &str,
    ) -> Result<ConsentStatus, ErrorInfo> {
        let current = self.current_scope_hash(id, provider_id, model_id)?;
        let persisted = self.load_file(id)?.grants.iter().any(|g| {
            g.provider_id == provider_id && g.model_id == model_id && g.scope_hash == current
        });
        let session = self
            .session
            .lock()
            .get(&Self::key(id, provider_id, model_id))
            .is_some_and(|hash| *hash == current);
        Ok(ConsentStatus {
            consented: persisted || session,
            scope_hash: current,
            persisted,
        })
    }

    /// Fail closed unless a grant matches the current scope. Returns the scope hash.
    pub fn ensure(
        &self,
        id: &WorkbenchId,
        provider_id: &str,
        model_id: &str,
    ) -> Result<String, ErrorInfo> {
        let status = self.status(id, provider_id, model_id)?;
        if status.consented {
            return Ok(status.scope_hash);
        }
        info!(
            workbench_id = %id,
            provider_id,
            model_id,
            scope_hash = %status.scope_hash,
            "Egress consent required"
        );
        Err(ErrorInfo::new(
            ErrorCode::EgressConsentRequired,
            Phase::Workshop,
            "consent is required before workbench content is sent to this model",
        )
        .with_provider(provider_id, model_id)
        .with_workbench(id.as_str())
        .with_scope_hash(&status.scope_hash))
    }

    pub fn grant(
        &self,
        id: &WorkbenchId,
        provider_id: &str,
        model_id: &str,
        presented_hash: &str,
        persist: bool,
    ) -> Result<ConsentStatus, ErrorInfo> {
        let current = self.current_scope_hash(id, provider_id, model_id)?;
        if presented_hash != current {
            return Err(ErrorInfo::validation(Phase::Workshop, "scope hash mismatch")
                .with_provider(provider_id, model_id)
                .with_workbench(id.as_str())
                .with_scope_hash(&current));
        }

        if persist {
            let mut file = self.load_file(id)?;
            file.schema_version = CONSENT_SCHEMA_VERSION;
            file.grants
                .retain(|g| !(g.provider_id == provider_id && g.model_id == model_id));
            file.grants.push(ConsentGrant {
                provider_id: provider_id.to_string(),
                model_id: model_id.to_string(),
                scope_hash: current.clone(),
                granted_at: now_rfc3339(),
            });
            atomic::write_json(&self.store.paths(id).consent_json(), &file)
                .in_phase(Phase::Workshop)?;
        }
        self.session
            .lock()
            .insert(Self::key(id, provider_id, model_id), current.clone());

        self.log_event(id, EgressEventKind::ConsentGranted, provider_id, model_id, &current);
        info!(workbench_id = %id, provider_id, model_id, persist, "Egress consent granted");
        self.status(id, provider_id, model_id)
    }

    /// Drop session and persisted grants. Returns true when anything was removed.
    pub fn revoke(
        &self,
        id: &WorkbenchId,
        provider_id: &str,
        model_id: &str,
    ) -> Result<bool, ErrorInfo> {
        let in_session = self
            .session
            .lock()
            .remove(&Self::key(id, provider_id, model_id))
            .is_some();

        let mut file = self.load_file(id)?;
        let before = file.grants.len();
        file.grants
            .retain(|g| !(g.provider_id == provider_id && g.model_id == model_id));
        let persisted = file.grants.len() != before;
        if persisted {
            atomic::write_json(&self.store.paths(id).consent_json(), &file)
                .in_phase(Phase::Workshop)?;
        }

        let revoked = in_session || persisted;
        if revoked {
            let hash = self
                .current_scope_hash(id, provider_id, model_id)
                .unwrap_or_default();
            self.log_event(id, EgressEventKind::ConsentRevoked, provider_id, model_id, &hash);
            info!(workbench_id = %id, provider_id, model_id, "Egress consent revoked");
        }
        Ok(revoked)
    }

    pub fn events(&self, id: &WorkbenchId) -> Result<Vec<EgressEvent>, ErrorInfo> {
        let paths = self.store.require(id).in_phase(Phase::Workshop)?;
        atomic::read_jsonl(&paths.egress_events()).in_phase(Phase::Workshop)
    }

    fn log_event(
        &self,
        id: &WorkbenchId,
        kind: EgressEventKind,
        provider_id: &str,
        model_id: &str,
        scope_hash: &str,
    ) {
        let event = EgressEvent {
            timestamp: now_rfc3339(),
            kind,
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            scope_hash: scope_hash.to_string(),
        };
        if let Err(e) = atomic::append_jsonl(&self.store.paths(id).egress_events(), &event) {
            warn!(workbench_id = %id, error = %e, "Failed to record egress event");
        }
    }

    /// Wrap a provider client for one workbench after checking its endpoint against policy.
    pub fn client(
        self: &Arc<Self>,
        id: &WorkbenchId,
        inner: Arc<dyn ModelProviderClient>,
    ) -> Result<GatedClient, ErrorInfo> {
        if let Some(url) = inner.base_url() {
            self.policy
                .check_url(url)
                .map_err(|e| e.with_provider(inner.provider_id(), inner.model_id()))?;
        }
        Ok(GatedClient {
            gate: Arc::clone(self),
            workbench_id: id.clone(),
            inner,
        })
    }
}

/// A provider client bound to one workbench; every call passes the gate.
#[derive(Clone)]
pub struct GatedClient {
    gate: Arc<ConsentGate>,
    workbench_id: WorkbenchId,
    inner: Arc<dyn ModelProviderClient>,
}

impl GatedClient {
    pub fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }

    pub fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn admit(&self) -> Result<(), ErrorInfo> {
        let provider_id = self.inner.provider_id();
        let model_id = self.inner.model_id();
        let hash = self.gate.ensure(&self.workbench_id, provider_id, model_id)?;
        self.gate.log_event(
            &self.workbench_id,
            EgressEventKind::ModelCall,
            provider_id,
            model_id,
            &hash,
        );
        debug!(workbench_id = %self.workbench_id, provider_id, model_id, "Model call admitted");
        Ok(())
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ErrorInfo> {
        self.admit()?;
        self.inner.chat(messages).await
    }

    pub async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ErrorInfo> {
        self.admit()?;
        self.inner.chat_with_tools(messages, tools).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileLimits, Tree};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EchoClient {
        base_url: Option<String>,
    }

    #[async_trait]
    impl ModelProviderClient for EchoClient {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<String, ErrorInfo> {
            Ok("echo".to_string())
        }

        async fn chat_with_tools(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<ChatResponse, ErrorInfo> {
            Ok(ChatResponse {
                content: "echo".to_string(),
                ..Default::default()
            })
        }

        fn provider_id(&self) -> &str {
            "openai"
        }

        fn model_id(&self) -> &str {
            "gpt-x"
        }

        fn base_url(&self) -> Option<&str> {
            self.base_url.as_deref()
        }
    }

    fn setup() -> (WorkbenchStore, Arc<ConsentGate>, WorkbenchId, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = WorkbenchStore::new(dir.path(), FileLimits::default()).unwrap();
        let id = store.create("wb").unwrap().id;
        store
            .write_atomic(&id, Tree::Published, "a.txt", b"alpha")
            .unwrap();
        store.rebuild_manifest(&id).unwrap();
        let gate = Arc::new(ConsentGate::new(store.clone(), EgressPolicy::default()));
        (store, gate, id, dir)
    }

    #[test]
    fn test_scope_hash_tracks_manifest() {
        let (store, gate, id, _dir) = setup();
        let before = gate.current_scope_hash(&id, "openai", "gpt-x").unwrap();
        assert_ne!(
            before,
            gate.current_scope_hash(&id, "openai", "gpt-y").unwrap()
        );
        store
            .write_atomic(&id, Tree::Published, "b.txt", b"bravo")
            .unwrap();
        store.rebuild_manifest(&id).unwrap();
        assert_ne!(
            before,
            gate.current_scope_hash(&id, "openai", "gpt-x").unwrap()
        );
    }

    #[test]
    fn test_ensure_fails_closed_until_granted() {
        let (_store, gate, id, _dir) = setup();
        let err = gate.ensure(&id, "openai", "gpt-x").unwrap_err();
        assert_eq!(err.code(), ErrorCode::EgressConsentRequired);
        assert!(err.retryable);
        let hash = err.scope_hash.clone().unwrap();

        let bad = gate.grant(&id, "openai", "gpt-x", "nope", false).unwrap_err();
        assert_eq!(bad.detail, "scope hash mismatch");

        let status = gate.grant(&id, "openai", "gpt-x", &hash, false).unwrap();
        assert!(status.consented);
        assert!(!status.persisted);
        assert_eq!(gate.ensure(&id, "openai", "gpt-x").unwrap(), hash);
    }

    #[test]
    fn test_persisted_grant_survives_new_gate() {
        let (store, gate, id, _dir) = setup();
        let hash = gate.current_scope_hash(&id, "openai", "gpt-x").unwrap();
        gate.grant(&id, "openai", "gpt-x", &hash, true).unwrap();

        let fresh = ConsentGate::new(store, EgressPolicy::default());
        let status = fresh.status(&id, "openai", "gpt-x").unwrap();
        assert!(status.consented);
        assert!(status.persisted);

        assert!(fresh.revoke(&id, "openai", "gpt-x").unwrap());
        assert!(!fresh.status(&id, "openai", "gpt-x").unwrap().consented);

        let kinds: Vec<_> = fresh.events(&id).unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EgressEventKind::ConsentGranted, EgressEventKind::ConsentRevoked]
        );
    }

    #[test]
    fn test_allowlist() {
        let policy = EgressPolicy::default();
        assert!(policy.check_url("https://api.openai.com/v1").is_ok());
        for bad in [
            "http://api.openai.com/v1",
            "https://127.0.0.1/v1",
            "https://[::1]/v1",
            "https://evil.example.com/v1",
            "not a url",
        ] {
            let err = policy.check_url(bad).unwrap_err();
            assert_eq!(err.code(), ErrorCode::EgressBlockedByPolicy, "{bad}");
        }
    }

    #[tokio::test]
    async fn test_gated_client_checks_and_logs() {
        let (_store, gate, id, _dir) = setup();
        let blocked = gate.client(
            &id,
            Arc::new(EchoClient {
                base_url: Some("http://localhost:8080".to_string()),
            }),
        );
        assert_eq!(
            blocked.err().unwrap().code(),
            ErrorCode::EgressBlockedByPolicy
        );

        let client = gate
            .client(&id, Arc::new(EchoClient { base_url: None }))
            .unwrap();
        let err = client.chat(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EgressConsentRequired);
        assert!(gate.events(&id).unwrap().is_empty());

        let hash = gate.current_scope_hash(&id, "openai", "gpt-x").unwrap();
        gate.grant(&id, "openai", "gpt-x", &hash, false).unwrap();
        assert_eq!(client.chat(&[ChatMessage::user("hi")]).await.unwrap(), "echo");
        let events = gate.events(&id).unwrap();
        assert_eq!(events.last().unwrap().kind, EgressEventKind::ModelCall);
    }
}
