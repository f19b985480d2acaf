//! Shared test utilities for integration tests
//!
//! Scripted model providers and tool workers, a recording notifier, and a fully wired engine over
//! a temporary workbenches directory.

use async_trait::async_trait;
use draftbench::config::EngineConfig;
use draftbench::engine::Engine;
use draftbench::error::ErrorInfo;
use draftbench::notify::{Notification, Notifier};
use draftbench::provider::{ChatMessage, ChatResponse, ModelProviderClient, ProviderRegistry, ToolCall, ToolDefinition};
use draftbench::toolworker::{ToolWorker, ToolWorkerError};
use draftbench::types::WorkbenchId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tempfile::TempDir;

pub const PROVIDER_ID: &str = "openai";
pub const MODEL_ID: &str = "gpt-test";

/// Global mutex to serialize environment variable access across tests
static ENV_MUTEX: Mutex<()> = parking_lot::const_mutex(());

/// Run `f` with the given environment variables set, restoring the previous values afterwards.
pub fn with_env<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock();
    let saved: Vec<(String, Option<String>)> = vars
        .iter()
        .map(|(k, _)| (k.to_string(), std::env::var(k).ok()))
        .collect();
    for (key, value) in vars {
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
    }
    let result = f();
    for (key, value) in saved {
        match value {
            Some(v) => std::env::set_var(&key, v),
            None => std::env::remove_var(&key),
        }
    }
    result
}

pub fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

pub fn calls(tool_calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls,
        finish_reason: Some("tool_calls".to_string()),
    }
}

pub fn text(content: &str) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        tool_calls: Vec::new(),
        finish_reason: Some("stop".to_string()),
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Model client that replays a fixed script of responses.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ChatResponse, ErrorInfo>>>,
    repeat: Option<ChatResponse>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    hooks: Mutex<Vec<(usize, Hook)>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<ChatResponse, ErrorInfo>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with `response`.
    pub fn repeating(response: ChatResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(Vec::new())
        }
    }

    /// Run `hook` when call number `call` (1-based) arrives, before it is answered.
    pub fn on_call(&self, call: usize, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.lock().push((call, Box::new(hook)));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelProviderClient for ScriptedProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ErrorInfo> {
        Ok(self.chat_with_tools(messages, &[]).await?.content)
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ErrorInfo> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(messages.to_vec());
            requests.len()
        };
        for (at, hook) in self.hooks.lock().iter() {
            if *at == call {
                hook();
            }
        }
        if let Some(response) = &self.repeat {
            return Ok(response.clone());
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(text("(script exhausted)")))
    }

    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn model_id(&self) -> &str {
        MODEL_ID
    }
}

/// Tool worker that records calls and answers from a fixed responder.
pub struct ScriptedWorker {
    calls: Mutex<Vec<(String, Value)>>,
    responder: Box<dyn Fn(&str, &Value) -> Result<Value, ToolWorkerError> + Send + Sync>,
}

impl ScriptedWorker {
    pub fn ok() -> Self {
        Self::with(|_, _| Ok(json!({ "ok": true })))
    }

    pub fn with(
        responder: impl Fn(&str, &Value) -> Result<Value, ToolWorkerError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ToolWorker for ScriptedWorker {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ToolWorkerError> {
        let result = (self.responder)(method, &params);
        self.calls.lock().push((method.to_string(), params));
        result
    }
}

/// Keeps every notification in order.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.seen.lock().iter().map(|n| n.method()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().push(notification);
    }
}

/// Engine wired to a scripted provider and worker over a temp directory.
pub struct Bench {
    pub dir: TempDir,
    pub engine: Arc<Engine>,
    pub provider: Arc<ScriptedProvider>,
    pub worker: Arc<ScriptedWorker>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig {
        workbenches_dir: Some(dir.path().join("workbenches")),
        ..Default::default()
    };
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.agent.tool_timeout_ms = 5_000;
    config
}

impl Bench {
    pub fn new(provider: ScriptedProvider) -> Self {
        Self::with_worker(provider, ScriptedWorker::ok())
    }

    pub fn with_worker(provider: ScriptedProvider, worker: ScriptedWorker) -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        Self::with_config(dir, config, provider, worker)
    }

    pub fn with_config(
        dir: TempDir,
        config: EngineConfig,
        provider: ScriptedProvider,
        worker: ScriptedWorker,
    ) -> Self {
        let provider = Arc::new(provider);
        let worker = Arc::new(worker);
        let notifier = Arc::new(RecordingNotifier::default());
        let mut providers = ProviderRegistry::new();
        providers.register(PROVIDER_ID, provider.clone());
        let engine = Engine::new(config, providers, worker.clone(), notifier.clone()).unwrap();
        Self {
            dir,
            engine: Arc::new(engine),
            provider,
            worker,
            notifier,
        }
    }

    /// Source file outside the workbenches directory.
    pub fn source(&self, name: &str, content: &str) -> PathBuf {
        let sources = self.dir.path().join("sources");
        std::fs::create_dir_all(&sources).unwrap();
        let path = sources.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Workbench holding `files` in Published.
    pub async fn workbench_with(&self, files: &[(&str, &str)]) -> WorkbenchId {
        let id = self.engine.create_workbench("test").unwrap().id;
        if !files.is_empty() {
            let sources: Vec<PathBuf> = files
                .iter()
                .map(|(name, content)| self.source(name, content))
                .collect();
            self.engine.add_files(&id, &sources).await.unwrap();
        }
        id
    }

    pub fn grant(&self, id: &WorkbenchId) {
        let status = self.engine.consent_status(id, PROVIDER_ID).unwrap();
        self.engine
            .grant_consent(id, PROVIDER_ID, &status.scope_hash, false)
            .unwrap();
    }

    pub fn published(&self, id: &WorkbenchId) -> PathBuf {
        self.engine.store().paths(id).published()
    }

    pub fn draft(&self, id: &WorkbenchId) -> PathBuf {
        self.engine.store().paths(id).draft()
    }

    /// Cancel the active run on `id` when the provider receives call number `call`.
    pub fn cancel_on_call(&self, id: &WorkbenchId, call: usize) {
        let engine: Weak<Engine> = Arc::downgrade(&self.engine);
        let id = id.clone();
        self.provider.on_call(call, move || {
            if let Some(engine) = engine.upgrade() {
                engine.cancel_run(&id);
            }
        });
    }
}

/// Every relative file path under `root`, sorted.
pub fn tree_files(root: &std::path::Path) -> Vec<String> {
    if !root.exists() {
        return Vec::new();
    }
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}
