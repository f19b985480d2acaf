//! Agentic tool-use loop
//!
//! One run answers one user message. Each turn is an explicit state machine:
//!
//! ```text
//! AwaitingModel -> StreamingText? -> ExecutingTools -> AwaitingModel -> ... -> Done
//! ```
//!
//! with `Aborted` reachable from any live state. The model is only reached through a
//! [`GatedClient`]; write tools never touch the disk directly but are planned, grouped into
//! batches of consecutive writes, and handed to the [`BatchExecutor`].

pub mod batch;
pub mod cancel;
pub mod loop_detect;

pub use cancel::CancelToken;

use crate::consent::GatedClient;
use crate::conversation::{ConversationEntry, ConversationLog, EntryType};
use crate::draft::DraftManager;
use crate::error::{ErrorCode, ErrorInfo, InPhase, Phase};
use crate::notify::{Notification, Notifier};
use crate::provider::{ChatMessage, ChatResponse, ToolCall};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::WorkbenchStore;
use crate::tools::{ToolContext, ToolHandler, ToolRegistry};
use crate::toolworker::ToolWorker;
use crate::types::WorkbenchId;
use batch::{BatchCall, BatchExecutor};
use loop_detect::{LoopDetector, LoopVerdict};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_SYSTEM_PROMPT: &str = "You are working inside a workbench of user files. \
Use the tools to inspect files. Every change you make lands in a draft that the user reviews \
before publishing; you cannot modify published files directly.";

/// Per-turn limits and loop detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLimits {
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls_per_turn: usize,
    #[serde(default = "default_max_round_trips")]
    pub max_round_trips: usize,
    /// Number of recent calls the loop detector remembers
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,
    #[serde(default = "default_loop_warn")]
    pub loop_warn_threshold: usize,
    #[serde(default = "default_loop_stop")]
    pub loop_stop_threshold: usize,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_tool_calls() -> usize {
    50
}

fn default_max_round_trips() -> usize {
    50
}

fn default_loop_window() -> usize {
    10
}

fn default_loop_warn() -> usize {
    3
}

fn default_loop_stop() -> usize {
    5
}

fn default_tool_timeout_ms() -> u64 {
    60_000
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_tool_calls_per_turn: default_max_tool_calls(),
            max_round_trips: default_max_round_trips(),
            loop_window: default_loop_window(),
            loop_warn_threshold: default_loop_warn(),
            loop_stop_threshold: default_loop_stop(),
            tool_timeout_ms: default_tool_timeout_ms(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl AgentLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tool_calls_per_turn == 0 || self.max_round_trips == 0 {
            return Err("max_tool_calls_per_turn and max_round_trips must be positive".to_string());
        }
        if self.loop_warn_threshold == 0 || self.loop_warn_threshold >= self.loop_stop_threshold {
            return Err(format!(
                "loop_warn_threshold ({}) must be positive and below loop_stop_threshold ({})",
                self.loop_warn_threshold, self.loop_stop_threshold
            ));
        }
        if self.loop_stop_threshold > self.loop_window {
            return Err(format!(
                "loop_stop_threshold ({}) cannot exceed loop_window ({})",
                self.loop_stop_threshold, self.loop_window
            ));
        }
        if self.tool_timeout_ms == 0 {
            return Err("tool_timeout_ms must be positive".to_string());
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    AwaitingModel,
    StreamingText,
    ExecutingTools,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    TextReceived,
    ToolCallsReceived,
    ResponseComplete,
    ToolsFinished,
    Abort,
}

/// Turn transition table. `None` means the event is not valid in `state`.
pub fn next_state(state: TurnState, event: TurnEvent) -> Option<TurnState> {
    use TurnEvent::*;
    use TurnState::*;
    match (state, event) {
        (Done | Aborted, _) => None,
        (_, Abort) => Some(Aborted),
        (AwaitingModel, TextReceived) => Some(StreamingText),
        (AwaitingModel | StreamingText, ToolCallsReceived) => Some(ExecutingTools),
        (AwaitingModel | StreamingText, ResponseComplete) => Some(Done),
        (ExecutingTools, ToolsFinished) => Some(AwaitingModel),
        _ => None,
    }
}

fn advance(state: TurnState, event: TurnEvent) -> Result<TurnState, ErrorInfo> {
    next_state(state, event).ok_or_else(|| {
        ErrorInfo::validation(
            Phase::Workshop,
            format!("invalid turn transition {event:?} from {state:?}"),
        )
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub text: String,
    pub round_trips: usize,
    pub tool_calls: usize,
    pub batches: usize,
}

#[derive(Debug, Default)]
struct TurnSummary {
    text: String,
    round_trips: usize,
    tool_calls: usize,
    batches: usize,
}

/// Runs agent turns for every workbench of one store.
#[derive(Clone)]
pub struct AgentRunner {
    store: WorkbenchStore,
    drafts: DraftManager,
    tools: Arc<ToolRegistry>,
    worker: Arc<dyn ToolWorker>,
    executor: BatchExecutor,
    limits: AgentLimits,
    retry: RetryPolicy,
    notifier: Arc<dyn Notifier>,
}

impl AgentRunner {
    pub fn new(
        store: WorkbenchStore,
        drafts: DraftManager,
        tools: Arc<ToolRegistry>,
        worker: Arc<dyn ToolWorker>,
        limits: AgentLimits,
        retry: RetryPolicy,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let executor = BatchExecutor::new(
            store.clone(),
            drafts.clone(),
            Arc::clone(&worker),
            limits.tool_timeout(),
        );
        Self {
            store,
            drafts,
            tools,
            worker,
            executor,
            limits,
            retry,
            notifier,
        }
    }

    /// Answer `message`, recording the exchange and a draft revision for each side of it.
    pub async fn run(
        &self,
        id: &WorkbenchId,
        client: &GatedClient,
        message: &str,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ErrorInfo> {
        if message.trim().is_empty() {
            return Err(ErrorInfo::validation(Phase::Workshop, "message is required"));
        }
        let paths = self.store.require(id).in_phase(Phase::Workshop)?;
        let log = ConversationLog::new(paths.conversation());
        let history = log.load().in_phase(Phase::Workshop)?;

        let user = ConversationEntry::user(message);
        log.append(&user).in_phase(Phase::Workshop)?;
        self.drafts
            .record_revision(id, &user.message_id)
            .in_phase(Phase::Workshop)?;
        info!(
            workbench_id = %id,
            message_id = %user.message_id,
            provider_id = client.provider_id(),
            model_id = client.model_id(),
            "Agent run started"
        );

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.limits.system_prompt.clone()));
        messages.extend(history.iter().filter_map(|entry| match entry.entry_type {
            EntryType::UserMessage => Some(ChatMessage::user(entry.text.clone())),
            EntryType::AssistantMessage => Some(ChatMessage::assistant(entry.text.clone())),
            EntryType::SystemEvent => None,
        }));
        messages.push(ChatMessage::user(message));

        match self
            .turn(id, &log, &user.message_id, client, messages, cancel)
            .await
        {
            Ok(summary) => {
                let assistant = ConversationEntry::assistant(summary.text.clone());
                log.append(&assistant).in_phase(Phase::Workshop)?;
                self.drafts
                    .record_revision(id, &assistant.message_id)
                    .in_phase(Phase::Workshop)?;
                info!(
                    workbench_id = %id,
                    round_trips = summary.round_trips,
                    tool_calls = summary.tool_calls,
                    batches = summary.batches,
                    "Agent run finished"
                );
                Ok(RunOutcome {
                    user_message_id: user.message_id,
                    assistant_message_id: assistant.message_id,
                    text: summary.text,
                    round_trips: summary.round_trips,
                    tool_calls: summary.tool_calls,
                    batches: summary.batches,
                })
            }
            Err((e, aborted_from)) => {
                let event = if e.code() == ErrorCode::UserCanceled {
                    info!(workbench_id = %id, "Agent run canceled");
                    ConversationEntry::system_event("run_canceled", "Run canceled")
                        .with_metadata(json!({ "aborted_from": aborted_from }))
                } else {
                    warn!(workbench_id = %id, code = %e.code(), detail = %e.detail, "Agent run failed");
                    ConversationEntry::system_event("run_failed", e.detail.clone()).with_metadata(
                        json!({ "error_code": e.code(), "aborted_from": aborted_from }),
                    )
                };
                if let Err(log_err) = log.append(&event) {
                    warn!(workbench_id = %id, error = %log_err, "Failed to record run outcome");
                }
                Err(e)
            }
        }
    }

    /// Drive one turn to `Done`. A failed turn takes the `Abort` edge and
    /// reports the state it left alongside the error.
    async fn turn(
        &self,
        id: &WorkbenchId,
        log: &ConversationLog,
        message_id: &str,
        client: &GatedClient,
        messages: Vec<ChatMessage>,
        cancel: &CancelToken,
    ) -> Result<TurnSummary, (ErrorInfo, TurnState)> {
        let mut state = TurnState::AwaitingModel;
        let result = self
            .drive(id, log, message_id, client, messages, cancel, &mut state)
            .await;
        result.map_err(|e| {
            match advance(state, TurnEvent::Abort) {
                Ok(aborted) => debug!(workbench_id = %id, from = ?state, to = ?aborted, "Turn aborted"),
                Err(invalid) => warn!(workbench_id = %id, detail = %invalid.detail, "Turn ended outside a live state"),
            }
            (e, state)
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        id: &WorkbenchId,
        log: &ConversationLog,
        message_id: &str,
        client: &GatedClient,
        mut messages: Vec<ChatMessage>,
        cancel: &CancelToken,
        state: &mut TurnState,
    ) -> Result<TurnSummary, ErrorInfo> {
        let definitions = self.tools.definitions();
        let mut detector = LoopDetector::new(
            self.limits.loop_window,
            self.limits.loop_warn_threshold,
            self.limits.loop_stop_threshold,
        );
        let mut summary = TurnSummary::default();

        loop {
            if cancel.is_canceled() {
                return Err(ErrorInfo::canceled(Phase::Workshop));
            }
            if summary.round_trips >= self.limits.max_round_trips {
                return Err(ErrorInfo::loop_detected(format!(
                    "model round-trip limit of {} reached",
                    self.limits.max_round_trips
                )));
            }
            summary.round_trips += 1;

            let response = self
                .call_model(client, &messages, &definitions, cancel)
                .await?;
            debug!(
                workbench_id = %id,
                round_trip = summary.round_trips,
                tool_calls = response.tool_calls.len(),
                "Model responded"
            );

            if !response.content.is_empty() {
                *state = advance(*state, TurnEvent::TextReceived)?;
                self.notifier.notify(Notification::AssistantText {
                    workbench_id: id.to_string(),
                    text: response.content.clone(),
                });
                if !summary.text.is_empty() {
                    summary.text.push_str("\n\n");
                }
                summary.text.push_str(&response.content);
            }

            if response.tool_calls.is_empty() {
                *state = advance(*state, TurnEvent::ResponseComplete)?;
                return Ok(summary);
            }
            *state = advance(*state, TurnEvent::ToolCallsReceived)?;

            summary.tool_calls += response.tool_calls.len();
            if summary.tool_calls > self.limits.max_tool_calls_per_turn {
                return Err(ErrorInfo::loop_detected(format!(
                    "more than {} tool calls in one turn",
                    self.limits.max_tool_calls_per_turn
                )));
            }
            for call in &response.tool_calls {
                match detector.observe(&call.name, &call.arguments) {
                    LoopVerdict::Ok => {}
                    LoopVerdict::Warn { repeats } => self.loop_warning(id, log, &call.name, repeats),
                    LoopVerdict::Stop { repeats } => {
                        return Err(ErrorInfo::loop_detected(format!(
                            "{} repeated {repeats} times with the same arguments",
                            call.name
                        )));
                    }
                }
            }

            let calls = response.tool_calls.clone();
            messages.push(ChatMessage::assistant_with_calls(
                response.content,
                response.tool_calls,
            ));

            let mut index = 0;
            while index < calls.len() {
                if cancel.is_canceled() {
                    return Err(ErrorInfo::canceled(Phase::Workshop));
                }
                if self.tools.is_write(&calls[index].name) {
                    let start = index;
                    while index < calls.len() && self.tools.is_write(&calls[index].name) {
                        index += 1;
                    }
                    let group = &calls[start..index];
                    let results = self.run_batch(id, message_id, group).await;
                    summary.batches += 1;
                    for (call, result) in group.iter().zip(results) {
                        messages.push(ChatMessage::tool_result(&call.id, render(&result)));
                    }
                } else {
                    let call = &calls[index];
                    let result = self.run_read(id, call).await;
                    messages.push(ChatMessage::tool_result(&call.id, render(&result)));
                    index += 1;
                }
            }
            *state = advance(*state, TurnEvent::ToolsFinished)?;
        }
    }

    async fn call_model(
        &self,
        client: &GatedClient,
        messages: &[ChatMessage],
        definitions: &[crate::provider::ToolDefinition],
        cancel: &CancelToken,
    ) -> Result<ChatResponse, ErrorInfo> {
        let request = with_retry(&self.retry, Some(cancel), Phase::Workshop, move |attempt| {
            if attempt > 1 {
                debug!(attempt, "Retrying model call");
            }
            client.chat_with_tools(messages, definitions)
        });
        tokio::select! {
            _ = cancel.canceled() => Err(ErrorInfo::canceled(Phase::Workshop)),
            response = request => response,
        }
    }

    fn loop_warning(&self, id: &WorkbenchId, log: &ConversationLog, tool: &str, repeats: usize) {
        warn!(workbench_id = %id, tool, repeats, "Repeated tool call detected");
        self.notifier.notify(Notification::AgentLoopWarning {
            workbench_id: id.to_string(),
            tool: tool.to_string(),
            repeats,
        });
        let entry = ConversationEntry::system_event(
            "loop_warning",
            format!("{tool} called {repeats} times with the same arguments"),
        )
        .with_metadata(json!({ "tool": tool, "repeats": repeats }));
        if let Err(e) = log.append(&entry) {
            warn!(workbench_id = %id, error = %e, "Failed to record loop warning");
        }
    }

    async fn run_read(&self, id: &WorkbenchId, call: &ToolCall) -> Result<Value, ErrorInfo> {
        self.notifier.notify(Notification::ToolExecuting {
            workbench_id: id.to_string(),
            tool_call_id: call.id.clone(),
            tool: call.name.clone(),
        });
        let result = self.read_inner(id, call).await;
        self.notifier.notify(Notification::ToolComplete {
            workbench_id: id.to_string(),
            tool_call_id: call.id.clone(),
            tool: call.name.clone(),
            ok: result.is_ok(),
            error: result.as_ref().err().cloned(),
        });
        result
    }

    async fn read_inner(&self, id: &WorkbenchId, call: &ToolCall) -> Result<Value, ErrorInfo> {
        self.tools.check_args(&call.name, &call.arguments)?;
        let Some(ToolHandler::Read(tool)) = self.tools.get(&call.name) else {
            return Err(ErrorInfo::validation(
                Phase::Workshop,
                format!("{} is not a read tool", call.name),
            ));
        };
        let ctx = ToolContext {
            store: self.store.clone(),
            worker: Arc::clone(&self.worker),
            workbench_id: id.clone(),
        };
        let timeout = self.limits.tool_timeout();
        match tokio::time::timeout(timeout, tool.run(&ctx, &call.arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ErrorInfo::file_read(
                Phase::Workshop,
                format!("{} timed out after {}ms", call.name, timeout.as_millis()),
            )),
        }
    }

    /// Plan every call, then apply them as one batch. Returns one result per call.
    async fn run_batch(
        &self,
        id: &WorkbenchId,
        message_id: &str,
        group: &[ToolCall],
    ) -> Vec<Result<Value, ErrorInfo>> {
        let planned: Result<Vec<BatchCall>, ErrorInfo> = group
            .iter()
            .map(|call| {
                self.tools.check_args(&call.name, &call.arguments)?;
                let Some(ToolHandler::Write(tool)) = self.tools.get(&call.name) else {
                    return Err(ErrorInfo::validation(
                        Phase::Workshop,
                        format!("{} is not a write tool", call.name),
                    ));
                };
                Ok(BatchCall {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    op: tool.plan(&call.arguments, self.store.limits())?,
                })
            })
            .collect();

        let outcome = match planned {
            Ok(calls) => {
                self.executor
                    .apply(id, message_id, &calls, self.notifier.as_ref())
                    .await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(outcome) => outcome.results,
            Err(rejected) => {
                warn!(
                    workbench_id = %id,
                    calls = group.len(),
                    code = %rejected.code(),
                    detail = %rejected.detail,
                    "Batch rejected"
                );
                group
                    .iter()
                    .map(|call| {
                        self.notifier.notify(Notification::ToolComplete {
                            workbench_id: id.to_string(),
                            tool_call_id: call.id.clone(),
                            tool: call.name.clone(),
                            ok: false,
                            error: Some(rejected.clone()),
                        });
                        Err(rejected.clone())
                    })
                    .collect()
            }
        }
    }
}

/// Tool result message body.
fn render(result: &Result<Value, ErrorInfo>) -> String {
    match result {
        Ok(value) => value.to_string(),
        Err(e) => json!({ "error": e }).to_string(),
    }
}
