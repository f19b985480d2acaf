//! JSON-RPC 2.0 over stdio
//!
//! One JSON object per line in each direction. Every request runs as its own task; responses and
//! engine notifications share one writer so lines never interleave. Engine failures are JSON-RPC
//! errors with code `-32000` and the [`ErrorInfo`] as `data`.

use crate::engine::Engine;
use crate::error::{ErrorInfo, InPhase, Phase};
use crate::notify::{Notification, Notifier};
use crate::store::Tree;
use crate::types::WorkbenchId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const ENGINE_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default, rename = "jsonrpc")]
    _jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
}

pub fn response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn error_response(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

pub fn notification(n: &Notification) -> Value {
    json!({ "jsonrpc": "2.0", "method": n.method(), "params": n.params() })
}

/// Forwards engine notifications to the connection writer.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("Notification dropped, no listener");
        }
    }
}

#[derive(Debug)]
pub enum RpcFailure {
    MethodNotFound,
    Engine(ErrorInfo),
}

impl From<ErrorInfo> for RpcFailure {
    fn from(info: ErrorInfo) -> Self {
        RpcFailure::Engine(info)
    }
}

#[derive(Deserialize)]
struct Empty {}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct WorkbenchParams {
    workbench_id: String,
}

#[derive(Deserialize)]
struct FilesAddParams {
    workbench_id: String,
    paths: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct FilesListParams {
    workbench_id: String,
    #[serde(default)]
    tree: Option<Tree>,
}

#[derive(Deserialize)]
struct PublishParams {
    workbench_id: String,
    #[serde(default)]
    confirm_deletions: bool,
}

#[derive(Deserialize)]
struct CheckpointParams {
    workbench_id: String,
    checkpoint_id: String,
}

#[derive(Deserialize)]
struct CheckpointCreateParams {
    workbench_id: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct RunAgentParams {
    workbench_id: String,
    provider_id: String,
    message: String,
}

#[derive(Deserialize)]
struct UndoParams {
    workbench_id: String,
    message_id: String,
}

#[derive(Deserialize)]
struct ProviderParams {
    workbench_id: String,
    provider_id: String,
}

#[derive(Deserialize)]
struct GrantParams {
    workbench_id: String,
    provider_id: String,
    scope_hash: String,
    #[serde(default)]
    persist: bool,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, ErrorInfo> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| {
        debug!(error = %e, "Rejected params");
        ErrorInfo::validation(Phase::Workbench, "invalid params")
    })
}

fn workbench(raw: &str) -> Result<WorkbenchId, ErrorInfo> {
    WorkbenchId::parse(raw).in_phase(Phase::Workbench)
}

fn encode<T: Serialize>(value: T) -> Result<Value, RpcFailure> {
    serde_json::to_value(value).map_err(|e| {
        RpcFailure::Engine(ErrorInfo::validation(
            Phase::Workbench,
            format!("failed to encode result: {e}"),
        ))
    })
}

/// Route one method call to the engine.
pub async fn dispatch(engine: &Engine, method: &str, params: Value) -> Result<Value, RpcFailure> {
    match method {
        "WorkbenchCreate" => {
            let p: NameParams = parse(params)?;
            encode(engine.create_workbench(&p.name)?)
        }
        "WorkbenchList" => {
            let _: Empty = parse(params)?;
            encode(engine.list_workbenches()?)
        }
        "WorkbenchDelete" => {
            let p: WorkbenchParams = parse(params)?;
            engine.delete_workbench(&workbench(&p.workbench_id)?).await?;
            Ok(json!({ "deleted": true }))
        }
        "WorkbenchFilesAdd" => {
            let p: FilesAddParams = parse(params)?;
            encode(
                engine
                    .add_files(&workbench(&p.workbench_id)?, &p.paths)
                    .await?,
            )
        }
        "WorkbenchFilesList" => {
            let p: FilesListParams = parse(params)?;
            let tree = p.tree.unwrap_or(Tree::Published);
            encode(engine.list_files(&workbench(&p.workbench_id)?, tree)?)
        }
        "DraftGetState" => {
            let p: WorkbenchParams = parse(params)?;
            encode(engine.draft_state(&workbench(&p.workbench_id)?)?)
        }
        "DraftCreate" => {
            let p: WorkbenchParams = parse(params)?;
            encode(engine.create_draft(&workbench(&p.workbench_id)?).await?)
        }
        "DraftPublish" => {
            let p: PublishParams = parse(params)?;
            encode(
                engine
                    .publish(&workbench(&p.workbench_id)?, p.confirm_deletions)
                    .await?,
            )
        }
        "DraftDiscard" => {
            let p: WorkbenchParams = parse(params)?;
            let discarded = engine.discard(&workbench(&p.workbench_id)?).await?;
            Ok(json!({ "discarded": discarded }))
        }
        "CheckpointsList" => {
            let p: WorkbenchParams = parse(params)?;
            encode(engine.list_checkpoints(&workbench(&p.workbench_id)?)?)
        }
        "CheckpointGet" => {
            let p: CheckpointParams = parse(params)?;
            encode(engine.get_checkpoint(&workbench(&p.workbench_id)?, &p.checkpoint_id)?)
        }
        "CheckpointCreate" => {
            let p: CheckpointCreateParams = parse(params)?;
            encode(
                engine
                    .create_checkpoint(&workbench(&p.workbench_id)?, &p.description)
                    .await?,
            )
        }
        "CheckpointRestore" => {
            let p: CheckpointParams = parse(params)?;
            encode(
                engine
                    .restore_checkpoint(&workbench(&p.workbench_id)?, &p.checkpoint_id)
                    .await?,
            )
        }
        "WorkshopRunAgent" => {
            let p: RunAgentParams = parse(params)?;
            encode(
                engine
                    .run_agent(&workbench(&p.workbench_id)?, &p.provider_id, &p.message)
                    .await?,
            )
        }
        "WorkshopCancelRun" => {
            let p: WorkbenchParams = parse(params)?;
            let canceled = engine.cancel_run(&workbench(&p.workbench_id)?);
            Ok(json!({ "canceled": canceled }))
        }
        "WorkshopUndoToMessage" => {
            let p: UndoParams = parse(params)?;
            encode(
                engine
                    .undo_to_message(&workbench(&p.workbench_id)?, &p.message_id)
                    .await?,
            )
        }
        "WorkshopGetConversation" => {
            let p: WorkbenchParams = parse(params)?;
            encode(engine.conversation(&workbench(&p.workbench_id)?)?)
        }
        "EgressGetConsentStatus" => {
            let p: ProviderParams = parse(params)?;
            encode(engine.consent_status(&workbench(&p.workbench_id)?, &p.provider_id)?)
        }
        "EgressGrantWorkshopConsent" => {
            let p: GrantParams = parse(params)?;
            encode(engine.grant_consent(
                &workbench(&p.workbench_id)?,
                &p.provider_id,
                &p.scope_hash,
                p.persist,
            )?)
        }
        "EgressRevokeWorkshopConsent" => {
            let p: ProviderParams = parse(params)?;
            let revoked = engine.revoke_consent(&workbench(&p.workbench_id)?, &p.provider_id)?;
            Ok(json!({ "revoked": revoked }))
        }
        "EgressListEvents" => {
            let p: WorkbenchParams = parse(params)?;
            encode(engine.egress_events(&workbench(&p.workbench_id)?)?)
        }
        _ => Err(RpcFailure::MethodNotFound),
    }
}

/// Handle one request line. `None` for client notifications, which get no response.
pub async fn handle_line(engine: &Engine, line: &str) -> Option<Value> {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Unparseable request");
            return Some(error_response(Value::Null, PARSE_ERROR, "parse error", None));
        }
    };
    let method = request.method;
    let outcome = dispatch(engine, &method, request.params.unwrap_or(Value::Null)).await;
    let id = request.id?;
    Some(match outcome {
        Ok(result) => response(id, result),
        Err(RpcFailure::MethodNotFound) => error_response(
            id,
            METHOD_NOT_FOUND,
            &format!("method not found: {method}"),
            None,
        ),
        Err(RpcFailure::Engine(info)) => {
            debug!(method = %method, code = %info.code(), "Request failed");
            let data = serde_json::to_value(&info).ok();
            error_response(id, ENGINE_ERROR, &info.to_string(), data)
        }
    })
}

/// Serve requests from `input` until it closes, writing responses and notifications to `output`.
pub async fn serve<R, W>(
    engine: Arc<Engine>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let notify_tx = out_tx.clone();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let forwarder = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                next = notifications.recv() => match next {
                    Some(n) => {
                        let _ = notify_tx.send(notification(&n).to_string());
                    }
                    None => break,
                },
                _ = &mut stop_rx => {
                    while let Ok(n) = notifications.try_recv() {
                        let _ = notify_tx.send(notification(&n).to_string());
                    }
                    break;
                }
            }
        }
    });

    info!("RPC server listening on stdio");
    let mut requests = JoinSet::new();
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let engine = Arc::clone(&engine);
        let tx = out_tx.clone();
        requests.spawn(async move {
            if let Some(reply) = handle_line(&engine, &line).await {
                let _ = tx.send(reply.to_string());
            }
        });
        while requests.try_join_next().is_some() {}
    }

    while requests.join_next().await.is_some() {}
    let _ = stop_tx.send(());
    if let Err(e) = forwarder.await {
        warn!(error = %e, "Notification forwarder failed");
    }
    drop(out_tx);
    match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
    }
}
