//! HTTP client side of the agent worker interface.
//!
//! Workers answer an invocation with newline-delimited JSON [`AgentChunk`]s.
//! The response body is read on a dedicated thread (ureq is blocking) and
//! handed to async consumers through a bounded channel, so a slow consumer
//! applies backpressure to the worker connection instead of buffering without
//! limit.

use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};

use super::chunk::{AgentChunk, ChunkStream};
use super::{AgentRegistration, AgentTrigger};
use crate::client::ClientSessionContext;
use crate::forwarder::join_url;
use crate::session::SessionId;

/// Default time allowed to establish a connection to a worker.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chunks buffered between the reader thread and the consumer.
const CHUNK_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("agent responded with {status} {status_text}")]
    Status { status: u16, status_text: String },

    #[error("agent unreachable: {0}")]
    Transport(String),

    #[error("invalid agent chunk: {0}")]
    Decode(String),

    #[error("agent stream aborted: {0}")]
    Stream(String),
}

impl From<ureq::Error> for WorkerError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => WorkerError::Status {
                status,
                status_text: response.status_text().to_string(),
            },
            ureq::Error::Transport(transport) => WorkerError::Transport(transport.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One entry of the conversation history sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
}

impl HistoryMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Everything needed to invoke an agent for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub session_id: SessionId,
    pub messages: Vec<HistoryMessage>,
    pub trigger: AgentTrigger,
    pub message_id: Option<String>,
}

impl InvocationRequest {
    /// Build the request body: the registration template with the invocation
    /// fields layered on top.
    pub fn to_body(&self, template: &Value) -> Value {
        let mut body = match template {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        body.insert("sessionId".to_string(), json!(self.session_id));
        body.insert("messages".to_string(), json!(self.messages));
        body.insert("trigger".to_string(), json!(self.trigger));
        if let Some(message_id) = &self.message_id {
            body.insert("messageId".to_string(), json!(message_id));
        }
        Value::Object(body)
    }
}

/// Starts agent runs.
#[async_trait::async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentRegistration,
        request: InvocationRequest,
    ) -> Result<ChunkStream, WorkerError>;
}

/// Approve-or-decline a paused run and continue streaming it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeCall {
    pub run_id: String,
    pub approval_id: Option<String>,
    pub approved: bool,
    pub context: ClientSessionContext,
}

/// The primitive the client drain loop uses to continue a suspended run.
#[async_trait::async_trait]
pub trait RunResumer: Send + Sync {
    async fn resume(&self, call: ResumeCall) -> Result<ChunkStream, WorkerError>;
}

/// Invokes agents over HTTP.
#[derive(Clone)]
pub struct HttpAgentWorker {
    http: ureq::Agent,
}

impl HttpAgentWorker {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            http: ureq::AgentBuilder::new()
                .timeout_connect(connect_timeout)
                .build(),
        }
    }
}

impl Default for HttpAgentWorker {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl AgentInvoker for HttpAgentWorker {
    async fn invoke(
        &self,
        agent: &AgentRegistration,
        request: InvocationRequest,
    ) -> Result<ChunkStream, WorkerError> {
        let body = request.to_body(&agent.body_template);
        log::info!(
            "Invoking agent {} for session {} ({:?})",
            agent.id,
            request.session_id,
            request.trigger
        );
        open_ndjson_stream(self.http.clone(), agent.endpoint.clone(), body).await
    }
}

/// Resumes runs on one worker via `POST {endpoint}/runs/{runId}/resume`.
#[derive(Clone)]
pub struct HttpRunResumer {
    endpoint: String,
    http: ureq::Agent,
}

impl HttpRunResumer {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: ureq::AgentBuilder::new()
                .timeout_connect(connect_timeout)
                .build(),
        }
    }
}

#[async_trait::async_trait]
impl RunResumer for HttpRunResumer {
    async fn resume(&self, call: ResumeCall) -> Result<ChunkStream, WorkerError> {
        let url = join_url(&self.endpoint, &format!("runs/{}/resume", call.run_id));
        let body = json!({
            "approvalId": call.approval_id,
            "approved": call.approved,
            "context": call.context,
        });
        log::info!(
            "Resuming run {} (approved: {}) at {}",
            call.run_id,
            call.approved,
            url
        );
        open_ndjson_stream(self.http.clone(), url, body).await
    }
}

/// POST `body` to `url` and stream the NDJSON response.
///
/// Resolves once the worker has answered with a success status, so HTTP-level
/// rejections surface as an error here rather than inside the stream.
async fn open_ndjson_stream(
    http: ureq::Agent,
    url: String,
    body: Value,
) -> Result<ChunkStream, WorkerError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);

    std::thread::spawn(move || {
        match http
            .post(&url)
            .set("Accept", "application/x-ndjson")
            .send_json(body)
        {
            Ok(response) => {
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                pump_lines(response.into_reader(), &chunk_tx);
            }
            Err(err) => {
                let _ = ready_tx.send(Err(WorkerError::from(err)));
            }
        }
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok(receiver_stream(chunk_rx)),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(WorkerError::Stream(
            "worker connection thread exited".to_string(),
        )),
    }
}

/// Read NDJSON lines and push parsed chunks until EOF, a fatal error, or the
/// consumer going away. Must run off the async runtime.
fn pump_lines(reader: impl Read, tx: &mpsc::Sender<Result<AgentChunk, WorkerError>>) {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let item = match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                serde_json::from_str::<AgentChunk>(trimmed)
                    .map_err(|e| WorkerError::Decode(format!("{e}: {trimmed}")))
            }
            Err(e) => Err(WorkerError::Stream(e.to_string())),
        };

        let fatal = item.is_err();
        if tx.blocking_send(item).is_err() {
            log::debug!("Chunk consumer dropped, closing agent stream");
            break;
        }
        if fatal {
            break;
        }
    }
}

fn receiver_stream(rx: mpsc::Receiver<Result<AgentChunk, WorkerError>>) -> ChunkStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}
