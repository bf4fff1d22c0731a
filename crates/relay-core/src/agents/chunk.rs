//! Output chunks streamed by an agent worker.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::worker::WorkerError;

/// A stream of chunks from one agent run.
pub type ChunkStream = BoxStream<'static, Result<AgentChunk, WorkerError>>;

/// A tool call the agent will not run until someone approves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequestChunk {
    /// Id the decision must be posted against.
    pub approval_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// One unit of agent output, newline-delimited JSON on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum AgentChunk {
    /// The worker assigned a run id; resumes are addressed to it.
    RunStarted { run_id: String },

    /// Streaming assistant text.
    TextDelta { delta: String },

    /// The agent is calling a tool that needs no approval.
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: serde_json::Value,
    },

    /// The agent paused on an approval gate.
    ToolCallApproval(ApprovalRequestChunk),

    /// A tool finished.
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        output: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },

    /// The run finished normally.
    Finish,

    /// The worker reported an error in-band.
    Error { message: String },
}

impl AgentChunk {
    pub fn approval_request(&self) -> Option<&ApprovalRequestChunk> {
        match self {
            AgentChunk::ToolCallApproval(request) => Some(request),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_format() {
        let chunk: AgentChunk = serde_json::from_value(json!({
            "type": "tool-call-approval",
            "approvalId": "approval-1",
            "toolCallId": "call-1",
            "toolName": "write_file",
            "input": {"path": "src/lib.rs"}
        }))
        .unwrap();

        let request = chunk.approval_request().expect("approval chunk");
        assert_eq!(request.approval_id, "approval-1");
        assert_eq!(request.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(request.tool_name, "write_file");
    }

    #[test]
    fn unit_and_struct_variants_use_kebab_tags() {
        assert_eq!(
            serde_json::to_value(AgentChunk::Finish).unwrap(),
            json!({"type": "finish"})
        );
        assert_eq!(
            serde_json::to_value(AgentChunk::RunStarted {
                run_id: "run-1".to_string()
            })
            .unwrap(),
            json!({"type": "run-started", "runId": "run-1"})
        );
    }

    #[test]
    fn tool_result_defaults_is_error() {
        let chunk: AgentChunk =
            serde_json::from_str(r#"{"type":"tool-result","toolCallId":"c1","output":"ok"}"#)
                .unwrap();
        assert_eq!(
            chunk,
            AgentChunk::ToolResult {
                tool_call_id: "c1".to_string(),
                output: json!("ok"),
                is_error: false,
            }
        );
    }

    #[test]
    fn non_approval_chunks_have_no_request() {
        let chunk = AgentChunk::TextDelta {
            delta: "hi".to_string(),
        };
        assert!(chunk.approval_request().is_none());
    }
}
