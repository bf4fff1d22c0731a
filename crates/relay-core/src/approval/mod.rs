//! Client-side approval policy.
//!
//! Decides whether a pending tool-call approval can be resolved locally or has
//! to wait for a human, based on the session's [`PermissionMode`].

mod edit_tools;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use edit_tools::EDIT_TOOLS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Every approval waits for a human.
    #[default]
    Default,
    /// File edits are approved automatically.
    AcceptEdits,
    /// Everything is approved automatically.
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            other => Err(format!("unknown permission mode: {other}")),
        }
    }
}

/// What to do with a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    AutoApprove,
    AwaitHuman,
}

/// Check if a tool only mutates files.
pub fn is_edit_tool(tool_name: &str) -> bool {
    EDIT_TOOLS.contains(tool_name)
}

/// Decide how to resolve an approval for `tool_name` under `mode`.
pub fn decide(mode: PermissionMode, tool_name: &str) -> GateDecision {
    match mode {
        PermissionMode::BypassPermissions => GateDecision::AutoApprove,
        PermissionMode::AcceptEdits if is_edit_tool(tool_name) => GateDecision::AutoApprove,
        _ => GateDecision::AwaitHuman,
    }
}
