//! Request context captured when a drain starts.

use serde::{Deserialize, Serialize};

use crate::approval::PermissionMode;

/// Provenance carried by every resume of a run.
///
/// Captured once per drain and reused verbatim, so resumed requests look the
/// same to the worker as the request that started the run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSessionContext {
    pub cwd: String,
    pub model_id: String,
    pub permission_mode: PermissionMode,
    /// Ordered key/value pairs forwarded as-is.
    #[serde(default)]
    pub request_entries: Vec<(String, String)>,
}

impl ClientSessionContext {
    pub fn new(
        cwd: impl Into<String>,
        model_id: impl Into<String>,
        permission_mode: PermissionMode,
    ) -> Self {
        Self {
            cwd: cwd.into(),
            model_id: model_id.into(),
            permission_mode,
            request_entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_entries.push((key.into(), value.into()));
        self
    }

    pub fn entry(&self, key: &str) -> Option<&str> {
        self.request_entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Merge extra entries. Existing keys are overwritten in place so the
    /// original order is kept; new keys are appended.
    pub fn merge(&mut self, extra: Vec<(String, String)>) {
        for (key, value) in extra {
            match self.request_entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => self.request_entries.push((key, value)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overwrites_in_place_and_appends() {
        let mut context = ClientSessionContext::new("/repo", "model-1", PermissionMode::Default)
            .with_entry("a", "1")
            .with_entry("b", "2");

        context.merge(vec![
            ("b".to_string(), "20".to_string()),
            ("c".to_string(), "3".to_string()),
        ]);

        assert_eq!(
            context.request_entries,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "20".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
        assert_eq!(context.entry("b"), Some("20"));
        assert_eq!(context.entry("missing"), None);
    }

    #[test]
    fn serializes_camel_case() {
        let context = ClientSessionContext::new("/repo", "model-1", PermissionMode::AcceptEdits);
        let json = serde_json::to_value(&context).unwrap();
        assert_eq!(json["modelId"], "model-1");
        assert_eq!(json["permissionMode"], "acceptEdits");
        assert_eq!(json["requestEntries"], serde_json::json!([]));
    }
}
