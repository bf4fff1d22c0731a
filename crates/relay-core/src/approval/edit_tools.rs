//! Tools that `acceptEdits` approves without asking.

use std::collections::HashSet;
use std::sync::LazyLock;

/// File-mutating tools. Anything that runs commands or reaches the network is
/// deliberately absent.
pub static EDIT_TOOLS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // Claude-style tool names
        "Edit",
        "MultiEdit",
        "Write",
        "NotebookEdit",
        // Snake-case worker tool names
        "write_file",
        "edit_file",
        "apply_patch",
    ]
    .into_iter()
    .collect()
});
