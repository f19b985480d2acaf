//! CLI output: error mapping from engine errors to the CLI surface.

use crate::error::{Action, ErrorInfo};

/// Map an engine error to a single message line plus a hint when an action is suggested.
pub fn map_error(e: &ErrorInfo) -> String {
    let mut out = format!("Error [{}] {}", e.error_code, e.detail);
    if e.actions.contains(&Action::OpenSettings) {
        out.push_str("\nHint: check the provider settings in the configuration file");
    } else if e.retryable {
        out.push_str("\nHint: the operation can be retried");
    }
    out
}
