use std::process::ExitStatus;
use thiserror::Error;

/// Failure taxonomy for update-source operations.
///
/// Plugins catch these at their boundary and surface them as an error
/// status on the affected item; they never escape a batch check.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The package, repository or release does not exist upstream.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure, timeout, or a tool that could not be run.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The upstream API refused the request due to rate limiting.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A response or tool output did not have the expected shape.
    #[error("parse failure: {0}")]
    ParseFailure(String),

    /// Privilege escalation was refused or cancelled.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The source cannot perform this operation at all.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl SourceError {
    /// True when the user dismissed the authorization prompt rather than
    /// the system refusing it.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SourceError::PermissionDenied(msg) if msg.contains("cancelled"))
    }
}

/// Maps a failed pkexec invocation to an error. pkexec reserves exit code
/// 126 for a dismissed prompt and 127 for an authorization refusal.
pub fn pkexec_failure(status: ExitStatus, stderr: &str) -> SourceError {
    match status.code() {
        Some(126) => SourceError::PermissionDenied("cancelled by user".to_string()),
        Some(127) => SourceError::PermissionDenied("authorization denied".to_string()),
        _ => {
            let stderr = stderr.trim();
            SourceError::Unreachable(if stderr.is_empty() {
                format!("command exited with {status}")
            } else {
                stderr.to_string()
            })
        }
    }
}
