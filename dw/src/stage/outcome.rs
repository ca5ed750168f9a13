//! Stage outcomes

use serde::Serialize;

/// Captured output beyond this many characters is cut
pub const MAX_CAPTURED_CHARS: usize = 30_000;

/// How a unit's execution ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitInfo {
    /// Process exited with a status code
    Code { code: i32 },
    /// Process was killed by a signal
    Signal,
    /// Process could not be started
    SpawnFailed,
    /// Process exceeded its timeout and was killed
    TimedOut,
    /// Unit ran inside this process
    InProcess,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code { code } => write!(f, "exit code {}", code),
            Self::Signal => write!(f, "terminated by signal"),
            Self::SpawnFailed => write!(f, "failed to start"),
            Self::TimedOut => write!(f, "timed out"),
            Self::InProcess => write!(f, "in-process"),
        }
    }
}

/// Output captured from a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitInfo,
}

impl Captured {
    pub fn in_process() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit: ExitInfo::InProcess,
        }
    }

    /// Build from raw process output, truncating each stream
    pub fn from_output(stdout: &[u8], stderr: &[u8], exit: ExitInfo) -> Self {
        Self {
            stdout: truncate_output(&String::from_utf8_lossy(stdout), MAX_CAPTURED_CHARS),
            stderr: truncate_output(&String::from_utf8_lossy(stderr), MAX_CAPTURED_CHARS),
            exit,
        }
    }
}

/// Result of running one stage unit
///
/// Success never carries a diagnostic and failure always does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success { rows_affected: u64, captured: Captured },
    Failure { diagnostic: String, captured: Captured },
}

impl Outcome {
    pub fn success(rows_affected: u64) -> Self {
        Self::Success {
            rows_affected,
            captured: Captured::in_process(),
        }
    }

    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self::Failure {
            diagnostic: diagnostic.into(),
            captured: Captured::in_process(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn captured(&self) -> &Captured {
        match self {
            Self::Success { captured, .. } | Self::Failure { captured, .. } => captured,
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { diagnostic, .. } => Some(diagnostic),
        }
    }

    /// One-line summary for the audit message column
    pub fn summary(&self) -> String {
        match self {
            Self::Success { rows_affected, .. } => format!("completed, {} row(s) affected", rows_affected),
            Self::Failure { diagnostic, .. } => diagnostic.clone(),
        }
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((byte_idx, _)) => {
            let total = text.chars().count();
            format!("{}\n... [truncated {} chars]", &text[..byte_idx], total - max_chars)
        }
    }
}
