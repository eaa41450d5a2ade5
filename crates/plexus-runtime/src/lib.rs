//! Tracked, cancellable units of plugin work.

mod registry;

pub use registry::{RunRegistry, DEFAULT_COMPLETED_CAP};

use chrono::{DateTime, Utc};
use plexus_protocol::{ErrorCode, ErrorInfo};
use serde::{Deserialize, Serialize};

pub type RunId = String;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    CancelRequested,
    Succeeded,
    Failed,
    Canceled,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::CancelRequested => "cancel_requested",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            RunStatus::Queued => "Queued",
            RunStatus::Running => "Running",
            RunStatus::CancelRequested => "Cancel requested",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Canceled => "Canceled",
            RunStatus::Timeout => "Timed out",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "cancel_requested" | "canceling" => Some(RunStatus::CancelRequested),
            "succeeded" | "success" | "ok" => Some(RunStatus::Succeeded),
            "failed" | "error" => Some(RunStatus::Failed),
            "canceled" | "cancelled" => Some(RunStatus::Canceled),
            "timeout" | "timed_out" => Some(RunStatus::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// The transition table. Terminal states have no successors.
    pub fn allowed_next(&self) -> &'static [RunStatus] {
        match self {
            RunStatus::Queued => &[RunStatus::Running, RunStatus::Canceled],
            RunStatus::Running => &[
                RunStatus::Succeeded,
                RunStatus::Failed,
                RunStatus::Timeout,
                RunStatus::CancelRequested,
            ],
            RunStatus::CancelRequested => &[
                RunStatus::Succeeded,
                RunStatus::Failed,
                RunStatus::Canceled,
                RunStatus::Timeout,
            ],
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled | RunStatus::Timeout => {
                &[]
            }
        }
    }

    pub fn can_transition(&self, to: RunStatus) -> bool {
        self.allowed_next().contains(&to)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: RunId,
    pub plugin_id: String,
    pub entry_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: f64,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

impl Run {
    pub fn new(plugin_id: impl Into<String>, entry_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            plugin_id: plugin_id.into(),
            entry_id: entry_id.into(),
            status: RunStatus::Queued,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            progress: 0.0,
            stage: "queued".to_string(),
            message: String::new(),
            cancel_requested: false,
            cancel_reason: None,
            error: None,
            result_ref: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves to `to` if the table allows it; leaves `self` untouched otherwise.
    pub fn transition(&mut self, to: RunStatus) -> Result<(), RunError> {
        if !self.status.can_transition(to) {
            return Err(RunError::InvalidTransition {
                run_id: self.run_id.clone(),
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        match to {
            RunStatus::Running => {
                self.started_at = Some(now);
                self.stage = "running".to_string();
            }
            RunStatus::CancelRequested => self.cancel_requested = true,
            _ => {}
        }
        if to.is_terminal() {
            self.finalize(now);
        }
        Ok(())
    }

    fn finalize(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        if self.status == RunStatus::Succeeded {
            self.progress = 1.0;
        }
        // lifecycle placeholders are replaced, caller-provided stages kept
        if matches!(self.stage.trim(), "" | "queued" | "running") {
            self.stage = self.status.as_str().to_string();
        }
        if self.message.trim().is_empty() {
            self.message = self.status.display_label().to_string();
        }
    }
}

/// Terminal outcome handed to [`RunRegistry::finish`].
#[derive(Clone, Debug, Default)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub message: Option<String>,
    pub error: Option<ErrorInfo>,
    pub result_ref: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(result_ref: Option<String>) -> Self {
        Self {
            status: RunStatus::Succeeded,
            result_ref,
            ..Default::default()
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            status: RunStatus::Failed,
            message: Some(error.message.clone()),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_status(status: RunStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("run `{0}` not found")]
    NotFound(String),
    #[error("run `{run_id}` cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("run `{run_id}` outcome {status} is not terminal")]
    NotTerminal { run_id: String, status: RunStatus },
}

impl From<RunError> for ErrorInfo {
    fn from(err: RunError) -> Self {
        let code = match err {
            RunError::NotFound(_) => ErrorCode::NotFound,
            RunError::InvalidTransition { .. } | RunError::NotTerminal { .. } => {
                ErrorCode::InvalidTransition
            }
        };
        ErrorInfo::new(code, err.to_string())
    }
}
