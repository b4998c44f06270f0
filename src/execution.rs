//! Execution record: the persisted state of one evaluation run.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ValidationError;

/// Open key/value bag attached to an execution.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Current time at millisecond precision, the resolution executions are stored at.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Globally unique, time-sortable execution identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Ulid);

impl ExecutionId {
    /// Generate a new identifier.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ExecutionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| ValidationError::new("execution_id", e.to_string()))
    }
}

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states accept no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ValidationError::new(
                "status",
                format!("unknown status '{}'", other),
            )),
        }
    }
}

/// How an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Started when a completed span matched a rule.
    Automatic,
    /// Started by an operator.
    Manual,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            other => Err(ValidationError::new(
                "trigger_type",
                format!("unknown trigger type '{}'", other),
            )),
        }
    }
}

/// One evaluation run of a rule against a set of spans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub rule_id: String,
    pub project_id: String,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    /// Expected number of targets. Zero means unknown.
    pub spans_matched: u64,
    pub spans_scored: u64,
    pub errors_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Requested terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    /// Close successfully with explicit final counters.
    Completed {
        spans_matched: u64,
        spans_scored: u64,
        errors_count: u64,
    },
    Failed { message: String },
    Cancelled,
}

impl Finish {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Completed { .. } => ExecutionStatus::Completed,
            Self::Failed { .. } => ExecutionStatus::Failed,
            Self::Cancelled => ExecutionStatus::Cancelled,
        }
    }
}

impl ExecutionRecord {
    /// Create a pending record.
    pub fn new(
        rule_id: impl Into<String>,
        project_id: impl Into<String>,
        trigger_type: TriggerType,
        spans_matched: u64,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            rule_id: rule_id.into(),
            project_id: project_id.into(),
            status: ExecutionStatus::Pending,
            trigger_type,
            spans_matched,
            spans_scored: 0,
            errors_count: 0,
            created_at: now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            metadata: Metadata::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of targets processed so far, successful or not.
    pub fn processed(&self) -> u64 {
        self.spans_scored.saturating_add(self.errors_count)
    }

    /// True once a known match count has been reached.
    pub fn is_satisfied(&self) -> bool {
        self.spans_matched > 0 && self.processed() >= self.spans_matched
    }

    /// Move a pending record to running. Returns false if terminal.
    pub fn begin(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = ExecutionStatus::Running;
        self.started_at.get_or_insert(now);
        true
    }

    /// Apply a progress report. Returns true only if this report completed the run.
    pub fn apply_progress(&mut self, scored: u64, errors: u64, now: DateTime<Utc>) -> bool {
        if !self.begin(now) {
            return false;
        }
        self.spans_scored = self.spans_scored.saturating_add(scored);
        self.errors_count = self.errors_count.saturating_add(errors);
        if self.is_satisfied() {
            self.close(ExecutionStatus::Completed, now);
            return true;
        }
        false
    }

    /// Replace the expected match count. Returns true if the count is already satisfied
    /// and the record was completed by this call.
    pub fn set_spans_matched(&mut self, matched: u64, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.spans_matched = matched;
        if self.is_satisfied() {
            self.close(ExecutionStatus::Completed, now);
            return true;
        }
        false
    }

    /// Apply a terminal transition. Returns false if already terminal.
    pub fn finish(&mut self, finish: &Finish, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        match finish {
            Finish::Completed {
                spans_matched,
                spans_scored,
                errors_count,
            } => {
                self.spans_matched = *spans_matched;
                self.spans_scored = *spans_scored;
                self.errors_count = *errors_count;
            }
            Finish::Failed { message } => self.error_message = Some(message.clone()),
            Finish::Cancelled => {}
        }
        self.close(finish.status(), now);
        true
    }

    fn close(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        let started = self.started_at.unwrap_or(self.created_at);
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - started).num_milliseconds().max(0));
    }
}

/// Apply a JSON merge patch (RFC 7396) to metadata: `null` removes a key,
/// objects merge recursively, anything else replaces.
pub(crate) fn merge_patch(target: &mut Metadata, patch: &Metadata) {
    for (key, value) in patch {
        match value {
            serde_json::Value::Null => {
                target.remove(key);
            }
            serde_json::Value::Object(inner) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| serde_json::Value::Object(Metadata::new()));
                if !entry.is_object() {
                    *entry = serde_json::Value::Object(Metadata::new());
                }
                if let serde_json::Value::Object(existing) = entry {
                    merge_patch(existing, inner);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Pure terminal-state predicate consulted before any mutation.
pub fn is_terminal(record: &ExecutionRecord) -> bool {
    record.is_terminal()
}
