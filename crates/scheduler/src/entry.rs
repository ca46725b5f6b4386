use chrono::{DateTime, Duration, Utc};
use common::{MessageEnvelope, ScheduleId};
use serde::{Deserialize, Serialize};

/// Lifecycle of a scheduled entry.
///
/// ```text
/// Pending ──┬──► Succeeded
///           ├──► Cancelled
///           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Waiting for its due time, or due and not yet delivered.
    Pending,
    /// Delivered to the dispatcher (terminal state).
    Succeeded,
    /// Withdrawn before delivery (terminal state).
    Cancelled,
    /// Given up on after a non-retryable error or too many attempts
    /// (terminal state).
    Failed,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScheduleStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Succeeded => "succeeded",
            ScheduleStatus::Cancelled => "cancelled",
            ScheduleStatus::Failed => "failed",
        }
    }

    /// Parses the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ScheduleStatus::Pending),
            "succeeded" => Some(ScheduleStatus::Succeeded),
            "cancelled" => Some(ScheduleStatus::Cancelled),
            "failed" => Some(ScheduleStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to dispatch a message at or after a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub envelope: MessageEnvelope,
    pub due_at: DateTime<Utc>,
}

impl ScheduleRequest {
    /// Schedules `envelope` for an absolute time.
    pub fn at(envelope: MessageEnvelope, due_at: DateTime<Utc>) -> Self {
        Self { envelope, due_at }
    }

    /// Schedules `envelope` for `delay` after `now`.
    pub fn after(envelope: MessageEnvelope, now: DateTime<Utc>, delay: Duration) -> Self {
        Self {
            envelope,
            due_at: now + delay,
        }
    }
}

/// A persisted schedule request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub schedule_id: ScheduleId,
    pub envelope: MessageEnvelope,
    pub due_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledEntry {
    /// Creates a pending entry for `request` under a fresh schedule id.
    pub fn from_request(request: ScheduleRequest) -> Self {
        let now = Utc::now();
        Self {
            schedule_id: ScheduleId::new(),
            envelope: request.envelope,
            due_at: request.due_at,
            status: ScheduleStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the entry should be delivered at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Pending && self.due_at <= now
    }
}
