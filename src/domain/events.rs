//! Event types for the event-sourced run history.
//!
//! Every state transition of a run is recorded as an immutable event in an
//! append-only, per-run sequence. The current state of any run is a left
//! fold over its events in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry in the append-only event log.
///
/// Sequence numbers are 1-based, strictly increasing, and gap-free per run;
/// the event store assigns them at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The run this event belongs to
    pub run_id: Uuid,

    /// 1-based position within the run's event sequence
    pub sequence: u64,

    /// Type of state transition
    pub event_type: EventType,

    /// Event-specific snapshot (step key, output, error, token counts, ...)
    pub payload: serde_json::Value,

    /// When this event was appended
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// The `step_key` field of the payload, if present.
    pub fn step_key(&self) -> Option<&str> {
        self.payload.get("step_key").and_then(|v| v.as_str())
    }

    /// The `error` field of the payload, if present.
    pub fn error(&self) -> Option<&str> {
        self.payload.get("error").and_then(|v| v.as_str())
    }
}

/// Types of state transitions recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run record was created
    RunCreated,

    /// A run paused because a step needs user input
    RunPaused,

    /// A paused run was resumed with user-provided values
    RunResumed,

    /// A run completed successfully
    RunCompleted,

    /// A run failed
    RunFailed,

    /// A run was cancelled before finishing
    RunCancelled,

    /// A step began executing
    StepStarted,

    /// A step produced its output
    StepCompleted,

    /// A step failed after exhausting retries across all preferred models
    StepFailed,

    /// A step was skipped because a dependency failed or the run was
    /// cancelled
    StepSkipped,
}

impl EventType {
    /// Whether this event ends its run's sequence.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::RunCompleted | Self::RunFailed | Self::RunCancelled
        )
    }
}
