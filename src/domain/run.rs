//! Run state and reconstruction from events.
//!
//! A [`PipelineRun`] is the mutable aggregate for one execution of a
//! pipeline template. It is only ever mutated by the executor, and every
//! mutation has a corresponding event, so the same state can always be
//! rebuilt by folding the run's event sequence.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType};

/// Status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Record created, no step started yet
    Created,

    /// Steps are executing
    Running,

    /// Waiting for user input on one or more steps
    Paused,

    /// Every step completed or was tolerated-skipped
    Completed,

    /// At least one untolerated step failed
    Failed,

    /// Cancelled before finishing
    Cancelled,
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingInput,
    Completed,
    Failed,
    Skipped,
}

/// Execution record for one step of one run.
///
/// There is at most one entry per step key; regenerations replace the live
/// entry rather than appending a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_key: String,
    pub status: StepStatus,

    /// Candidate outputs, most recent last
    #[serde(default)]
    pub responses: Vec<String>,

    /// The output used by dependent steps
    pub selected_response: Option<String>,

    /// Free-form feedback attached by the user
    pub user_feedback: Option<String>,

    pub tokens_used: u64,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl StepExecution {
    pub fn new(step_key: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            status: StepStatus::Pending,
            responses: Vec::new(),
            selected_response: None,
            user_feedback: None,
            tokens_used: 0,
            execution_time_ms: 0,
            error: None,
            retry_count: 0,
        }
    }
}

/// One execution instance of a pipeline template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_id: String,
    pub workspace: String,
    pub status: RunStatus,

    /// Resolved input values (declared defaults already applied)
    pub inputs: BTreeMap<String, serde_json::Value>,

    /// Selected output per completed step
    pub outputs: BTreeMap<String, String>,

    /// One entry per step key, in first-started order
    pub steps: Vec<StepExecution>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Run-level error message, set when the run fails
    pub error: Option<String>,

    pub total_tokens_used: u64,
    pub total_execution_time_ms: u64,
}

impl PipelineRun {
    /// Create a fresh run record in the `created` state.
    pub fn new(
        id: Uuid,
        pipeline_id: impl Into<String>,
        workspace: impl Into<String>,
        inputs: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id,
            pipeline_id: pipeline_id.into(),
            workspace: workspace.into(),
            status: RunStatus::Created,
            inputs,
            outputs: BTreeMap::new(),
            steps: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            total_tokens_used: 0,
            total_execution_time_ms: 0,
        }
    }

    /// Look up a step execution by key.
    pub fn step(&self, step_key: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_key == step_key)
    }

    /// Look up or insert a step execution, preserving first-seen order.
    pub fn step_mut(&mut self, step_key: &str) -> &mut StepExecution {
        if let Some(idx) = self.steps.iter().position(|s| s.step_key == step_key) {
            return &mut self.steps[idx];
        }
        self.steps.push(StepExecution::new(step_key));
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Rebuild a run purely from its event sequence.
    ///
    /// Returns `None` when the sequence is empty or does not begin with
    /// `RunCreated`.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        if first.event_type != EventType::RunCreated {
            return None;
        }

        let mut run = Self::new(first.run_id, "", "", BTreeMap::new());
        for event in events {
            run.apply_event(event);
        }
        Some(run)
    }

    /// Apply a single event to this run's state.
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunCreated => {
                self.status = RunStatus::Created;
                self.created_at = event.timestamp;
                if let Some(pipeline_id) = event.payload.get("pipeline_id").and_then(|v| v.as_str())
                {
                    self.pipeline_id = pipeline_id.to_string();
                }
                if let Some(workspace) = event.payload.get("workspace").and_then(|v| v.as_str()) {
                    self.workspace = workspace.to_string();
                }
                if let Some(inputs) = event.payload.get("inputs").and_then(|v| v.as_object()) {
                    self.inputs = inputs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                }
            }
            EventType::StepStarted => {
                if self.status == RunStatus::Created {
                    self.status = RunStatus::Running;
                    self.started_at = Some(event.timestamp);
                }
                if let Some(step_key) = event.step_key() {
                    self.step_mut(step_key).status = StepStatus::Running;
                }
            }
            EventType::StepCompleted => {
                let tokens = event
                    .payload
                    .get("tokens")
                    .and_then(|t| {
                        Some(
                            t.get("input")?.as_u64()?
                                + t.get("output").and_then(|v| v.as_u64()).unwrap_or(0),
                        )
                    })
                    .unwrap_or(0);
                let duration_ms = event
                    .payload
                    .get("duration_ms")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let retry_count = event
                    .payload
                    .get("retry_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                let output = event
                    .payload
                    .get("output")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();

                if let Some(step_key) = event.step_key() {
                    self.outputs.insert(step_key.to_string(), output.clone());
                    let step = self.step_mut(step_key);
                    step.status = StepStatus::Completed;
                    step.responses.push(output.clone());
                    step.selected_response = Some(output);
                    step.tokens_used = tokens;
                    step.execution_time_ms = duration_ms;
                    step.retry_count = retry_count;
                    step.error = None;
                }
                self.total_tokens_used += tokens;
            }
            EventType::StepFailed => {
                let error = event.error().map(str::to_string);
                let retry_count = event
                    .payload
                    .get("retry_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                if let Some(step_key) = event.step_key() {
                    let step = self.step_mut(step_key);
                    step.status = StepStatus::Failed;
                    step.error = error;
                    step.retry_count = retry_count;
                }
            }
            EventType::StepSkipped => {
                if let Some(step_key) = event.step_key() {
                    self.step_mut(step_key).status = StepStatus::Skipped;
                }
            }
            EventType::RunPaused => {
                self.status = RunStatus::Paused;
                if let Some(step_key) = event.step_key() {
                    self.step_mut(step_key).status = StepStatus::WaitingInput;
                }
            }
            EventType::RunResumed => {
                self.status = RunStatus::Running;
            }
            EventType::RunCompleted => {
                self.status = RunStatus::Completed;
                self.completed_at = Some(event.timestamp);
                if let Some(total) = event.payload.get("duration_ms").and_then(|v| v.as_u64()) {
                    self.total_execution_time_ms = total;
                }
            }
            EventType::RunFailed => {
                self.status = RunStatus::Failed;
                self.completed_at = Some(event.timestamp);
                self.error = event.error().map(str::to_string);
            }
            EventType::RunCancelled => {
                self.status = RunStatus::Cancelled;
                self.completed_at = Some(event.timestamp);
            }
        }
    }
}
