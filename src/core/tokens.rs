//! Per-run and aggregate token usage accounting.
//!
//! Usage is tracked in memory while a run executes and persisted to the
//! workspace's `token_usage` table when the run finishes. Re-tracking a
//! step key within one run replaces the live per-step entry (a
//! regeneration), but run totals keep counting superseded calls: tokens
//! already consumed cannot be un-spent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::TokenCounts;
use crate::storage::{StorageError, StorageManager};

const TABLE: &str = "token_usage";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no active run; call start_run first")]
    NoActiveRun,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("tracker lock poisoned")]
    LockPoisoned,
}

/// Live usage entry for one step (at most one per step key per run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepUsage {
    pub step_key: String,
    pub step_name: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,

    /// How many times this step's entry was replaced within the run
    pub regeneration_count: u32,
}

impl StepUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Finished usage record for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunTokens {
    pub pipeline_name: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Live per-step entries (superseded regenerations excluded)
    pub steps: Vec<StepUsage>,

    /// Running sums across every tracked call, superseded ones included
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,

    /// Token sums grouped by model identifier
    pub by_model: BTreeMap<String, TokenCounts>,
}

impl PipelineRunTokens {
    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }
}

/// Aggregate usage across all completed runs in a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalUsage {
    pub runs: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub by_model: BTreeMap<String, TokenCounts>,
}

impl TotalUsage {
    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }
}

#[derive(Debug)]
struct ActiveRun {
    pipeline_name: String,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    steps: Vec<StepUsage>,
    total_input_tokens: u64,
    total_output_tokens: u64,
    by_model: BTreeMap<String, TokenCounts>,
}

/// Token usage tracker for one workspace.
pub struct TokenTracker {
    storage: Arc<StorageManager>,
    active: Mutex<Option<ActiveRun>>,
}

impl TokenTracker {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self {
            storage,
            active: Mutex::new(None),
        }
    }

    /// Begin tracking a run. Replaces any previously active run.
    pub fn start_run(&self, pipeline_name: &str, run_id: Uuid) -> Result<(), TrackerError> {
        let mut active = self.active.lock().map_err(|_| TrackerError::LockPoisoned)?;
        *active = Some(ActiveRun {
            pipeline_name: pipeline_name.to_string(),
            run_id,
            started_at: Utc::now(),
            steps: Vec::new(),
            total_input_tokens: 0,
            total_output_tokens: 0,
            by_model: BTreeMap::new(),
        });
        Ok(())
    }

    /// Resume tracking a run whose partial usage was persisted when it
    /// paused, carrying the already-spent totals forward. Starts fresh
    /// when no prior record exists.
    pub fn resume_run(&self, pipeline_name: &str, run_id: Uuid) -> Result<(), TrackerError> {
        let prior: Option<PipelineRunTokens> = self
            .storage
            .get_json_lossy(TABLE, &format!("run:{}", run_id))?;

        let Some(record) = prior else {
            return self.start_run(pipeline_name, run_id);
        };

        let mut active = self.active.lock().map_err(|_| TrackerError::LockPoisoned)?;
        *active = Some(ActiveRun {
            pipeline_name: record.pipeline_name,
            run_id,
            started_at: record.started_at,
            steps: record.steps,
            total_input_tokens: record.total_input_tokens,
            total_output_tokens: record.total_output_tokens,
            by_model: record.by_model,
        });
        Ok(())
    }

    /// Record one generation call for a step.
    ///
    /// Tracking an already-tracked step key replaces the live entry and
    /// bumps its `regeneration_count`; run totals and the per-model
    /// breakdown still accumulate the superseded counts.
    pub fn track_step(
        &self,
        step_key: &str,
        step_name: &str,
        model: &str,
        counts: TokenCounts,
    ) -> Result<StepUsage, TrackerError> {
        let mut active = self.active.lock().map_err(|_| TrackerError::LockPoisoned)?;
        let run = active.as_mut().ok_or(TrackerError::NoActiveRun)?;

        run.total_input_tokens += counts.input;
        run.total_output_tokens += counts.output;
        let per_model = run.by_model.entry(model.to_string()).or_default();
        per_model.input += counts.input;
        per_model.output += counts.output;

        let regeneration_count = match run.steps.iter().position(|s| s.step_key == step_key) {
            Some(idx) => {
                let previous = run.steps.remove(idx);
                previous.regeneration_count + 1
            }
            None => 0,
        };

        let usage = StepUsage {
            step_key: step_key.to_string(),
            step_name: step_name.to_string(),
            model: model.to_string(),
            input_tokens: counts.input,
            output_tokens: counts.output,
            regeneration_count,
        };
        run.steps.push(usage.clone());
        Ok(usage)
    }

    /// Finish the active run, persist its record, and return it.
    pub fn finish_run(&self) -> Result<PipelineRunTokens, TrackerError> {
        let run = {
            let mut active = self.active.lock().map_err(|_| TrackerError::LockPoisoned)?;
            active.take().ok_or(TrackerError::NoActiveRun)?
        };

        let record = PipelineRunTokens {
            pipeline_name: run.pipeline_name,
            run_id: run.run_id,
            started_at: run.started_at,
            finished_at: Utc::now(),
            steps: run.steps,
            total_input_tokens: run.total_input_tokens,
            total_output_tokens: run.total_output_tokens,
            by_model: run.by_model,
        };

        let k = format!("run:{}", record.run_id);
        self.storage.put_json(TABLE, &k, &record)?;
        Ok(record)
    }

    /// Aggregate usage across all persisted run records.
    ///
    /// Undecodable records are logged by the storage layer and skipped.
    pub fn total_usage(&self) -> Result<TotalUsage, TrackerError> {
        let mut total = TotalUsage::default();

        for k in self.storage.list_keys(TABLE, "run:")? {
            let record: Option<PipelineRunTokens> = self.storage.get_json_lossy(TABLE, &k)?;
            let Some(record) = record else { continue };

            total.runs += 1;
            total.total_input_tokens += record.total_input_tokens;
            total.total_output_tokens += record.total_output_tokens;
            for (model, counts) in record.by_model {
                let per_model = total.by_model.entry(model).or_default();
                per_model.input += counts.input;
                per_model.output += counts.output;
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_tracker(dir: &TempDir) -> TokenTracker {
        let storage = Arc::new(StorageManager::open_at(&dir.path().join("ws"), "ws").unwrap());
        TokenTracker::new(storage)
    }

    #[test]
    fn test_track_requires_active_run() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);

        let err = tracker
            .track_step("outline", "Outline", "m", TokenCounts::new(1, 1))
            .unwrap_err();
        assert!(matches!(err, TrackerError::NoActiveRun));
    }

    #[test]
    fn test_regeneration_replaces_but_totals_accumulate() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);
        tracker.start_run("blog", Uuid::new_v4()).unwrap();

        tracker
            .track_step("outline", "Outline", "alpha", TokenCounts::new(10, 20))
            .unwrap();
        let regen = tracker
            .track_step("outline", "Outline", "alpha", TokenCounts::new(5, 5))
            .unwrap();
        assert_eq!(regen.regeneration_count, 1);

        let record = tracker.finish_run().unwrap();
        // One live entry per step key.
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.steps[0].input_tokens, 5);
        // Totals include the superseded call.
        assert_eq!(record.total_input_tokens, 15);
        assert_eq!(record.total_output_tokens, 25);
        assert_eq!(record.total_tokens(), 40);
    }

    #[test]
    fn test_by_model_breakdown() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);
        tracker.start_run("blog", Uuid::new_v4()).unwrap();

        tracker
            .track_step("a", "A", "alpha", TokenCounts::new(10, 10))
            .unwrap();
        tracker
            .track_step("b", "B", "alpha", TokenCounts::new(5, 5))
            .unwrap();
        tracker
            .track_step("c", "C", "beta", TokenCounts::new(1, 2))
            .unwrap();

        let record = tracker.finish_run().unwrap();
        assert_eq!(record.by_model["alpha"], TokenCounts::new(15, 15));
        assert_eq!(record.by_model["beta"], TokenCounts::new(1, 2));

        // Single-model sums equal run totals when only one model is used.
        let alpha_total = record.by_model["alpha"].total() + record.by_model["beta"].total();
        assert_eq!(alpha_total, record.total_tokens());
    }

    #[test]
    fn test_resume_carries_persisted_totals_forward() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);
        let run_id = Uuid::new_v4();

        tracker.start_run("blog", run_id).unwrap();
        tracker
            .track_step("outline", "Outline", "alpha", TokenCounts::new(100, 100))
            .unwrap();
        // Run pauses; partial usage is persisted.
        tracker.finish_run().unwrap();

        tracker.resume_run("blog", run_id).unwrap();
        tracker
            .track_step("final", "Final", "alpha", TokenCounts::new(100, 100))
            .unwrap();
        let record = tracker.finish_run().unwrap();

        assert_eq!(record.total_tokens(), 400);
        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.by_model["alpha"], TokenCounts::new(200, 200));

        // One record per run key, so aggregates see the merged totals once.
        let total = tracker.total_usage().unwrap();
        assert_eq!(total.runs, 1);
        assert_eq!(total.total_tokens(), 400);
    }

    #[test]
    fn test_total_usage_across_runs() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);

        for _ in 0..2 {
            tracker.start_run("blog", Uuid::new_v4()).unwrap();
            tracker
                .track_step("a", "A", "alpha", TokenCounts::new(10, 10))
                .unwrap();
            tracker.finish_run().unwrap();
        }

        let total = tracker.total_usage().unwrap();
        assert_eq!(total.runs, 2);
        assert_eq!(total.total_input_tokens, 20);
        assert_eq!(total.by_model["alpha"], TokenCounts::new(20, 20));
    }
}
