//! Pipeline executor: dependency-ordered step scheduling.
//!
//! Drives a run wave by wave: a step is ready once every dependency has
//! completed, and ready steps execute concurrently under a configurable
//! limit. Each step renders its prompt from inputs, defaults, and prior
//! outputs, consults the response cache, and falls back to the generation
//! backend through the retry wrapper, walking the step's model preference
//! list. Every state transition is appended to the event log before the run
//! record is updated.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{BackendError, GenerationBackend, TokenCounts};
use crate::domain::{
    EventType, PipelineRun, PipelineTemplate, RunStatus, StepKind, StepSpec, StepStatus,
    TemplateError,
};
use crate::storage::{StorageError, StorageManager};

use super::cache::{CacheStats, ResponseCache};
use super::cancel::CancelToken;
use super::event_store::EventStore;
use super::render::{self, RenderContext};
use super::retry::{self, RetryError};
use super::tokens::{TokenTracker, TotalUsage, TrackerError};

const RUNS_TABLE: &str = "pipeline_runs";
const TEMPLATES_TABLE: &str = "pipeline_templates";

/// Errors that abort an executor operation outright.
///
/// Step failures are not in this list: they are recorded on the run, which
/// is still returned to the caller.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// Bad inputs or a structurally invalid template; never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {0} is not paused")]
    NotPaused(Uuid),

    #[error("executor internal failure: {0}")]
    Internal(String),
}

impl From<TemplateError> for ExecuteError {
    fn from(e: TemplateError) -> Self {
        Self::Validation(e.to_string())
    }
}

/// Tunables for one executor instance.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on steps of one wave running at the same time
    pub concurrency_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
        }
    }
}

/// The pipeline scheduler for one workspace.
pub struct PipelineExecutor {
    storage: Arc<StorageManager>,
    backend: Arc<dyn GenerationBackend>,
    events: Arc<EventStore>,
    cache: Arc<ResponseCache>,
    tracker: Arc<TokenTracker>,
    config: ExecutorConfig,
}

/// Result of one step's execution attempt, applied to the run record by the
/// scheduler after the corresponding events have been appended.
#[derive(Debug)]
struct StepOutcome {
    step_key: String,
    result: StepResult,
}

#[derive(Debug)]
enum StepResult {
    Completed {
        output: String,
        tokens: TokenCounts,
        duration_ms: u64,
        retry_count: u32,
    },
    Failed {
        error: String,
        retry_count: u32,
    },
    /// The run was cancelled while the step was in flight; any result the
    /// backend produced is discarded.
    Skipped,
}

/// Everything a spawned step task needs, detached from `&self`.
struct StepContext {
    run_id: Uuid,
    events: Arc<EventStore>,
    cache: Arc<ResponseCache>,
    tracker: Arc<TokenTracker>,
    backend: Arc<dyn GenerationBackend>,
    inputs: BTreeMap<String, serde_json::Value>,
    defaults: BTreeMap<String, String>,
    outputs: BTreeMap<String, String>,
    cancel: CancelToken,
}

impl PipelineExecutor {
    pub fn new(storage: Arc<StorageManager>, backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            events: Arc::new(EventStore::new(Arc::clone(&storage))),
            cache: Arc::new(ResponseCache::new(Arc::clone(&storage))),
            tracker: Arc::new(TokenTracker::new(Arc::clone(&storage))),
            storage,
            backend,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute a template against resolved inputs, driving the run to a
    /// terminal state (or to `paused` when a step awaits user input).
    #[instrument(skip(self, template, inputs), fields(pipeline = %template.id))]
    pub async fn execute(
        &self,
        template: &PipelineTemplate,
        inputs: BTreeMap<String, serde_json::Value>,
    ) -> Result<PipelineRun, ExecuteError> {
        self.execute_with_cancel(template, inputs, CancelToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), with a caller-held cancellation
    /// token. Cancellation is observed between waves and between retry
    /// attempts; in-flight backend calls finish but their results are
    /// discarded.
    pub async fn execute_with_cancel(
        &self,
        template: &PipelineTemplate,
        inputs: BTreeMap<String, serde_json::Value>,
        cancel: CancelToken,
    ) -> Result<PipelineRun, ExecuteError> {
        template.validate()?;
        let resolved = template.resolve_inputs(&inputs)?;

        let run_id = Uuid::new_v4();
        info!(%run_id, pipeline = %template.id, "starting pipeline run");

        let mut run = PipelineRun::new(
            run_id,
            &template.id,
            self.storage.workspace(),
            resolved.clone(),
        );
        for step in &template.steps {
            run.step_mut(&step.key);
        }

        self.events
            .append(
                run_id,
                EventType::RunCreated,
                json!({
                    "pipeline_id": template.id,
                    "workspace": run.workspace,
                    "inputs": resolved,
                }),
            )
            .await?;
        self.save_run(&run)?;

        self.tracker.start_run(&template.name, run_id)?;
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());

        self.drive(template, run, &cancel).await
    }

    /// Resume a paused run, supplying outputs for its waiting steps
    /// (`step_key -> value`).
    #[instrument(skip(self, template, provided), fields(run_id = %run_id))]
    pub async fn resume(
        &self,
        run_id: Uuid,
        template: &PipelineTemplate,
        provided: BTreeMap<String, String>,
    ) -> Result<PipelineRun, ExecuteError> {
        self.resume_with_cancel(run_id, template, provided, CancelToken::new())
            .await
    }

    /// Like [`resume`](Self::resume), with a caller-held cancellation token.
    pub async fn resume_with_cancel(
        &self,
        run_id: Uuid,
        template: &PipelineTemplate,
        provided: BTreeMap<String, String>,
        cancel: CancelToken,
    ) -> Result<PipelineRun, ExecuteError> {
        let mut run = self
            .get_run(run_id)?
            .ok_or(ExecuteError::RunNotFound(run_id))?;
        if run.status != RunStatus::Paused {
            return Err(ExecuteError::NotPaused(run_id));
        }
        info!("resuming paused run");

        let waiting: Vec<String> = run
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::WaitingInput)
            .map(|s| s.step_key.clone())
            .collect();

        for step_key in &waiting {
            let value = provided.get(step_key).ok_or_else(|| {
                ExecuteError::Validation(format!(
                    "no value provided for waiting step '{}'",
                    step_key
                ))
            })?;

            self.events
                .append(
                    run_id,
                    EventType::StepCompleted,
                    json!({
                        "step_key": step_key,
                        "output": value,
                        "tokens": {"input": 0, "output": 0},
                        "source": "user_input",
                    }),
                )
                .await?;

            run.outputs.insert(step_key.clone(), value.clone());
            let step = run.step_mut(step_key);
            step.status = StepStatus::Completed;
            step.responses.push(value.clone());
            step.selected_response = Some(value.clone());
        }

        self.events
            .append(run_id, EventType::RunResumed, json!({}))
            .await?;
        run.status = RunStatus::Running;
        self.save_run(&run)?;

        for step in &template.steps {
            run.step_mut(&step.key);
        }
        // Tokens spent before the pause were persisted; carry them forward.
        self.tracker.resume_run(&template.name, run_id)?;

        self.drive(template, run, &cancel).await
    }

    /// Wave loop: schedule ready steps until nothing is left to do.
    async fn drive(
        &self,
        template: &PipelineTemplate,
        mut run: PipelineRun,
        cancel: &CancelToken,
    ) -> Result<PipelineRun, ExecuteError> {
        let run_started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(run, run_started).await;
            }

            let ready: Vec<StepSpec> = template
                .steps
                .iter()
                .filter(|s| {
                    run.step(&s.key)
                        .map(|e| e.status == StepStatus::Pending)
                        .unwrap_or(true)
                })
                .filter(|s| {
                    s.depends_on.iter().all(|d| {
                        run.step(d)
                            .map(|e| e.status == StepStatus::Completed)
                            .unwrap_or(false)
                    })
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                if self.skip_blocked_steps(template, &mut run).await? > 0 {
                    continue;
                }
                break;
            }

            // A step that needs user input pauses the whole run; remaining
            // ready steps stay pending and resume later.
            if let Some(step) = ready.iter().find(|s| s.kind == StepKind::UserInput) {
                return self.pause_for_input(run, &step.key).await;
            }

            debug!(
                run_id = %run.id,
                wave = ?ready.iter().map(|s| s.key.as_str()).collect::<Vec<_>>(),
                "executing wave"
            );

            let context = Arc::new(StepContext {
                run_id: run.id,
                events: Arc::clone(&self.events),
                cache: Arc::clone(&self.cache),
                tracker: Arc::clone(&self.tracker),
                backend: Arc::clone(&self.backend),
                inputs: run.inputs.clone(),
                defaults: template.defaults.clone(),
                outputs: run.outputs.clone(),
                cancel: cancel.clone(),
            });

            let (concurrent, serial): (Vec<_>, Vec<_>) =
                ready.into_iter().partition(|s| s.parallel);

            let mut outcomes = Vec::new();
            for step in serial {
                if cancel.is_cancelled() {
                    break;
                }
                outcomes.push(execute_step(Arc::clone(&context), step).await?);
            }

            if !concurrent.is_empty() && !cancel.is_cancelled() {
                let semaphore =
                    Arc::new(Semaphore::new(self.config.concurrency_limit.max(1)));
                let mut join_set = JoinSet::new();
                for step in concurrent {
                    let context = Arc::clone(&context);
                    let semaphore = Arc::clone(&semaphore);
                    join_set.spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .map_err(|e| ExecuteError::Internal(e.to_string()))?;
                        execute_step(context, step).await
                    });
                }

                // Outcomes arrive in true completion order.
                while let Some(joined) = join_set.join_next().await {
                    let outcome =
                        joined.map_err(|e| ExecuteError::Internal(e.to_string()))??;
                    outcomes.push(outcome);
                }
            }

            for outcome in outcomes {
                self.apply_outcome(&mut run, outcome);
            }
            self.save_run(&run)?;
        }

        self.finish(template, run, run_started).await
    }

    /// Fold one step outcome into the run record. The events were already
    /// appended by the step task.
    fn apply_outcome(&self, run: &mut PipelineRun, outcome: StepOutcome) {
        match outcome.result {
            StepResult::Completed {
                output,
                tokens,
                duration_ms,
                retry_count,
            } => {
                run.outputs
                    .insert(outcome.step_key.clone(), output.clone());
                let step = run.step_mut(&outcome.step_key);
                step.status = StepStatus::Completed;
                step.responses.push(output.clone());
                step.selected_response = Some(output);
                step.tokens_used = tokens.total();
                step.execution_time_ms = duration_ms;
                step.retry_count = retry_count;
                step.error = None;
            }
            StepResult::Failed { error, retry_count } => {
                let step = run.step_mut(&outcome.step_key);
                step.status = StepStatus::Failed;
                step.error = Some(error);
                step.retry_count = retry_count;
            }
            StepResult::Skipped => {
                run.step_mut(&outcome.step_key).status = StepStatus::Skipped;
            }
        }
    }

    /// Skip pending steps whose dependencies failed or were skipped,
    /// transitively. Returns how many steps changed state.
    async fn skip_blocked_steps(
        &self,
        template: &PipelineTemplate,
        run: &mut PipelineRun,
    ) -> Result<usize, ExecuteError> {
        let mut skipped = 0;
        loop {
            let mut blocked: Option<(String, String)> = None;
            for step in &template.steps {
                let pending = run
                    .step(&step.key)
                    .map(|e| e.status == StepStatus::Pending)
                    .unwrap_or(false);
                if !pending {
                    continue;
                }
                let failed_dep = step.depends_on.iter().find(|d| {
                    run.step(d)
                        .map(|e| {
                            matches!(e.status, StepStatus::Failed | StepStatus::Skipped)
                        })
                        .unwrap_or(false)
                });
                if let Some(dep) = failed_dep {
                    blocked = Some((step.key.clone(), dep.clone()));
                    break;
                }
            }

            let Some((step_key, dep)) = blocked else { break };
            let cause = format!("dependency '{}' did not complete", dep);
            self.events
                .append(
                    run.id,
                    EventType::StepSkipped,
                    json!({"step_key": step_key, "cause": cause}),
                )
                .await?;
            run.step_mut(&step_key).status = StepStatus::Skipped;
            skipped += 1;
        }

        if skipped > 0 {
            self.save_run(run)?;
        }
        Ok(skipped)
    }

    async fn pause_for_input(
        &self,
        mut run: PipelineRun,
        step_key: &str,
    ) -> Result<PipelineRun, ExecuteError> {
        self.events
            .append(
                run.id,
                EventType::StepStarted,
                json!({"step_key": step_key}),
            )
            .await?;
        self.events
            .append(run.id, EventType::RunPaused, json!({"step_key": step_key}))
            .await?;

        run.step_mut(step_key).status = StepStatus::WaitingInput;
        run.status = RunStatus::Paused;
        self.save_run(&run)?;

        // The tracker stays consistent: whatever was spent so far is
        // persisted now and resumes under a fresh active run.
        if let Ok(partial) = self.tracker.finish_run() {
            run.total_tokens_used = partial.total_tokens();
            self.save_run(&run)?;
        }

        info!(run_id = %run.id, step = step_key, "run paused awaiting user input");
        Ok(run)
    }

    async fn finish_cancelled(
        &self,
        mut run: PipelineRun,
        run_started: Instant,
    ) -> Result<PipelineRun, ExecuteError> {
        let pending: Vec<String> = run
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.step_key.clone())
            .collect();
        for step_key in pending {
            self.events
                .append(
                    run.id,
                    EventType::StepSkipped,
                    json!({"step_key": step_key, "cause": "run cancelled"}),
                )
                .await?;
            run.step_mut(&step_key).status = StepStatus::Skipped;
        }

        self.events
            .append(run.id, EventType::RunCancelled, json!({}))
            .await?;
        run.status = RunStatus::Cancelled;
        run.completed_at = Some(Utc::now());
        run.total_execution_time_ms = run_started.elapsed().as_millis() as u64;
        if let Ok(usage) = self.tracker.finish_run() {
            run.total_tokens_used = usage.total_tokens();
        }
        self.save_run(&run)?;

        warn!(run_id = %run.id, "run cancelled");
        Ok(run)
    }

    /// Drive the run to its terminal state once no step is runnable.
    async fn finish(
        &self,
        template: &PipelineTemplate,
        mut run: PipelineRun,
        run_started: Instant,
    ) -> Result<PipelineRun, ExecuteError> {
        let usage = self.tracker.finish_run()?;
        run.total_tokens_used = usage.total_tokens();
        run.total_execution_time_ms = run_started.elapsed().as_millis() as u64;
        run.completed_at = Some(Utc::now());

        let fatal_failure = run.steps.iter().find(|s| {
            s.status == StepStatus::Failed
                && !template
                    .step(&s.step_key)
                    .map(|spec| spec.continue_on_error)
                    .unwrap_or(false)
        });

        match fatal_failure {
            Some(step) => {
                let message = format!(
                    "step '{}' failed: {}",
                    step.step_key,
                    step.error.as_deref().unwrap_or("unknown error")
                );
                self.events
                    .append(run.id, EventType::RunFailed, json!({"error": message}))
                    .await?;
                run.status = RunStatus::Failed;
                run.error = Some(message);
                error!(run_id = %run.id, error = %run.error.as_deref().unwrap_or(""), "run failed");
            }
            None => {
                self.events
                    .append(
                        run.id,
                        EventType::RunCompleted,
                        json!({
                            "duration_ms": run.total_execution_time_ms,
                            "total_tokens": run.total_tokens_used,
                        }),
                    )
                    .await?;
                run.status = RunStatus::Completed;
                info!(
                    run_id = %run.id,
                    tokens = run.total_tokens_used,
                    duration_ms = run.total_execution_time_ms,
                    "run completed"
                );
            }
        }

        self.save_run(&run)?;
        Ok(run)
    }

    // --- query surface -----------------------------------------------------

    /// Fetch a run record. A corrupt stored record is rebuilt from the
    /// event log; `None` means the run does not exist at all.
    pub fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StorageError> {
        let stored: Option<PipelineRun> = self
            .storage
            .get_json_lossy(RUNS_TABLE, &format!("run:{}", run_id))?;
        if stored.is_some() {
            return Ok(stored);
        }

        let events = self.events.get_events(run_id)?;
        Ok(PipelineRun::from_events(&events))
    }

    /// All runs in this workspace, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PipelineRun>, StorageError> {
        let mut runs = Vec::new();
        for k in self.storage.list_keys(RUNS_TABLE, "run:")? {
            if let Some(run) = self.storage.get_json_lossy::<PipelineRun>(RUNS_TABLE, &k)? {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    /// Event history for a run, in sequence order.
    pub fn get_events(&self, run_id: Uuid) -> Result<Vec<crate::domain::Event>, StorageError> {
        self.events.get_events(run_id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Aggregate token usage across completed runs in this workspace.
    pub fn total_usage(&self) -> Result<TotalUsage, TrackerError> {
        self.tracker.total_usage()
    }

    // --- template registry -------------------------------------------------

    pub fn save_template(&self, template: &PipelineTemplate) -> Result<(), StorageError> {
        self.storage.put_json(
            TEMPLATES_TABLE,
            &format!("template:{}", template.id),
            template,
        )
    }

    pub fn load_template(&self, id: &str) -> Result<Option<PipelineTemplate>, StorageError> {
        self.storage
            .get_json_lossy(TEMPLATES_TABLE, &format!("template:{}", id))
    }

    pub fn list_templates(&self) -> Result<Vec<PipelineTemplate>, StorageError> {
        let mut templates = Vec::new();
        for k in self.storage.list_keys(TEMPLATES_TABLE, "template:")? {
            if let Some(t) = self
                .storage
                .get_json_lossy::<PipelineTemplate>(TEMPLATES_TABLE, &k)?
            {
                templates.push(t);
            }
        }
        Ok(templates)
    }

    fn save_run(&self, run: &PipelineRun) -> Result<(), StorageError> {
        self.storage
            .put_json(RUNS_TABLE, &format!("run:{}", run.id), run)
    }
}

/// Execute one step to an outcome, appending its events along the way.
async fn execute_step(
    ctx: Arc<StepContext>,
    step: StepSpec,
) -> Result<StepOutcome, ExecuteError> {
    let started = Instant::now();
    ctx.events
        .append(
            ctx.run_id,
            EventType::StepStarted,
            json!({"step_key": step.key}),
        )
        .await?;

    let render_ctx = RenderContext {
        inputs: &ctx.inputs,
        defaults: &ctx.defaults,
        steps: &ctx.outputs,
    };

    let rendered = match render::render(&step.prompt_template, &render_ctx) {
        Ok(rendered) => rendered,
        Err(e) => {
            return fail_step(&ctx, &step, format!("prompt rendering failed: {}", e), 0).await;
        }
    };

    match step.kind {
        StepKind::Transform => {
            complete_step(
                &ctx,
                &step,
                rendered,
                TokenCounts::default(),
                None,
                false,
                0,
                started,
            )
            .await
        }
        StepKind::Validate => {
            if rendered.trim().is_empty() {
                fail_step(&ctx, &step, "validation produced empty output".to_string(), 0).await
            } else {
                complete_step(
                    &ctx,
                    &step,
                    rendered,
                    TokenCounts::default(),
                    None,
                    false,
                    0,
                    started,
                )
                .await
            }
        }
        StepKind::UserInput => {
            // The scheduler pauses the run before these reach a task.
            fail_step(
                &ctx,
                &step,
                "user_input step reached the execution path".to_string(),
                0,
            )
            .await
        }
        StepKind::Generate => execute_generate(ctx, step, rendered, started).await,
    }
}

/// Cache lookup, then backend calls through the retry wrapper, walking the
/// model preference list.
async fn execute_generate(
    ctx: Arc<StepContext>,
    step: StepSpec,
    prompt: String,
    started: Instant,
) -> Result<StepOutcome, ExecuteError> {
    let models: Vec<String> = if step.model_preference.is_empty() {
        vec!["default".to_string()]
    } else {
        step.model_preference.clone()
    };

    for model in &models {
        if let Some(entry) = ctx.cache.get(&prompt, model)? {
            debug!(step = %step.key, model = %model, "served from cache");
            // Cached tokens were spent when the entry was created; a hit
            // spends nothing new.
            return complete_step(
                &ctx,
                &step,
                entry.response,
                TokenCounts::default(),
                Some(model.clone()),
                true,
                0,
                started,
            )
            .await;
        }
    }

    let mut attempts_total: u32 = 0;
    let mut last_error = String::new();

    for model in &models {
        let result = retry::retry(
            &step.retry,
            Some(&ctx.cancel),
            BackendError::is_transient,
            || ctx.backend.generate(&prompt, model),
        )
        .await;

        match result {
            Ok(generation) => {
                ctx.cache
                    .put(&prompt, model, &generation.text, generation.token_counts)?;
                ctx.tracker
                    .track_step(&step.key, &step.name, model, generation.token_counts)?;
                return complete_step(
                    &ctx,
                    &step,
                    generation.text,
                    generation.token_counts,
                    Some(model.clone()),
                    false,
                    attempts_total,
                    started,
                )
                .await;
            }
            Err(RetryError::Cancelled) => {
                return skip_step(&ctx, &step).await;
            }
            Err(RetryError::NotRetryable(e)) => {
                attempts_total += 1;
                warn!(step = %step.key, model = %model, error = %e, "model failed terminally, trying next preference");
                last_error = e.to_string();
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                attempts_total += attempts;
                warn!(step = %step.key, model = %model, attempts, error = %last, "model exhausted retries, trying next preference");
                last_error = last.to_string();
            }
        }
    }

    let message = format!(
        "all {} preferred model(s) failed after {} attempt(s): {}",
        models.len(),
        attempts_total,
        last_error
    );
    fail_step(&ctx, &step, message, attempts_total).await
}

#[allow(clippy::too_many_arguments)]
async fn complete_step(
    ctx: &StepContext,
    step: &StepSpec,
    output: String,
    tokens: TokenCounts,
    model: Option<String>,
    cached: bool,
    retry_count: u32,
    started: Instant,
) -> Result<StepOutcome, ExecuteError> {
    // A result that lands after cancellation is discarded; the tokens it
    // spent are still tracked.
    if ctx.cancel.is_cancelled() {
        return skip_step(ctx, step).await;
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    ctx.events
        .append(
            ctx.run_id,
            EventType::StepCompleted,
            json!({
                "step_key": step.key,
                "output": output,
                "tokens": {"input": tokens.input, "output": tokens.output},
                "model": model,
                "cached": cached,
                "duration_ms": duration_ms,
                "retry_count": retry_count,
            }),
        )
        .await?;

    Ok(StepOutcome {
        step_key: step.key.clone(),
        result: StepResult::Completed {
            output,
            tokens,
            duration_ms,
            retry_count,
        },
    })
}

async fn skip_step(ctx: &StepContext, step: &StepSpec) -> Result<StepOutcome, ExecuteError> {
    ctx.events
        .append(
            ctx.run_id,
            EventType::StepSkipped,
            json!({"step_key": step.key, "cause": "run cancelled"}),
        )
        .await?;

    Ok(StepOutcome {
        step_key: step.key.clone(),
        result: StepResult::Skipped,
    })
}

async fn fail_step(
    ctx: &StepContext,
    step: &StepSpec,
    error: String,
    retry_count: u32,
) -> Result<StepOutcome, ExecuteError> {
    ctx.events
        .append(
            ctx.run_id,
            EventType::StepFailed,
            json!({
                "step_key": step.key,
                "error": error,
                "retry_count": retry_count,
            }),
        )
        .await?;

    Ok(StepOutcome {
        step_key: step.key.clone(),
        result: StepResult::Failed { error, retry_count },
    })
}
