//! weft - Event-sourced multi-step generation pipeline runner
//!
//! Runs declarative pipeline templates whose steps call a text generation
//! backend, with dependency-ordered scheduling, retries, response caching,
//! and token accounting.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state changes are recorded as immutable, sequenced events
//! - A run's current state can be rebuilt by replaying its events
//! - Paused runs resume from the step that was waiting
//!
//! Workspaces isolate everything: each workspace gets its own storage
//! directory, and runs, cache entries, and usage records never cross
//! workspace boundaries.
//!
//! # Modules
//!
//! - `backend`: Generation backend trait and the subprocess implementation
//! - `core`: Execution logic (executor, event store, cache, retry, tokens)
//! - `domain`: Data structures (templates, runs, events)
//! - `storage`: Workspace-scoped key/value storage over SQLite
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! weft run pipelines/blog.yaml --input topic="rust iterators"
//!
//! # Check run status
//! weft status <run-id>
//!
//! # Resume a paused run
//! weft resume <run-id> pipelines/blog.yaml --value review=approved
//! ```

pub mod backend;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod storage;

// Re-export main types at crate root for convenience
pub use crate::backend::{CommandBackend, Generation, GenerationBackend, TokenCounts};
pub use crate::core::{CancelToken, ExecuteError, PipelineExecutor, ResponseCache, RetryPolicy};
pub use crate::domain::{Event, EventType, PipelineRun, PipelineTemplate, RunStatus, StepStatus};
pub use crate::storage::{StorageError, StorageManager};
