//! Domain types for the weft pipeline runner.
//!
//! - Templates: immutable pipeline definitions, validated at load time
//! - Runs: mutable execution aggregates, reconstructible from events
//! - Events: immutable records of every state transition

pub mod events;
pub mod run;
pub mod template;

pub use events::{Event, EventType};
pub use run::{PipelineRun, RunStatus, StepExecution, StepStatus};
pub use template::{
    InputKind, InputSpec, PipelineTemplate, StepKind, StepSpec, TemplateError,
};
