//! Execution core: scheduling, retries, caching, events, token accounting.

pub mod cache;
pub mod cancel;
pub mod event_store;
pub mod executor;
pub mod render;
pub mod retry;
pub mod tokens;

pub use cache::{cache_key, CacheEntry, CacheStats, ResponseCache};
pub use cancel::CancelToken;
pub use event_store::EventStore;
pub use executor::{ExecuteError, ExecutorConfig, PipelineExecutor};
pub use render::{render, RenderContext, RenderError};
pub use retry::{retry, RetryError, RetryPolicy};
pub use tokens::{PipelineRunTokens, StepUsage, TokenTracker, TotalUsage, TrackerError};
