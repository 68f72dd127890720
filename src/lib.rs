//! A bounded asynchronous pipeline engine with lazy fan-out.
//!
//! Stages pass items through fixed-capacity mailboxes. A full mailbox
//! suspends its producer, so a slow consumer throttles everything upstream
//! of it, down to the rate at which a fan-out stage generates outputs.
//! Completion and faults propagate along the links between stages.
//!
//! # Features
//!
//! - Bounded mailboxes on top of crossbeam's `ArrayQueue`
//! - Fan-out stages producing lazy, suspendable output streams
//! - Sink stages performing async side effects
//! - Completion propagation and bidirectional fault propagation
//! - Cancellation observed at every suspension point
//! - Cursor-paginated batch sources drained under backpressure
//! - Per-stage metrics: counts, throughput, latency percentiles
//!
//! # Example
//!
//! ```ignore
//! use stream_dataflow::{FnSink, IterFanOut, PipelineBuilder};
//!
//! let running = PipelineBuilder::new()
//!     .with_default_capacity(1)
//!     .fan_out(IterFanOut::new("pairs", |n: u32| (1..=5).map(move |i| (n, i))))?
//!     .sink(FnSink::new("print", |pair| async move {
//!         println!("{pair:?}");
//!         Ok(())
//!     }))?
//!     .start()?;
//!
//! for n in 1..=5 {
//!     running.submit(n).await?;
//! }
//! running.complete();
//! running.await_completion().await?;
//! ```

pub mod error;
pub mod link;
pub mod mailbox;
pub mod metrics;
pub mod pipeline;
pub mod source;
pub mod stage;

// Re-exports for convenience
pub use error::{Fault, PipelineError, Result};
pub use link::Link;
pub use mailbox::{FaultTarget, Mailbox, MailboxStats};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineConfig, PipelineInput, RunningPipeline, StageChain,
    StageOptions,
};
pub use source::{Batch, BatchSource, PaginatedFanOut, SimulatedSource};
pub use stage::{
    FanOut, FilterStage, FnFanOut, FnSink, IterFanOut, MapStage, Sink, StageHandle, StageState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
