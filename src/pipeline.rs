use crate::error::{Fault, PipelineError, Result};
use crate::link::Link;
use crate::mailbox::{FaultTarget, Mailbox};
use crate::metrics::StageMetrics;
use crate::stage::{
    FanOut, FanOutRunner, FaultLatch, Sink, SinkRunner, StageContext, StageHandle, StageState,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

type StageTask = BoxFuture<'static, std::result::Result<(), Fault>>;

/// Builds the task of a stage once the link to its consumer exists
type Attach<T> = Box<dyn FnOnce(Link<T>) -> StageTask + Send>;

/// Pipeline-wide settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name attached to every log line of the pipeline
    pub name: String,
    /// Mailbox capacity for stages that don't set their own
    pub default_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".into(),
            default_capacity: 1,
        }
    }
}

/// Per-stage overrides
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    name: Option<String>,
    capacity: Option<usize>,
}

impl StageOptions {
    /// Create options that inherit the pipeline defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the stage's own name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Capacity of the stage's input mailbox
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

#[derive(Clone)]
struct Shared {
    config: PipelineConfig,
    cancel: CancellationToken,
    faults: FaultLatch,
}

impl Shared {
    fn inbox<T: Send>(&self, options: &StageOptions) -> Result<Mailbox<T>> {
        Mailbox::new(options.capacity.unwrap_or(self.config.default_capacity))
    }

    fn span(&self, stage: &str) -> tracing::Span {
        info_span!("stage", pipeline = %self.config.name, stage = %stage)
    }

    fn fan_out<F: FanOut>(
        &self,
        name: String,
        inbox: Mailbox<F::In>,
        upstream: Option<Link<F::In>>,
        stage: F,
    ) -> (Attach<F::Out>, StageHandle) {
        let span = self.span(&name);
        let (ctx, handle) = StageContext::new(
            name,
            inbox,
            upstream,
            self.cancel.clone(),
            self.faults.clone(),
        );
        let attach: Attach<F::Out> = Box::new(move |downstream| {
            FanOutRunner::new(ctx, stage, downstream)
                .run()
                .instrument(span)
                .boxed()
        });
        (attach, handle)
    }

    fn sink<S: Sink>(
        &self,
        name: String,
        inbox: Mailbox<S::In>,
        upstream: Option<Link<S::In>>,
        sink: S,
    ) -> (StageTask, StageHandle) {
        let span = self.span(&name);
        let (ctx, handle) = StageContext::new(
            name,
            inbox,
            upstream,
            self.cancel.clone(),
            self.faults.clone(),
        );
        let task = SinkRunner::new(ctx, sink).run().instrument(span).boxed();
        (task, handle)
    }
}

/// Builder for constructing pipelines.
///
/// ```ignore
/// let pipeline = PipelineBuilder::new()
///     .fan_out(IterFanOut::new("pairs", |n: u32| (1..=5).map(move |i| (n, i))))?
///     .sink(FnSink::new("print", |pair| async move { println!("{pair:?}"); Ok(()) }))?;
/// let running = pipeline.start()?;
/// ```
pub struct PipelineBuilder {
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl PipelineBuilder {
    /// Create a new pipeline builder
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the whole pipeline configuration
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the pipeline name used in logs and summaries
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Mailbox capacity for stages without an explicit one
    pub fn with_default_capacity(mut self, capacity: usize) -> Self {
        self.config.default_capacity = capacity;
        self
    }

    /// Cancel the pipeline when `token` is cancelled.
    ///
    /// The pipeline only ever cancels a child of `token`, never `token` itself.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn into_shared(self) -> Result<Shared> {
        if self.config.default_capacity == 0 {
            return Err(PipelineError::Config(
                "default stage capacity must be at least 1".into(),
            ));
        }
        Ok(Shared {
            config: self.config,
            cancel: self.cancel.child_token(),
            faults: FaultLatch::default(),
        })
    }

    /// Start the chain with a fan-out stage
    pub fn fan_out<F: FanOut>(self, stage: F) -> Result<StageChain<F::In, F::Out>> {
        self.fan_out_with(StageOptions::default(), stage)
    }

    /// Start the chain with a fan-out stage using explicit options
    pub fn fan_out_with<F: FanOut>(
        self,
        options: StageOptions,
        stage: F,
    ) -> Result<StageChain<F::In, F::Out>> {
        let shared = self.into_shared()?;
        let inbox = shared.inbox(&options)?;
        let name = options.name.clone().unwrap_or_else(|| stage.name().to_string());
        let (pending, handle) = shared.fan_out(name, inbox.clone(), None, stage);
        Ok(StageChain {
            shared,
            head: inbox.clone(),
            tasks: Vec::new(),
            handles: vec![handle],
            pending,
            pending_inbox: Arc::new(inbox),
        })
    }

    /// Build a pipeline consisting of a single sink
    pub fn sink<S: Sink>(self, sink: S) -> Result<Pipeline<S::In>> {
        self.sink_with(StageOptions::default(), sink)
    }

    /// Build a single-sink pipeline using explicit options
    pub fn sink_with<S: Sink>(self, options: StageOptions, sink: S) -> Result<Pipeline<S::In>> {
        let shared = self.into_shared()?;
        let inbox = shared.inbox(&options)?;
        let name = options.name.clone().unwrap_or_else(|| sink.name().to_string());
        let (task, handle) = shared.sink(name, inbox.clone(), None, sink);
        Ok(Pipeline {
            shared,
            head: inbox,
            tasks: vec![task],
            handles: vec![handle],
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A partially built pipeline accepting `In` whose last stage emits `T`
pub struct StageChain<In, T> {
    shared: Shared,
    head: Mailbox<In>,
    tasks: Vec<StageTask>,
    handles: Vec<StageHandle>,
    pending: Attach<T>,
    pending_inbox: Arc<dyn FaultTarget>,
}

impl<In: Send + 'static, T: Send + 'static> StageChain<In, T> {
    /// Create the next stage's mailbox and link the pending tail stage to it
    fn link_next(&self, options: &StageOptions) -> Result<(Mailbox<T>, Link<T>)> {
        let inbox = self.shared.inbox(options)?;
        let link = Link::new(Arc::clone(&self.pending_inbox), inbox.clone());
        Ok((inbox, link))
    }

    /// Append a fan-out stage
    pub fn fan_out<F: FanOut<In = T>>(self, stage: F) -> Result<StageChain<In, F::Out>> {
        self.fan_out_with(StageOptions::default(), stage)
    }

    /// Append a fan-out stage using explicit options
    pub fn fan_out_with<F: FanOut<In = T>>(
        mut self,
        options: StageOptions,
        stage: F,
    ) -> Result<StageChain<In, F::Out>> {
        let (inbox, link) = self.link_next(&options)?;
        let name = options.name.clone().unwrap_or_else(|| stage.name().to_string());
        self.tasks.push((self.pending)(link.clone()));
        let (pending, handle) = self.shared.fan_out(name, inbox.clone(), Some(link), stage);
        self.handles.push(handle);
        Ok(StageChain {
            shared: self.shared,
            head: self.head,
            tasks: self.tasks,
            handles: self.handles,
            pending,
            pending_inbox: Arc::new(inbox),
        })
    }

    /// Terminate the chain with a sink
    pub fn sink<S: Sink<In = T>>(self, sink: S) -> Result<Pipeline<In>> {
        self.sink_with(StageOptions::default(), sink)
    }

    /// Terminate the chain with a sink using explicit options
    pub fn sink_with<S: Sink<In = T>>(
        mut self,
        options: StageOptions,
        sink: S,
    ) -> Result<Pipeline<In>> {
        let (inbox, link) = self.link_next(&options)?;
        let name = options.name.clone().unwrap_or_else(|| sink.name().to_string());
        self.tasks.push((self.pending)(link.clone()));
        let (task, handle) = self.shared.sink(name, inbox, Some(link), sink);
        self.tasks.push(task);
        self.handles.push(handle);
        Ok(Pipeline {
            shared: self.shared,
            head: self.head,
            tasks: self.tasks,
            handles: self.handles,
        })
    }
}

/// A fully linked pipeline whose stages are still `Idle`
pub struct Pipeline<In> {
    shared: Shared,
    head: Mailbox<In>,
    tasks: Vec<StageTask>,
    handles: Vec<StageHandle>,
}

impl<In: Send + 'static> Pipeline<In> {
    /// Get the handles of all stages, head first
    pub fn stages(&self) -> &[StageHandle] {
        &self.handles
    }

    /// Spawn every stage onto the current tokio runtime
    pub fn start(self) -> Result<RunningPipeline<In>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            PipelineError::Config(format!("pipeline must be started inside a tokio runtime: {e}"))
        })?;

        let joins = self
            .tasks
            .into_iter()
            .map(|task| runtime.spawn(task))
            .collect();

        info!(
            pipeline = %self.shared.config.name,
            stages = self.handles.len(),
            "pipeline started"
        );

        Ok(RunningPipeline {
            input: PipelineInput {
                head: self.head,
                cancel: self.shared.cancel.clone(),
            },
            shared: self.shared,
            joins,
            handles: self.handles,
        })
    }
}

/// Clonable feeding handle of a running pipeline
pub struct PipelineInput<In> {
    head: Mailbox<In>,
    cancel: CancellationToken,
}

impl<In> Clone for PipelineInput<In> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<In: Send + 'static> PipelineInput<In> {
    /// Feed one item to the first stage, suspending while its mailbox is full.
    ///
    /// Fails with [`PipelineError::Closed`] after [`complete`](Self::complete)
    /// and with [`PipelineError::Faulted`] once the pipeline has faulted.
    pub async fn submit(&self, item: In) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Faulted(Fault::Cancelled)),
            result = self.head.enqueue(item) => result,
        }
    }

    /// Signal end of input; stages complete one after another once drained
    pub fn complete(&self) {
        debug!("pipeline input completed");
        self.head.close();
    }
}

/// A running pipeline that can be fed, cancelled and awaited
pub struct RunningPipeline<In> {
    input: PipelineInput<In>,
    shared: Shared,
    joins: Vec<JoinHandle<std::result::Result<(), Fault>>>,
    handles: Vec<StageHandle>,
}

impl<In: Send + 'static> RunningPipeline<In> {
    /// Get a handle that can feed the pipeline from other tasks
    pub fn input(&self) -> PipelineInput<In> {
        self.input.clone()
    }

    /// Feed one item to the first stage
    pub async fn submit(&self, item: In) -> Result<()> {
        self.input.submit(item).await
    }

    /// Signal end of input
    pub fn complete(&self) {
        self.input.complete();
    }

    /// Fault the pipeline with [`Fault::Cancelled`]
    pub fn cancel(&self) {
        info!(pipeline = %self.shared.config.name, "pipeline cancelled");
        self.shared.cancel.cancel();
    }

    /// Get the handles of all stages, head first
    pub fn stages(&self) -> &[StageHandle] {
        &self.handles
    }

    /// Get the current state of every stage
    pub fn stage_states(&self) -> Vec<StageState> {
        self.handles.iter().map(StageHandle::state).collect()
    }

    /// Get the metrics of the stage at `index`
    pub fn stage_metrics(&self, index: usize) -> Option<&StageMetrics> {
        self.handles.get(index).map(StageHandle::metrics)
    }

    /// Format a per-stage summary of metrics and mailbox occupancy
    pub fn metrics_summary(&self) -> String {
        let mut summary = format!("Pipeline `{}` metrics:\n", self.shared.config.name);
        for (i, handle) in self.handles.iter().enumerate() {
            let inbox = handle.inbox();
            summary.push_str(&format!(
                "  Stage {} `{}` ({:?}): {}, inbox peak: {}/{}, producer blocks: {}\n",
                i,
                handle.name(),
                handle.state(),
                handle.metrics().snapshot(),
                inbox.peak_len(),
                inbox.capacity(),
                inbox.block_count()
            ));
        }
        summary
    }

    /// Wait until every stage has terminated.
    ///
    /// Returns `Ok(())` when the sink completed, otherwise the first fault
    /// observed anywhere in the pipeline.
    pub async fn await_completion(self) -> Result<()> {
        let mut joins: FuturesUnordered<_> = self.joins.into_iter().collect();
        let mut panicked = None;
        while let Some(joined) = joins.next().await {
            if let Err(e) = joined {
                if panicked.is_none() {
                    error!(error = %e, "stage task panicked, cancelling pipeline");
                    // The panicked stage cannot propagate anything itself
                    self.shared.cancel.cancel();
                    panicked = Some(e.to_string());
                }
            }
        }

        if let Some(e) = panicked {
            return Err(PipelineError::Join(e));
        }
        if let Some(fault) = self.shared.faults.get() {
            return Err(PipelineError::Faulted(fault));
        }
        info!(pipeline = %self.shared.config.name, "pipeline completed");
        Ok(())
    }
}
