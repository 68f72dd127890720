use crate::error::{Fault, PipelineError, Result};
use crate::link::Link;
use crate::mailbox::{Mailbox, MailboxStats};
use crate::metrics::StageMetrics;
use async_trait::async_trait;
use futures::future::{self, Future};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of a stage.
///
/// `Idle -> Running -> Draining -> Completed`, or into `Faulted` from
/// `Running` or `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Built but not yet started
    Idle,
    /// Processing inputs while its mailbox is still open
    Running,
    /// Input closed; finishing buffered inputs
    Draining,
    /// All input processed and completion propagated
    Completed,
    /// Stopped by a fault
    Faulted,
}

impl StageState {
    /// Check whether the stage can no longer change state
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Completed | StageState::Faulted)
    }
}

/// A stage turning each input into a lazy sequence of zero or more outputs.
///
/// The returned stream is polled one output at a time, and only after the
/// previous output has been accepted downstream, so a slow consumer throttles
/// the generation itself.
pub trait FanOut: Send + 'static {
    type In: Send + 'static;
    type Out: Send + 'static;

    /// Produce the outputs for one input
    fn transform(&mut self, input: Self::In) -> BoxStream<'_, Result<Self::Out>>;

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "fan_out"
    }
}

/// A terminal stage performing a side effect per item
#[async_trait]
pub trait Sink: Send + 'static {
    type In: Send + 'static;

    /// Deliver one item; an error faults the pipeline
    async fn deliver(&mut self, item: Self::In) -> Result<()>;

    /// Called once after the last item was delivered
    async fn on_complete(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "sink"
    }
}

/// Fan-out stage built from a closure returning a stream per input
pub struct FnFanOut<In, Out, F> {
    name: String,
    transform: F,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out, S, F> FnFanOut<In, Out, F>
where
    F: FnMut(In) -> S + Send + 'static,
    S: Stream<Item = Result<Out>> + Send + 'static,
{
    /// Create a new stream fan-out stage
    pub fn new(name: impl Into<String>, transform: F) -> Self {
        Self {
            name: name.into(),
            transform,
            _types: PhantomData,
        }
    }
}

impl<In, Out, S, F> FanOut for FnFanOut<In, Out, F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: FnMut(In) -> S + Send + 'static,
    S: Stream<Item = Result<Out>> + Send + 'static,
{
    type In = In;
    type Out = Out;

    fn transform(&mut self, input: In) -> BoxStream<'_, Result<Out>> {
        (self.transform)(input).boxed()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fan-out stage built from a closure returning a lazy iterator per input
pub struct IterFanOut<In, F> {
    name: String,
    transform: F,
    _input: PhantomData<fn(In)>,
}

impl<In, I, F> IterFanOut<In, F>
where
    F: FnMut(In) -> I + Send + 'static,
    I: IntoIterator,
    I::IntoIter: Send + 'static,
{
    /// Create a new iterator fan-out stage
    pub fn new(name: impl Into<String>, transform: F) -> Self {
        Self {
            name: name.into(),
            transform,
            _input: PhantomData,
        }
    }
}

impl<In, I, F> FanOut for IterFanOut<In, F>
where
    In: Send + 'static,
    F: FnMut(In) -> I + Send + 'static,
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    type In = In;
    type Out = I::Item;

    fn transform(&mut self, input: In) -> BoxStream<'_, Result<I::Item>> {
        stream::iter((self.transform)(input).into_iter().map(Ok)).boxed()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A mapping stage that transforms each item into exactly one output
pub struct MapStage<In, Out, F> {
    name: String,
    mapper: F,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F> MapStage<In, Out, F>
where
    F: FnMut(In) -> Result<Out> + Send + 'static,
{
    /// Create a new map stage
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
            _types: PhantomData,
        }
    }
}

impl<In, Out, F> FanOut for MapStage<In, Out, F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: FnMut(In) -> Result<Out> + Send + 'static,
{
    type In = In;
    type Out = Out;

    fn transform(&mut self, input: In) -> BoxStream<'_, Result<Out>> {
        stream::once(future::ready((self.mapper)(input))).boxed()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A filtering stage that passes through items matching a predicate
pub struct FilterStage<T, F> {
    name: String,
    predicate: F,
    _item: PhantomData<fn(T)>,
}

impl<T, F> FilterStage<T, F>
where
    F: FnMut(&T) -> bool + Send + 'static,
{
    /// Create a new filter stage
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
            _item: PhantomData,
        }
    }
}

impl<T, F> FanOut for FilterStage<T, F>
where
    T: Send + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    type In = T;
    type Out = T;

    fn transform(&mut self, input: T) -> BoxStream<'_, Result<T>> {
        if (self.predicate)(&input) {
            stream::once(future::ready(Ok(input))).boxed()
        } else {
            stream::empty().boxed()
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Sink built from an async closure
pub struct FnSink<In, F> {
    name: String,
    effect: F,
    _input: PhantomData<fn(In)>,
}

impl<In, Fut, F> FnSink<In, F>
where
    F: FnMut(In) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    /// Create a new sink stage
    pub fn new(name: impl Into<String>, effect: F) -> Self {
        Self {
            name: name.into(),
            effect,
            _input: PhantomData,
        }
    }
}

#[async_trait]
impl<In, Fut, F> Sink for FnSink<In, F>
where
    In: Send + 'static,
    F: FnMut(In) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    type In = In;

    async fn deliver(&mut self, item: In) -> Result<()> {
        (self.effect)(item).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Remembers the first fault reported by any stage of one pipeline and
/// wakes every stage still suspended elsewhere in the pipeline
#[derive(Debug, Clone, Default)]
pub(crate) struct FaultLatch {
    first: Arc<Mutex<Option<Fault>>>,
    tripped: CancellationToken,
}

impl FaultLatch {
    pub(crate) fn record(&self, fault: &Fault) {
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(fault.clone());
            drop(first);
            self.tripped.cancel();
        }
    }

    pub(crate) fn get(&self) -> Option<Fault> {
        self.first.lock().clone()
    }

    /// Resolve with the first fault once one has been recorded
    pub(crate) async fn tripped(&self) -> Fault {
        self.tripped.cancelled().await;
        self.get().unwrap_or(Fault::Cancelled)
    }
}

/// Observer side of a running stage, held by the driver
#[derive(Clone)]
pub struct StageHandle {
    name: String,
    state: watch::Receiver<StageState>,
    metrics: StageMetrics,
    inbox: Arc<dyn MailboxStats>,
}

impl std::fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StageHandle {
    /// Get the stage name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> StageState {
        *self.state.borrow()
    }

    /// Get a reference to the metrics
    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Occupancy of the stage's input mailbox
    pub fn inbox(&self) -> &dyn MailboxStats {
        self.inbox.as_ref()
    }

    /// Wait until the stage reaches `Completed` or `Faulted`
    pub async fn terminated(&self) -> StageState {
        let mut state = self.state.clone();
        let terminal = match state.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            // The runner was dropped without finishing
            Err(_) => StageState::Faulted,
        };
        terminal
    }
}

/// Everything a stage task needs besides its transform and its downstream
pub(crate) struct StageContext<In> {
    name: String,
    inbox: Mailbox<In>,
    upstream: Option<Link<In>>,
    state: watch::Sender<StageState>,
    metrics: StageMetrics,
    cancel: CancellationToken,
    faults: FaultLatch,
}

impl<In: Send + 'static> StageContext<In> {
    pub(crate) fn new(
        name: String,
        inbox: Mailbox<In>,
        upstream: Option<Link<In>>,
        cancel: CancellationToken,
        faults: FaultLatch,
    ) -> (Self, StageHandle) {
        let (state, observer) = watch::channel(StageState::Idle);
        let metrics = StageMetrics::new();
        let handle = StageHandle {
            name: name.clone(),
            state: observer,
            metrics: metrics.clone(),
            inbox: Arc::new(inbox.clone()),
        };
        let ctx = Self {
            name,
            inbox,
            upstream,
            state,
            metrics,
            cancel,
            faults,
        };
        (ctx, handle)
    }

    fn set_state(&self, state: StageState) {
        self.state.send_if_modified(|current| {
            if *current == state || current.is_terminal() {
                return false;
            }
            debug!(from = ?*current, to = ?state, "stage state change");
            *current = state;
            true
        });
    }

    /// Run `fut` unless the pipeline is cancelled or faulted first
    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            fault = self.faults.tripped() => Err(PipelineError::Faulted(fault)),
            _ = self.cancel.cancelled() => Err(PipelineError::Faulted(Fault::Cancelled)),
            output = fut => Ok(output),
        }
    }

    /// Take the next input; `None` once the mailbox is closed and drained
    async fn next_input(&self) -> Result<Option<In>> {
        let input = self.cancellable(self.inbox.dequeue()).await??;
        if input.is_none() || self.inbox.is_closed() {
            self.set_state(StageState::Draining);
        }
        if input.is_some() {
            self.metrics.record_received();
        }
        Ok(input)
    }

    /// Record a fault and push it into this stage's input side
    fn fail(&self, error: PipelineError) -> Fault {
        let fault = error.into_fault(&self.name);
        self.faults.record(&fault);
        self.inbox.fault(fault.clone());
        if let Some(upstream) = &self.upstream {
            upstream.fault_upstream(fault.clone());
        }
        warn!(%fault, "stage faulted");
        self.set_state(StageState::Faulted);
        fault
    }
}

/// Drives a [`FanOut`] from its mailbox into its downstream link
pub(crate) struct FanOutRunner<F: FanOut> {
    ctx: StageContext<F::In>,
    stage: F,
    downstream: Link<F::Out>,
}

impl<F: FanOut> FanOutRunner<F> {
    pub(crate) fn new(ctx: StageContext<F::In>, stage: F, downstream: Link<F::Out>) -> Self {
        Self {
            ctx,
            stage,
            downstream,
        }
    }

    pub(crate) async fn run(mut self) -> std::result::Result<(), Fault> {
        self.ctx.set_state(StageState::Running);
        match self.process_all().await {
            Ok(()) => {
                self.downstream.complete();
                self.ctx.set_state(StageState::Completed);
                debug!(
                    received = self.ctx.metrics.total_received(),
                    emitted = self.ctx.metrics.total_emitted(),
                    "fan-out stage completed"
                );
                Ok(())
            }
            Err(error) => {
                let fault = self.ctx.fail(error);
                self.downstream.fault(fault.clone());
                Err(fault)
            }
        }
    }

    async fn process_all(&mut self) -> Result<()> {
        while let Some(input) = self.ctx.next_input().await? {
            let started = Instant::now();
            let mut outputs = self.stage.transform(input);
            // All outputs of this input are delivered before the next dequeue
            while let Some(output) = self.ctx.cancellable(outputs.next()).await? {
                let output = output?;
                self.ctx
                    .cancellable(self.downstream.forward(output))
                    .await??;
                self.ctx.metrics.record_emitted();
            }
            self.ctx.metrics.record_latency(started.elapsed());
        }
        Ok(())
    }
}

/// Drives a [`Sink`] from its mailbox until end-of-input
pub(crate) struct SinkRunner<S: Sink> {
    ctx: StageContext<S::In>,
    sink: S,
}

impl<S: Sink> SinkRunner<S> {
    pub(crate) fn new(ctx: StageContext<S::In>, sink: S) -> Self {
        Self { ctx, sink }
    }

    pub(crate) async fn run(mut self) -> std::result::Result<(), Fault> {
        self.ctx.set_state(StageState::Running);
        match self.process_all().await {
            Ok(()) => {
                self.ctx.set_state(StageState::Completed);
                debug!(
                    delivered = self.ctx.metrics.total_received(),
                    "sink stage completed"
                );
                Ok(())
            }
            Err(error) => Err(self.ctx.fail(error)),
        }
    }

    async fn process_all(&mut self) -> Result<()> {
        while let Some(item) = self.ctx.next_input().await? {
            let started = Instant::now();
            self.ctx.cancellable(self.sink.deliver(item)).await??;
            self.ctx.metrics.record_latency(started.elapsed());
        }
        self.ctx.cancellable(self.sink.on_complete()).await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::FaultTarget;

    async fn collect<F: FanOut>(stage: &mut F, input: F::In) -> Vec<F::Out> {
        stage
            .transform(input)
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_iter_fan_out() {
        let mut stage = IterFanOut::new("pairs", |n: u32| (1..=3).map(move |i| (n, i)));
        assert_eq!(collect(&mut stage, 7).await, vec![(7, 1), (7, 2), (7, 3)]);
        assert_eq!(stage.name(), "pairs");
    }

    #[tokio::test]
    async fn test_filter_stage() {
        let mut stage = FilterStage::new("even", |n: &u32| n % 2 == 0);
        assert!(collect(&mut stage, 3).await.is_empty());
        assert_eq!(collect(&mut stage, 4).await, vec![4]);
    }

    #[tokio::test]
    async fn test_map_stage() {
        let mut stage = MapStage::new("double", |n: u32| Ok(n * 2));
        assert_eq!(collect(&mut stage, 5).await, vec![10]);
    }

    #[tokio::test]
    async fn test_fn_fan_out_stream() {
        let mut stage = FnFanOut::new("repeat", |n: usize| {
            stream::iter(std::iter::repeat(n).take(n).map(Ok))
        });
        assert_eq!(collect(&mut stage, 3).await, vec![3, 3, 3]);
    }

    fn context<T: Send + 'static>(
        name: &str,
        inbox: &Mailbox<T>,
        cancel: &CancellationToken,
    ) -> (StageContext<T>, StageHandle) {
        StageContext::new(
            name.to_string(),
            inbox.clone(),
            None,
            cancel.clone(),
            FaultLatch::default(),
        )
    }

    #[tokio::test]
    async fn test_fan_out_runner_completes_downstream() {
        let cancel = CancellationToken::new();
        let inbox = Mailbox::new(2).unwrap();
        let outbox = Mailbox::new(8).unwrap();
        let (ctx, handle) = context("pairs", &inbox, &cancel);
        let link = Link::new(Arc::new(inbox.clone()) as Arc<dyn FaultTarget>, outbox.clone());
        let stage = IterFanOut::new("pairs", |n: u32| (1..=2).map(move |i| n * 10 + i));
        assert_eq!(handle.state(), StageState::Idle);

        let task = tokio::spawn(FanOutRunner::new(ctx, stage, link).run());
        inbox.enqueue(1).await.unwrap();
        inbox.enqueue(2).await.unwrap();
        inbox.close();
        task.await.unwrap().unwrap();

        let mut seen = Vec::new();
        while let Some(n) = outbox.dequeue().await.unwrap() {
            seen.push(n);
        }
        assert_eq!(seen, vec![11, 12, 21, 22]);
        assert_eq!(handle.state(), StageState::Completed);
        assert_eq!(handle.metrics().total_received(), 2);
        assert_eq!(handle.metrics().total_emitted(), 4);
    }

    #[tokio::test]
    async fn test_fan_out_runner_stops_when_another_stage_faults() {
        let cancel = CancellationToken::new();
        let faults = FaultLatch::default();
        let inbox = Mailbox::new(1).unwrap();
        let outbox: Mailbox<u64> = Mailbox::new(1).unwrap();
        let (ctx, handle) = StageContext::new(
            "counter".to_string(),
            inbox.clone(),
            None,
            cancel.clone(),
            faults.clone(),
        );
        let link = Link::new(Arc::new(inbox.clone()) as Arc<dyn FaultTarget>, outbox.clone());
        let stage = FnFanOut::new("counter", |start: u64| stream::iter((start..).map(Ok)));

        let task = tokio::spawn(FanOutRunner::new(ctx, stage, link).run());
        inbox.enqueue(0).await.unwrap();
        assert_eq!(outbox.dequeue().await.unwrap(), Some(0));

        // The stage is suspended mid-sequence on a full outbox
        let fault = Fault::stage("validate", "bad input");
        faults.record(&fault);

        assert_eq!(task.await.unwrap(), Err(fault.clone()));
        assert_eq!(handle.state(), StageState::Faulted);
        assert_eq!(outbox.fault_reason(), Some(fault));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_sink_runner_faults_on_error() {
        let cancel = CancellationToken::new();
        let inbox = Mailbox::new(4).unwrap();
        let (ctx, handle) = context("printer", &inbox, &cancel);
        let sink = FnSink::new("printer", |n: u32| async move {
            if n == 2 {
                Err(PipelineError::Stage("cannot print 2".into()))
            } else {
                Ok(())
            }
        });

        inbox.enqueue(1).await.unwrap();
        inbox.enqueue(2).await.unwrap();
        inbox.enqueue(3).await.unwrap();

        let fault = SinkRunner::new(ctx, sink).run().await.unwrap_err();
        assert!(matches!(fault, Fault::Stage { ref stage, .. } if stage == "printer"));
        assert_eq!(handle.state(), StageState::Faulted);
        assert_eq!(handle.metrics().total_received(), 2);
        assert_eq!(inbox.fault_reason(), Some(fault));
    }

    #[tokio::test]
    async fn test_runner_observes_cancellation() {
        let cancel = CancellationToken::new();
        let inbox: Mailbox<u32> = Mailbox::new(1).unwrap();
        let (ctx, handle) = context("idle", &inbox, &cancel);
        let sink = FnSink::new("idle", |_n: u32| async { Ok(()) });

        let task = tokio::spawn(SinkRunner::new(ctx, sink).run());
        cancel.cancel();

        assert_eq!(task.await.unwrap(), Err(Fault::Cancelled));
        assert_eq!(handle.terminated().await, StageState::Faulted);
    }
}
