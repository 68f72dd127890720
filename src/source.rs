//! Cursor-paginated batch sources and the fan-out stage that drains them.
//!
//! A [`BatchSource`] is an external collaborator: given a key and the last
//! identifier seen so far it returns the next page of identifiers, and an
//! empty page means there is nothing more for that key. [`PaginatedFanOut`]
//! turns every key it receives into a lazy sequence of [`Batch`]es, fetching
//! the next page only once the previous batch has been accepted downstream.

use crate::error::{PipelineError, Result};
use crate::stage::FanOut;
use async_stream::stream;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A paginated source of identifiers grouped by key
#[async_trait]
pub trait BatchSource: Send + Sync + 'static {
    /// Identifier type, also used as the pagination cursor
    type Id: Clone + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the page following `after` (`None` for the first page).
    ///
    /// An empty result ends pagination for `key`.
    async fn fetch_next_batch(
        &self,
        key: &str,
        after: Option<&Self::Id>,
    ) -> std::result::Result<Vec<Self::Id>, Self::Error>;
}

#[async_trait]
impl<S: BatchSource> BatchSource for Arc<S> {
    type Id = S::Id;
    type Error = S::Error;

    async fn fetch_next_batch(
        &self,
        key: &str,
        after: Option<&Self::Id>,
    ) -> std::result::Result<Vec<Self::Id>, Self::Error> {
        (**self).fetch_next_batch(key, after).await
    }
}

/// One page of identifiers for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<Id> {
    pub key: String,
    pub ids: Vec<Id>,
}

/// Fan-out stage mapping each key to the batches a [`BatchSource`] yields for it
pub struct PaginatedFanOut<S> {
    name: String,
    source: Arc<S>,
}

impl<S: BatchSource> PaginatedFanOut<S> {
    /// Create a new paginated fan-out stage over `source`
    pub fn new(name: impl Into<String>, source: S) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(source),
        }
    }
}

impl<S: BatchSource> FanOut for PaginatedFanOut<S> {
    type In = String;
    type Out = Batch<S::Id>;

    fn transform(&mut self, key: String) -> BoxStream<'_, Result<Batch<S::Id>>> {
        let source = Arc::clone(&self.source);
        stream! {
            let mut cursor: Option<S::Id> = None;
            let mut page = 0usize;
            loop {
                let ids = match source.fetch_next_batch(&key, cursor.as_ref()).await {
                    Ok(ids) => ids,
                    Err(e) => {
                        yield Err(PipelineError::Adapter(e.to_string()));
                        break;
                    }
                };
                let Some(last) = ids.last().cloned() else {
                    trace!(%key, pages = page, "pagination exhausted");
                    break;
                };
                page += 1;
                trace!(%key, page, len = ids.len(), "fetched batch");
                cursor = Some(last);
                yield Ok(Batch { key: key.clone(), ids });
            }
        }
        .boxed()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Stand-in database that pages random subscriber ids.
///
/// The first page for a key is always non-empty; every later page exists with
/// probability `continue_chance`. Inject a seeded RNG for reproducible runs.
pub struct SimulatedSource<R = StdRng> {
    rng: Mutex<R>,
    continue_chance: f64,
    delay: Duration,
    batch_size: usize,
}

impl SimulatedSource<StdRng> {
    /// Simulated source with a deterministic RNG
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng + Send + 'static> SimulatedSource<R> {
    /// Create a simulated source drawing from `rng`
    pub fn new(rng: R) -> Self {
        Self {
            rng: Mutex::new(rng),
            continue_chance: 0.7,
            delay: Duration::from_secs(1),
            batch_size: 5,
        }
    }

    /// Probability that another page follows a non-first page, clamped to `0.0..=1.0`
    pub fn with_continue_chance(mut self, chance: f64) -> Self {
        self.continue_chance = chance.clamp(0.0, 1.0);
        self
    }

    /// Simulated latency of every non-empty fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of ids per page, at least 1
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl<R: Rng + Send + 'static> BatchSource for SimulatedSource<R> {
    type Id = u32;
    type Error = Infallible;

    async fn fetch_next_batch(
        &self,
        _key: &str,
        after: Option<&u32>,
    ) -> std::result::Result<Vec<u32>, Infallible> {
        let has_more = {
            let mut rng = self.rng.lock();
            after.is_none() || rng.gen_bool(self.continue_chance)
        };
        if !has_more {
            return Ok(Vec::new());
        }

        tokio::time::sleep(self.delay).await;

        let mut rng = self.rng.lock();
        Ok((0..self.batch_size)
            .map(|_| rng.gen_range(1..10_000))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, thiserror::Error)]
    #[error("source unavailable")]
    struct Unavailable;

    /// Serves a fixed list of pages per key and records every cursor it sees
    #[derive(Default)]
    struct ScriptedSource {
        pages: HashMap<String, Vec<Vec<u64>>>,
        cursors: Mutex<Vec<Option<u64>>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl BatchSource for ScriptedSource {
        type Id = u64;
        type Error = Unavailable;

        async fn fetch_next_batch(
            &self,
            key: &str,
            after: Option<&u64>,
        ) -> std::result::Result<Vec<u64>, Unavailable> {
            let mut cursors = self.cursors.lock();
            cursors.push(after.copied());
            if self.fail_after.is_some_and(|n| cursors.len() > n) {
                return Err(Unavailable);
            }
            let pages = self.pages.get(key).cloned().unwrap_or_default();
            let index = match after {
                None => 0,
                Some(last) => pages
                    .iter()
                    .position(|page| page.last() == Some(last))
                    .map_or(pages.len(), |i| i + 1),
            };
            Ok(pages.get(index).cloned().unwrap_or_default())
        }
    }

    async fn drain<S: BatchSource>(
        stage: &mut PaginatedFanOut<S>,
        key: &str,
    ) -> Vec<Result<Batch<S::Id>>> {
        stage.transform(key.to_string()).collect().await
    }

    #[tokio::test]
    async fn test_pages_until_empty_and_advances_cursor() {
        let mut source = ScriptedSource::default();
        source
            .pages
            .insert("Gaming".into(), vec![vec![1, 2], vec![3, 4, 5]]);
        let mut stage = PaginatedFanOut::new("subscribers", source);

        let batches: Vec<_> = drain(&mut stage, "Gaming")
            .await
            .into_iter()
            .map(|b| b.unwrap())
            .collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].ids, vec![1, 2]);
        assert_eq!(batches[1].ids, vec![3, 4, 5]);
        assert!(batches.iter().all(|b| b.key == "Gaming"));
        assert_eq!(*stage.source.cursors.lock(), vec![None, Some(2), Some(5)]);
    }

    #[tokio::test]
    async fn test_empty_first_page_yields_nothing() {
        let mut stage = PaginatedFanOut::new("subscribers", ScriptedSource::default());
        assert!(drain(&mut stage, "Nobody").await.is_empty());
    }

    #[tokio::test]
    async fn test_source_error_ends_sequence() {
        let mut source = ScriptedSource {
            fail_after: Some(1),
            ..Default::default()
        };
        source
            .pages
            .insert("Gaming".into(), vec![vec![1], vec![2]]);
        let mut stage = PaginatedFanOut::new("subscribers", source);

        let results = drain(&mut stage, "Gaming").await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(PipelineError::Adapter(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_source_first_page_always_present() {
        let source = SimulatedSource::seeded(7).with_continue_chance(0.0);
        let first = source.fetch_next_batch("Gaming", None).await.unwrap();
        assert_eq!(first.len(), 5);
        assert!(first.iter().all(|id| (1..10_000).contains(id)));
        let second = source
            .fetch_next_batch("Gaming", first.last())
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_source_is_deterministic_when_seeded() {
        let a = SimulatedSource::seeded(42).with_delay(Duration::ZERO);
        let b = SimulatedSource::seeded(42).with_delay(Duration::ZERO);
        for _ in 0..3 {
            assert_eq!(
                a.fetch_next_batch("k", None).await.unwrap(),
                b.fetch_next_batch("k", None).await.unwrap()
            );
        }
    }
}
