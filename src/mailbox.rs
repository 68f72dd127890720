use crate::error::{Fault, PipelineError, Result};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
enum MailboxState {
    Open,
    Closed,
    Faulted(Fault),
}

struct Inner<T> {
    queue: ArrayQueue<T>,
    // Pushes, closes and faults all happen under this lock, so a consumer that
    // sees `Closed` with an empty queue has really seen the last item.
    state: Mutex<MailboxState>,
    not_full: Notify,
    not_empty: Notify,
    peak_len: AtomicUsize,
    block_count: AtomicU64,
}

/// A fixed-capacity FIFO queue with suspending enqueue and dequeue.
///
/// Cloning a mailbox yields another handle to the same queue. The consuming
/// stage dequeues; any number of producers may enqueue.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.inner.queue.len())
            .field("capacity", &self.inner.queue.capacity())
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl<T: Send> Mailbox<T> {
    /// Create a new mailbox holding at most `capacity` items
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::Config(
                "mailbox capacity must be at least 1".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                queue: ArrayQueue::new(capacity),
                state: Mutex::new(MailboxState::Open),
                not_full: Notify::new(),
                not_empty: Notify::new(),
                peak_len: AtomicUsize::new(0),
                block_count: AtomicU64::new(0),
            }),
        })
    }

    /// Append an item, suspending while the mailbox is full.
    ///
    /// Fails with [`PipelineError::Closed`] once the mailbox is closed and
    /// with [`PipelineError::Faulted`] once it is faulted, including when the
    /// state changes while the caller is suspended.
    pub async fn enqueue(&self, item: T) -> Result<()> {
        let mut item = item;
        loop {
            let notified = self.inner.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock();
                match &*state {
                    MailboxState::Faulted(fault) => {
                        return Err(PipelineError::Faulted(fault.clone()))
                    }
                    MailboxState::Closed => return Err(PipelineError::Closed),
                    MailboxState::Open => {}
                }
                match self.inner.queue.push(item) {
                    Ok(()) => {
                        self.inner
                            .peak_len
                            .fetch_max(self.inner.queue.len(), Ordering::Relaxed);
                        drop(state);
                        self.inner.not_empty.notify_one();
                        return Ok(());
                    }
                    Err(rejected) => item = rejected,
                }
            }

            self.inner.block_count.fetch_add(1, Ordering::Relaxed);
            trace!(capacity = self.capacity(), "mailbox full, producer suspended");
            notified.await;
        }
    }

    /// Take the next item, suspending while the mailbox is empty and open.
    ///
    /// Returns `Ok(None)` once the mailbox is closed and drained.
    pub async fn dequeue(&self) -> Result<Option<T>> {
        loop {
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock();
                if let MailboxState::Faulted(fault) = &*state {
                    return Err(PipelineError::Faulted(fault.clone()));
                }
                if let Some(item) = self.inner.queue.pop() {
                    drop(state);
                    self.inner.not_full.notify_one();
                    return Ok(Some(item));
                }
                if *state == MailboxState::Closed {
                    return Ok(None);
                }
            }

            trace!("mailbox empty, consumer suspended");
            notified.await;
        }
    }

    /// Mark that no more items will arrive. Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if *state != MailboxState::Open {
            return;
        }
        *state = MailboxState::Closed;
        drop(state);
        self.wake_all();
    }

    /// Put the mailbox into its terminal failed state.
    ///
    /// Buffered items are discarded and every suspended caller fails. Only
    /// the first fault is kept; returns `false` if the mailbox was already faulted.
    pub fn fault(&self, fault: Fault) -> bool {
        let mut state = self.inner.state.lock();
        if matches!(*state, MailboxState::Faulted(_)) {
            return false;
        }
        *state = MailboxState::Faulted(fault);
        while self.inner.queue.pop().is_some() {}
        drop(state);
        self.wake_all();
        true
    }

    fn wake_all(&self) {
        self.inner.not_empty.notify_waiters();
        self.inner.not_full.notify_waiters();
    }

    /// Get the current number of buffered items
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Check if the mailbox is empty
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Get the capacity of the mailbox
    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    /// Check whether `close` has been called (and no fault has occurred)
    pub fn is_closed(&self) -> bool {
        *self.inner.state.lock() == MailboxState::Closed
    }

    /// Get the fault this mailbox ended with, if any
    pub fn fault_reason(&self) -> Option<Fault> {
        match &*self.inner.state.lock() {
            MailboxState::Faulted(fault) => Some(fault.clone()),
            _ => None,
        }
    }

    /// Get the largest number of items ever buffered at once
    pub fn peak_len(&self) -> usize {
        self.inner.peak_len.load(Ordering::Relaxed)
    }

    /// Get the number of times a producer was suspended on a full mailbox
    pub fn block_count(&self) -> u64 {
        self.inner.block_count.load(Ordering::Relaxed)
    }
}

/// Type-erased handle used to fault a mailbox without knowing its item type.
pub trait FaultTarget: Send + Sync {
    /// Fault the underlying mailbox, returning `false` if it was already faulted
    fn fault(&self, fault: Fault) -> bool;
}

impl<T: Send> FaultTarget for Mailbox<T> {
    fn fault(&self, fault: Fault) -> bool {
        Mailbox::fault(self, fault)
    }
}

/// Type-erased, read-only view of a mailbox's occupancy
pub trait MailboxStats: Send + Sync {
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
    fn peak_len(&self) -> usize;
    fn block_count(&self) -> u64;
}

impl<T: Send> MailboxStats for Mailbox<T> {
    fn len(&self) -> usize {
        Mailbox::len(self)
    }

    fn capacity(&self) -> usize {
        Mailbox::capacity(self)
    }

    fn peak_len(&self) -> usize {
        Mailbox::peak_len(self)
    }

    fn block_count(&self) -> u64 {
        Mailbox::block_count(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mailbox_fifo() {
        let mailbox = Mailbox::new(4).unwrap();
        for i in 0..4 {
            mailbox.enqueue(i).await.unwrap();
        }
        for i in 0..4 {
            assert_eq!(mailbox.dequeue().await.unwrap(), Some(i));
        }
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = Mailbox::<u32>::new(0);
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let mailbox = Mailbox::new(2).unwrap();
        mailbox.enqueue(1).await.unwrap();
        mailbox.close();
        mailbox.close();
        assert!(mailbox.is_closed());
        assert_eq!(mailbox.dequeue().await.unwrap(), Some(1));
        assert_eq!(mailbox.dequeue().await.unwrap(), None);
        assert_eq!(mailbox.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let mailbox = Mailbox::new(2).unwrap();
        mailbox.close();
        assert!(matches!(
            mailbox.enqueue(7).await,
            Err(PipelineError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_producer_suspends_until_dequeue() {
        let mailbox = Mailbox::new(1).unwrap();
        mailbox.enqueue(1).await.unwrap();

        let producer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.enqueue(2).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(mailbox.len(), 1);

        assert_eq!(mailbox.dequeue().await.unwrap(), Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(mailbox.dequeue().await.unwrap(), Some(2));
        assert!(mailbox.block_count() >= 1);
        assert_eq!(mailbox.peak_len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_close() {
        let mailbox: Mailbox<u32> = Mailbox::new(1).unwrap();
        let consumer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.close();
        assert_eq!(consumer.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_fault_discards_items_and_unblocks_producer() {
        let mailbox = Mailbox::new(1).unwrap();
        mailbox.enqueue(1).await.unwrap();

        let producer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.enqueue(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fault = Fault::stage("consumer", "boom");
        assert!(mailbox.fault(fault.clone()));
        assert!(!mailbox.fault(Fault::Cancelled));

        match producer.await.unwrap() {
            Err(PipelineError::Faulted(f)) => assert_eq!(f, fault),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(mailbox.is_empty());
        assert!(matches!(
            mailbox.dequeue().await,
            Err(PipelineError::Faulted(_))
        ));
        assert_eq!(mailbox.fault_reason(), Some(fault));
    }

    #[tokio::test]
    async fn test_fault_after_close() {
        let mailbox = Mailbox::new(2).unwrap();
        mailbox.enqueue(1).await.unwrap();
        mailbox.close();
        assert!(mailbox.fault(Fault::Cancelled));
        assert!(!mailbox.is_closed());
        assert!(matches!(
            mailbox.dequeue().await,
            Err(PipelineError::Faulted(Fault::Cancelled))
        ));
    }
}
