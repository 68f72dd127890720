use crate::error::{Fault, Result};
use crate::mailbox::{FaultTarget, Mailbox};
use std::fmt;
use std::sync::Arc;

/// Binds a producing stage to the mailbox of the stage consuming its output.
///
/// Completion travels forward only. Faults travel both ways: the producer
/// faults the consumer's mailbox, and the consumer faults the producer's
/// own input mailbox through [`Link::fault_upstream`].
pub struct Link<T> {
    consumer: Mailbox<T>,
    producer: Arc<dyn FaultTarget>,
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            consumer: self.consumer.clone(),
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Link<T> {
    /// Link a producer (known by its input mailbox) to a consumer mailbox
    pub fn new(producer: Arc<dyn FaultTarget>, consumer: Mailbox<T>) -> Self {
        Self { consumer, producer }
    }

    /// Hand one produced item to the consumer, suspending while its mailbox is full
    pub async fn forward(&self, item: T) -> Result<()> {
        self.consumer.enqueue(item).await
    }

    /// Propagate end-of-input to the consumer
    pub fn complete(&self) {
        self.consumer.close();
    }

    /// Propagate a producer-side fault to the consumer
    pub fn fault(&self, fault: Fault) {
        self.consumer.fault(fault);
    }

    /// Propagate a consumer-side fault back to the producer
    pub fn fault_upstream(&self, fault: Fault) {
        self.producer.fault(fault);
    }
}
