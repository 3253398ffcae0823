//! Admission core shared by [`crate::stage`] and [`crate::batch`].
//!
//! The executor owns the concurrency limit, the FIFO pending queue and the
//! set of running jobs. A job is a spawned tokio task that holds an owned
//! semaphore permit for its lifetime, races the handler future against the
//! cancellation token, and reports its settlement over the settle channel.
//! All mutation of the queue happens on the single task that owns the
//! executor, so no locking is needed beyond the semaphore itself.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::Handler;
use crate::error::{Error, Result};

/// Outcome of [`BoundedExecutor::admit`], callers use it to decide whether
/// to assert backpressure on the producer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// A slot was free, the job is running.
    Started,
    /// The limit is reached, the input is parked in the pending queue.
    Queued,
}

/// Runs jobs with at most `limit` of them outstanding at once. Inputs
/// admitted beyond the limit wait in a FIFO queue and are started in
/// admission order as slots free up.
pub(crate) struct BoundedExecutor<In, H>
where
    H: Handler<In>,
{
    handler: Arc<H>,
    semaphore: Arc<Semaphore>,
    pending: VecDeque<In>,
    /// Jobs started whose settlement the owner has not processed yet. The
    /// semaphore alone cannot answer "is everything done": a job returns
    /// its permit before its settlement message is read off the channel.
    inflight: usize,
    settle_tx: mpsc::Sender<Result<H::Out>>,
    cancel_token: CancellationToken,
}

impl<In, H> BoundedExecutor<In, H>
where
    In: Send + 'static,
    H: Handler<In>,
{
    /// Creates an executor that reports settlements on `settle_tx`. A limit
    /// of zero is a configuration error, raised before any input is
    /// processed.
    pub(crate) fn new(
        limit: usize,
        handler: H,
        settle_tx: mpsc::Sender<Result<H::Out>>,
    ) -> Result<Self> {
        if limit == 0 {
            return Err(Error::Config(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            handler: Arc::new(handler),
            semaphore: Arc::new(Semaphore::new(limit)),
            pending: VecDeque::new(),
            inflight: 0,
            settle_tx,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Starts the input immediately if a slot is free, else queues it.
    pub(crate) fn admit(&mut self, input: In) -> Admission {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.start(input, permit);
                Admission::Started
            }
            Err(_) => {
                self.pending.push_back(input);
                Admission::Queued
            }
        }
    }

    /// Records one processed settlement and starts queued inputs, front
    /// first, for as long as slots are free. The settling job dropped its
    /// permit before reporting, so at least one slot is available here.
    pub(crate) fn on_settle(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
        self.advance();
    }

    /// Starts queued inputs, front first, for as long as slots are free.
    fn advance(&mut self) {
        while let Some(input) = self.pending.pop_front() {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => self.start(input, permit),
                Err(_) => {
                    self.pending.push_front(input);
                    break;
                }
            }
        }
    }

    /// Discards every queued input and cancels every running job. Cancelled
    /// jobs drop their handler future and never report a settlement.
    pub(crate) fn cancel_all(&mut self) {
        self.pending.clear();
        self.inflight = 0;
        self.cancel_token.cancel();
    }

    /// True while at least one slot is free.
    pub(crate) fn has_capacity(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// True once nothing is queued and every started job's settlement has
    /// been processed.
    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.inflight == 0
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn start(&mut self, input: In, permit: OwnedSemaphorePermit) {
        self.inflight += 1;
        let handler = Arc::clone(&self.handler);
        let settle_tx = self.settle_tx.clone();
        let cancel_token = self.cancel_token.clone();

        // short-lived tokio spawns, we don't need structured concurrency here
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    // the handler future is dropped, the settlement is
                    // never reported
                    return;
                }
                result = handler.call(input) => result,
            };
            // return the slot before reporting so the settlement handler
            // observes the freed capacity when it advances the queue
            drop(permit);
            let _ = settle_tx.send(result).await;
        });
    }
}
