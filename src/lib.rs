//! Concurrency-bounded asynchronous transformation for streams.
//!
//! Given a sequence of inputs (arbitrarily large, never held fully in
//! memory) and an asynchronous [`Handler`], run the handler over the inputs
//! while keeping at most a configured number of invocations outstanding at
//! once. Results are emitted as they settle, so completion order follows
//! operation latency, not admission order; admission order itself is FIFO.
//!
//! Two entry points share the same admission core:
//! - [`Stage`] is the streaming form: a write/event duplex with
//!   backpressure, graceful drain ([`Stage::end`]) and forced shutdown
//!   ([`Stage::close`]).
//! - [`run_all`] is the batch form: a fixed collection in, a count of
//!   successes out, failing fast on the first error.
//!
//! A single handler failure is escalated to whole-stage failure: everything
//! still queued is discarded, everything running is cancelled, and the
//! stage closes. Callers that want partial-failure tolerance catch errors
//! inside their handler and map them to placeholder values. The core never
//! retries and never imposes timeouts; wrap the handler (e.g. with
//! `tokio::time::timeout`) for deadlines.
//!
//! ```rust
//! use flowgate::{Error, run_all};
//!
//! #[tokio::main]
//! async fn main() {
//!     let processed = run_all(0u64..10, 3, |x: u64| async move {
//!         Ok::<u64, Error>(x * 2)
//!     })
//!     .await;
//!     assert_eq!(processed.unwrap(), 10);
//! }
//! ```

use std::future::Future;

pub mod error;

pub use error::{Error, Result};

mod executor;

/// Streaming stage with backpressure and an event-based readable side.
pub mod stage;

/// Batch driver over a fixed input collection.
pub mod batch;

pub use batch::run_all;
pub use stage::{Stage, StageEvent};

/// A `Handler` is the caller-supplied asynchronous operation applied to each
/// admitted input. Anything that returns a Future resolving to a
/// [`Result`] when called qualifies; cancellation is the Future being
/// dropped before completion.
pub trait Handler<In>: Send + Sync + 'static {
    type Out: Send + 'static;
    /// The [`Future`] returned when the handler is invoked.
    type Future: Future<Output = Result<Self::Out>> + Send + 'static;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn call(&self, input: In) -> Self::Future;
}

/// We can implement [`Handler`] for any [`Fn`] that returns a [`Future`]
/// whose output is a [`Result`], so plain async closures work.
impl<In, T, R, F> Handler<In> for F
where
    T: Send + 'static,
    R: Future<Output = Result<T>> + Send + 'static,
    F: Fn(In) -> R + Send + Sync + 'static,
{
    type Out = T;
    type Future = R;

    fn call(&self, input: In) -> R {
        self(input)
    }
}
