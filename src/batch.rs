//! `run_all` drives a fixed, fully known collection through the bounded
//! executor. Unlike [`crate::stage`] there is no producer to push back on,
//! so queueing beyond the limit is internal bookkeeping, not a pause
//! signal.

use tokio::sync::mpsc;
use tracing::error;

use crate::Handler;
use crate::error::Result;
use crate::executor::BoundedExecutor;

/// Runs the handler over every item with at most `limit` invocations
/// outstanding at once and resolves with the number of items processed
/// successfully.
///
/// Items start in collection order; completion order depends on handler
/// latency. The first failure cancels everything still queued or running
/// and becomes the result of the whole batch, without waiting for in-flight
/// items to finish. A `limit` of zero is [`crate::Error::Config`]; an empty
/// collection resolves to zero.
pub async fn run_all<In, H, I>(items: I, limit: usize, handler: H) -> Result<usize>
where
    In: Send + 'static,
    H: Handler<In>,
    I: IntoIterator<Item = In>,
{
    let (settle_tx, mut settle_rx) = mpsc::channel(limit.max(1));
    let mut executor = BoundedExecutor::new(limit, handler, settle_tx)?;

    let mut admitted = 0usize;
    for item in items {
        executor.admit(item);
        admitted += 1;
    }
    if admitted == 0 {
        return Ok(0);
    }

    let mut processed = 0usize;
    while let Some(settlement) = settle_rx.recv().await {
        match settlement {
            Ok(_) => {
                processed += 1;
                executor.on_settle();
                if executor.is_idle() {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, processed, "batch failed, cancelling the rest");
                executor.cancel_all();
                return Err(e);
            }
        }
    }

    Ok(processed)
}
