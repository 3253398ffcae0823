//! Streaming front of the bounded executor.
//!
//! A [`Stage`] is a write/event duplex: a producer pushes inputs in with
//! [`Stage::write`], a consumer pulls [`StageEvent`]s out of the stream
//! returned by [`Stage::new`]. A single driver task owns the executor and
//! runs the lifecycle state machine (`open -> ending -> closed`), so every
//! admission, settlement and state transition happens on one task.
//!
//! Backpressure is a request/ready protocol rather than a pause flag: the
//! command channel is bounded and the driver only receives writes while the
//! executor has a free slot, so a producer that outruns the limit suspends
//! in `write` until a settlement frees capacity.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Handler;
use crate::error::{Error, Result};
use crate::executor::BoundedExecutor;

/// Writes buffered ahead of the driver. Kept minimal so the pending work a
/// producer can pile up beyond the concurrency limit stays bounded.
const CMD_CHANNEL_SIZE: usize = 1;

/// Event channel size for the readable side.
const EVENT_CHANNEL_SIZE: usize = 64;

/// One message on the readable side of a [`Stage`].
///
/// A well-behaved stage emits any number of `Data` events, then either
/// `End` followed by `Closed` (graceful drain) or a single `Error` followed
/// by `Closed` (fail-fast). `Closed` is emitted exactly once and nothing
/// follows it.
#[derive(Debug, PartialEq)]
pub enum StageEvent<T> {
    /// One successful handler result, in settlement order.
    Data(T),
    /// The first handler failure. Everything outstanding has been cancelled.
    Error(Error),
    /// Graceful drain completed, every admitted input has settled.
    End,
    /// Terminal. The stage accepts no further writes and emits nothing more.
    Closed,
}

enum Command<In> {
    Write(In),
    End(Option<In>),
}

/// Write side of a bounded-concurrency transformation stage.
///
/// Dropping the stage without calling [`Stage::end`] closes the command
/// channel, which the driver treats as a graceful end: in-flight and queued
/// work still settles and the event stream terminates with `End`, `Closed`.
pub struct Stage<In> {
    cmd_tx: mpsc::Sender<Command<In>>,
    close_token: CancellationToken,
}

impl<In> Stage<In>
where
    In: Send + 'static,
{
    /// Creates the stage and spawns its driver task. Returns the write side
    /// and the event stream of the readable side.
    ///
    /// A `limit` of zero is [`Error::Config`].
    pub fn new<H>(
        limit: usize,
        handler: H,
    ) -> Result<(Self, ReceiverStream<StageEvent<H::Out>>)>
    where
        H: Handler<In>,
    {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let (settle_tx, settle_rx) = mpsc::channel(limit.max(1));

        let executor = BoundedExecutor::new(limit, handler, settle_tx)?;
        let close_token = CancellationToken::new();

        let driver = Driver {
            executor,
            cmd_rx,
            settle_rx,
            event_tx,
            close_token: close_token.clone(),
            ending: false,
            writes_done: false,
        };
        tokio::spawn(driver.run());

        Ok((
            Self {
                cmd_tx,
                close_token,
            },
            ReceiverStream::new(event_rx),
        ))
    }

    /// Admits one input. Suspends while the stage is at its concurrency
    /// limit; that suspension is the backpressure signal. Returns
    /// [`Error::Stage`] once the stage has ended or closed; a write racing
    /// an in-flight [`Stage::end`] may instead be accepted and discarded
    /// with a warning.
    pub async fn write(&self, input: In) -> Result<()> {
        self.cmd_tx
            .send(Command::Write(input))
            .await
            .map_err(|_| Error::Stage("stage is no longer accepting writes".to_string()))
    }

    /// Requests a graceful drain: no further writes are accepted and the
    /// event stream terminates with `End`, `Closed` once everything
    /// outstanding has settled.
    pub async fn end(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::End(None))
            .await
            .map_err(|_| Error::Stage("stage is no longer accepting writes".to_string()))
    }

    /// Same as [`Stage::end`] with one final write before the drain.
    pub async fn end_with(&self, input: In) -> Result<()> {
        self.cmd_tx
            .send(Command::End(Some(input)))
            .await
            .map_err(|_| Error::Stage("stage is no longer accepting writes".to_string()))
    }

    /// Forced shutdown: discards queued inputs, cancels running jobs and
    /// emits `Closed` without draining. Idempotent, callable from any
    /// state; no `Data` or `Error` event is emitted afterwards.
    pub fn close(&self) {
        self.close_token.cancel();
    }

    /// Pipe-style forwarding: consumes `input_stream` through a stage and
    /// returns the stream of successful results plus the handle carrying
    /// the final status. In case of a handler failure the output stream is
    /// cut short and the handle resolves to that error.
    pub fn transform_stream<H>(
        input_stream: ReceiverStream<In>,
        limit: usize,
        handler: H,
    ) -> Result<(ReceiverStream<H::Out>, JoinHandle<Result<()>>)>
    where
        H: Handler<In>,
    {
        let (stage, mut events) = Stage::new(limit, handler)?;
        let (output_tx, output_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let handle = tokio::spawn(async move {
            let writer = tokio::spawn(async move {
                let mut input_stream = input_stream;
                while let Some(input) = input_stream.next().await {
                    // the stage closing mid-write means a failure was
                    // already escalated, the event loop below reports it
                    if stage.write(input).await.is_err() {
                        break;
                    }
                }
                let _ = stage.end().await;
            });

            let mut final_result = Ok(());
            while let Some(event) = events.next().await {
                match event {
                    StageEvent::Data(out) => {
                        if output_tx.send(out).await.is_err() {
                            break;
                        }
                    }
                    StageEvent::Error(e) => final_result = Err(e),
                    StageEvent::End | StageEvent::Closed => {}
                }
            }

            // if the consumer went away mid-stream the driver may be
            // blocked on a full event channel; dropping the receiver fails
            // its next send, so it cancels outstanding work and releases
            // the writer
            drop(events);

            writer
                .await
                .map_err(|e| Error::Stage(format!("writer task failed: {e}")))?;
            final_result
        });

        Ok((ReceiverStream::new(output_rx), handle))
    }
}

/// Owns the executor and runs the stage lifecycle on a single task.
struct Driver<In, H>
where
    H: Handler<In>,
{
    executor: BoundedExecutor<In, H>,
    cmd_rx: mpsc::Receiver<Command<In>>,
    settle_rx: mpsc::Receiver<Result<H::Out>>,
    event_tx: mpsc::Sender<StageEvent<H::Out>>,
    close_token: CancellationToken,
    /// Graceful end requested, draining what is outstanding.
    ending: bool,
    /// Command channel closed, stop polling it.
    writes_done: bool,
}

impl<In, H> Driver<In, H>
where
    In: Send + 'static,
    H: Handler<In>,
{
    async fn run(mut self) {
        loop {
            // close first, then settlements, then new writes, so a forced
            // close is never outrun by buffered work
            tokio::select! {
                biased;
                _ = self.close_token.cancelled() => {
                    self.executor.cancel_all();
                    let _ = self.event_tx.send(StageEvent::Closed).await;
                    return;
                }
                Some(settlement) = self.settle_rx.recv() => {
                    if self.on_settle(settlement).await {
                        return;
                    }
                }
                cmd = self.cmd_rx.recv(), if !self.writes_done
                    && (self.ending || self.executor.has_capacity()) => {
                    if self.on_command(cmd).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true when the stage reached its terminal state.
    async fn on_settle(&mut self, settlement: Result<H::Out>) -> bool {
        match settlement {
            Ok(out) => {
                if self.event_tx.send(StageEvent::Data(out)).await.is_err() {
                    // consumer went away, nothing left to emit to
                    self.executor.cancel_all();
                    return true;
                }
                self.executor.on_settle();
                if self.ending && self.executor.is_idle() {
                    self.finalize().await;
                    return true;
                }
                false
            }
            Err(e) => {
                error!(error = %e, "handler failed, cancelling outstanding work");
                self.executor.cancel_all();
                let _ = self.event_tx.send(StageEvent::Error(e)).await;
                let _ = self.event_tx.send(StageEvent::Closed).await;
                true
            }
        }
    }

    /// Returns true when the stage reached its terminal state.
    async fn on_command(&mut self, cmd: Option<Command<In>>) -> bool {
        match cmd {
            Some(Command::Write(input)) => {
                if self.ending {
                    warn!("stage is ending, not accepting the write");
                } else {
                    self.executor.admit(input);
                }
                false
            }
            Some(Command::End(last)) => {
                if self.ending {
                    warn!("stage is already ending, ignoring repeated end");
                    return false;
                }
                if let Some(input) = last {
                    self.executor.admit(input);
                }
                // refuse further sends so a producer writing past the end
                // gets an error instead of a silent drop; commands already
                // buffered are still delivered
                self.cmd_rx.close();
                self.begin_drain().await
            }
            None => {
                // every write handle dropped, same as a graceful end
                self.writes_done = true;
                if self.ending {
                    return false;
                }
                self.begin_drain().await
            }
        }
    }

    async fn begin_drain(&mut self) -> bool {
        self.ending = true;
        if self.executor.is_idle() {
            self.finalize().await;
            return true;
        }
        false
    }

    async fn finalize(&mut self) {
        info!("stage drained, all admitted inputs have settled");
        let _ = self.event_tx.send(StageEvent::End).await;
        let _ = self.event_tx.send(StageEvent::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    fn doubler() -> impl Handler<u32, Out = u32> {
        |i: u32| async move { Ok::<_, Error>(i * 2) }
    }

    #[tokio::test]
    async fn emits_all_data_then_end_then_closed() {
        let (stage, mut events) = Stage::new(3, doubler()).unwrap();

        for i in 0..8 {
            stage.write(i).await.unwrap();
        }
        stage.end().await.unwrap();

        let mut data = Vec::new();
        let mut tail = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                StageEvent::Data(v) => {
                    assert!(tail.is_empty(), "no data after end");
                    data.push(v);
                }
                other => tail.push(other),
            }
        }

        assert_eq!(data.len(), 8);
        assert_eq!(tail, vec![StageEvent::End, StageEvent::Closed]);
    }

    #[tokio::test]
    async fn bounded_end_to_end() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handler = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            move |i: u32| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Error>(i)
                }
            }
        };

        let (stage, mut events) = Stage::new(2, handler).unwrap();

        let writer = tokio::spawn(async move {
            for i in 0..20 {
                stage.write(i).await.unwrap();
            }
            stage.end().await.unwrap();
        });

        let mut data = 0;
        while let Some(event) = events.next().await {
            if matches!(event, StageEvent::Data(_)) {
                data += 1;
            }
        }

        writer.await.unwrap();
        assert_eq!(data, 20);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn first_failure_closes_the_stage() {
        let handler = |i: u32| async move {
            if i == 1 {
                sleep(Duration::from_millis(5)).await;
                Err(Error::Handler("boom".to_string()))
            } else {
                sleep(Duration::from_millis(100)).await;
                Ok(i)
            }
        };

        let (stage, mut events) = Stage::new(2, handler).unwrap();
        let writer = tokio::spawn(async move {
            for i in 0..6 {
                if stage.write(i).await.is_err() {
                    return;
                }
            }
            let _ = stage.end().await;
        });

        let mut all = Vec::new();
        while let Some(event) = events.next().await {
            all.push(event);
        }
        writer.await.unwrap();

        let errors = all
            .iter()
            .filter(|e| matches!(e, StageEvent::Error(_)))
            .count();
        assert_eq!(errors, 1, "exactly one error event");
        assert!(!all.contains(&StageEvent::End), "no end after a failure");
        assert_eq!(all.last(), Some(&StageEvent::Closed));
        assert_eq!(
            all.iter()
                .filter(|e| matches!(e, StageEvent::Closed))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn close_cuts_off_running_and_queued_work() {
        let handler = |i: u32| async move {
            sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(i)
        };

        let (stage, mut events) = Stage::new(2, handler).unwrap();
        let stage = Arc::new(stage);

        let writer = {
            let stage = Arc::clone(&stage);
            tokio::spawn(async move {
                for i in 0..10 {
                    if stage.write(i).await.is_err() {
                        return;
                    }
                }
            })
        };

        // let a couple of jobs get going, then pull the plug
        sleep(Duration::from_millis(20)).await;
        stage.close();
        stage.close();

        let mut all = Vec::new();
        while let Some(event) = events.next().await {
            all.push(event);
        }
        assert_eq!(all, vec![StageEvent::Closed]);

        writer.await.unwrap();
        assert!(stage.write(99).await.is_err(), "closed stage refuses writes");
    }

    #[tokio::test]
    async fn end_with_carries_a_final_write() {
        let (stage, mut events) = Stage::new(2, doubler()).unwrap();

        for i in 0..4 {
            stage.write(i).await.unwrap();
        }
        stage.end_with(4).await.unwrap();

        let mut data = Vec::new();
        while let Some(event) = events.next().await {
            if let StageEvent::Data(v) = event {
                data.push(v);
            }
        }
        data.sort_unstable();
        assert_eq!(data, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn empty_stage_finalizes_immediately() {
        let (stage, mut events) = Stage::new(1, doubler()).unwrap();
        stage.end().await.unwrap();

        let mut all = Vec::new();
        while let Some(event) = events.next().await {
            all.push(event);
        }
        assert_eq!(all, vec![StageEvent::End, StageEvent::Closed]);
    }

    #[tokio::test]
    async fn dropping_the_stage_acts_as_end() {
        let (stage, mut events) = Stage::new(2, doubler()).unwrap();
        for i in 0..3 {
            stage.write(i).await.unwrap();
        }
        drop(stage);

        let mut data = 0;
        let mut all = Vec::new();
        while let Some(event) = events.next().await {
            if matches!(event, StageEvent::Data(_)) {
                data += 1;
            } else {
                all.push(event);
            }
        }
        assert_eq!(data, 3);
        assert_eq!(all, vec![StageEvent::End, StageEvent::Closed]);
    }

    #[tokio::test]
    async fn transform_stream_forwards_results() {
        let (input_tx, input_rx) = mpsc::channel(10);
        for i in 0..5u32 {
            input_tx.send(i).await.unwrap();
        }
        drop(input_tx);

        let (output_stream, handle) =
            Stage::transform_stream(ReceiverStream::new(input_rx), 4, doubler()).unwrap();

        let mut outputs: Vec<u32> = output_stream.collect().await;
        outputs.sort_unstable();
        assert_eq!(outputs, vec![0, 2, 4, 6, 8]);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn transform_stream_surfaces_the_first_failure() {
        let (input_tx, input_rx) = mpsc::channel(10);
        for i in 0..5u32 {
            input_tx.send(i).await.unwrap();
        }
        drop(input_tx);

        let handler = |i: u32| async move {
            if i == 2 {
                Err(Error::Handler("broken record".to_string()))
            } else {
                Ok(i)
            }
        };

        let (output_stream, handle) =
            Stage::transform_stream(ReceiverStream::new(input_rx), 1, handler).unwrap();

        let outputs: Vec<u32> = output_stream.collect().await;
        assert_eq!(outputs, vec![0, 1], "results before the failure survive");

        let result = handle.await.unwrap();
        assert_eq!(
            result,
            Err(Error::Handler("broken record".to_string()))
        );
    }

    #[tokio::test]
    async fn transform_stream_unwinds_when_the_consumer_goes_away() {
        let (input_tx, input_rx) = mpsc::channel(16);
        let feeder = tokio::spawn(async move {
            for i in 0..200u32 {
                if input_tx.send(i).await.is_err() {
                    return;
                }
            }
        });

        let handler = |i: u32| async move {
            sleep(Duration::from_millis(1)).await;
            Ok::<_, Error>(i)
        };

        let (mut output_stream, handle) =
            Stage::transform_stream(ReceiverStream::new(input_rx), 4, handler).unwrap();

        // take one result, then abandon the output stream mid-flight
        assert!(output_stream.next().await.is_some());
        drop(output_stream);

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("forwarding must wind down once the consumer is gone")
            .unwrap();
        assert!(result.is_ok());
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn writes_after_end_are_refused() {
        let handler = |i: u32| async move {
            sleep(Duration::from_millis(200)).await;
            Ok::<_, Error>(i)
        };
        let (stage, mut events) = Stage::new(2, handler).unwrap();

        stage.write(1).await.unwrap();
        stage.end().await.unwrap();

        // give the driver a moment to process the end while the job drains
        sleep(Duration::from_millis(50)).await;
        assert!(stage.write(2).await.is_err(), "post-end write must fail");
        assert!(stage.end().await.is_err());

        let mut all = Vec::new();
        while let Some(event) = events.next().await {
            all.push(event);
        }
        assert_eq!(
            all,
            vec![StageEvent::Data(1), StageEvent::End, StageEvent::Closed]
        );
    }
}
