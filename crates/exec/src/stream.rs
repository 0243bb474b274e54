//! Batch stream abstractions and channel adapters.
//!
//! A [`BatchStream`] is the pull side of an async batch generator: the stream
//! ends at the terminator, and an `Err` item is fatal. Streams are fused by
//! construction, so termination is monotonic.

use brook_common::{BrookError, Result};
use brook_compute::ExecBatch;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};

/// The standard "stream of batches you can hand to a source node".
pub type BatchStream = BoxStream<'static, Result<ExecBatch>>;

/// Eager stream over already materialized batches.
pub fn vector_stream(batches: Vec<ExecBatch>) -> BatchStream {
    futures::stream::iter(batches.into_iter().map(Ok)).boxed()
}

/// Offload a blocking iterator onto the blocking pool.
///
/// Backpressure: when the consumer is slow and the buffer fills up, the
/// producer blocks until there is capacity again.
pub fn background_stream<I>(iter: I, capacity: usize) -> BatchStream
where
    I: Iterator<Item = Result<ExecBatch>> + Send + 'static,
{
    futures::stream::once(async move {
        let (mut tx, rx) = mpsc::channel::<Result<ExecBatch>>(capacity);
        tokio::task::spawn_blocking(move || {
            for item in iter {
                if futures::executor::block_on(tx.send(item)).is_err() {
                    break;
                }
            }
        });
        rx
    })
    .flatten()
    .boxed()
}

/// Hop a stream's items through a spawned task.
///
/// Keeps consumer callbacks off the producing thread, so a slow consumer
/// cannot starve whatever drives the inner stream.
pub fn transferred_stream(mut inner: BatchStream, capacity: usize) -> BatchStream {
    futures::stream::once(async move {
        let (mut tx, rx) = mpsc::channel::<Result<ExecBatch>>(capacity);
        tokio::spawn(async move {
            while let Some(item) = inner.next().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        rx
    })
    .flatten()
    .boxed()
}

/// Create a bounded channel whose receive side is a [`BatchStream`].
pub fn batch_channel(capacity: usize) -> (BatchSender, BatchStream) {
    let (tx, rx) = mpsc::channel::<Result<ExecBatch>>(capacity);
    (BatchSender { tx }, rx.boxed())
}

/// Sender side for [`batch_channel`].
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Result<ExecBatch>>,
}

impl BatchSender {
    /// Send a batch (awaits if the channel buffer is full).
    pub async fn send_batch(&mut self, batch: ExecBatch) -> Result<()> {
        self.tx
            .send(Ok(batch))
            .await
            .map_err(|e| BrookError::Execution(format!("batch channel closed: {e}")))
    }

    /// Send an error and terminate downstream consumption.
    pub async fn send_error(&mut self, err: BrookError) -> Result<()> {
        self.tx
            .send(Err(err))
            .await
            .map_err(|e| BrookError::Execution(format!("batch channel closed: {e}")))
    }
}
