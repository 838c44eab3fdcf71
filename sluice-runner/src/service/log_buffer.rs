//! Log buffer service
//!
//! Accumulates job output and hands it to a sink in chunks. A chunk is
//! flushed when the buffer reaches the size threshold or when no flush
//! happened for the inactivity timeout. Closing the buffer flushes whatever
//! remains; callers `close` and then `wait` before treating a log stream as
//! complete.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

/// Default flush threshold in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default inactivity timeout before a partial buffer is flushed
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Returned when writing to a log that was already closed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("log writer is closed")]
pub struct LogClosed;

/// Anything job output can be written to
pub trait LogWriter: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<(), LogClosed>;
}

impl<T: LogWriter + ?Sized> LogWriter for Arc<T> {
    fn write(&self, data: &[u8]) -> Result<(), LogClosed> {
        (**self).write(data)
    }
}

/// Destination of flushed chunks
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn flush(&self, chunk: Vec<u8>);
}

/// Size- and time-triggered log buffer
///
/// Flushing runs on a dedicated task fed through a channel, so writers never
/// wait on the sink.
pub struct Bufferer {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Bufferer {
    /// Creates a buffer and starts its flush task
    pub fn with_options(sink: Arc<dyn ChunkSink>, size: usize, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(flush_loop(rx, sink, size.max(1), timeout));

        Self {
            tx: Mutex::new(Some(tx)),
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Stops accepting writes; the flush task drains and exits
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Waits until the flush task has exited
    ///
    /// Only returns after `close`, once the final flush reached the sink.
    pub async fn wait(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl LogWriter for Bufferer {
    fn write(&self, data: &[u8]) -> Result<(), LogClosed> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(data.to_vec()).map_err(|_| LogClosed),
            None => Err(LogClosed),
        }
    }
}

async fn flush_loop(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    sink: Arc<dyn ChunkSink>,
    size: usize,
    timeout: Duration,
) {
    let mut buffer: Vec<u8> = Vec::with_capacity(size);
    let mut deadline = Instant::now() + timeout;

    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() >= size {
                        sink.flush(std::mem::take(&mut buffer)).await;
                        deadline = Instant::now() + timeout;
                    }
                }
                None => {
                    if !buffer.is_empty() {
                        sink.flush(std::mem::take(&mut buffer)).await;
                    }
                    break;
                }
            },
            _ = sleep_until(deadline) => {
                if !buffer.is_empty() {
                    sink.flush(std::mem::take(&mut buffer)).await;
                }
                deadline = Instant::now() + timeout;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Sink recording each flushed chunk with the instant it arrived
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub chunks: Mutex<Vec<(Instant, Vec<u8>)>>,
    }

    impl RecordingSink {
        pub fn data(&self) -> Vec<Vec<u8>> {
            self.chunks
                .lock()
                .unwrap()
                .iter()
                .map(|(_, d)| d.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn flush(&self, chunk: Vec<u8>) {
            self.chunks.lock().unwrap().push((Instant::now(), chunk));
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_flush_is_immediate() {
        let sink = Arc::new(RecordingSink::default());
        let start = Instant::now();
        let buffer = Bufferer::with_options(sink.clone(), 8, Duration::from_secs(2));

        buffer.write(b"0123").unwrap();
        buffer.write(b"4567").unwrap();
        settle().await;

        let chunks = sink.chunks.lock().unwrap().clone();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].1, b"01234567");
        assert_eq!(chunks[0].0, start, "flushed without waiting for the timer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_flush_resets_timer() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = Bufferer::with_options(sink.clone(), 4, Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        buffer.write(b"full").unwrap();
        settle().await;
        let flushed_at = sink.chunks.lock().unwrap()[0].0;

        buffer.write(b"ab").unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        // the original deadline (t=2s) has passed, but the reset one has not
        assert_eq!(sink.chunks.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let chunks = sink.chunks.lock().unwrap().clone();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].1, b"ab");
        let idle = chunks[1].0 - flushed_at;
        assert!(idle >= Duration::from_secs(2) && idle < Duration::from_millis(2010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_flush_happens_once() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = Bufferer::with_options(sink.clone(), 1024, Duration::from_secs(2));

        buffer.write(b"partial line\n").unwrap();
        settle().await;
        assert!(sink.data().is_empty());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(sink.data(), vec![b"partial line\n".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_remainder_before_wait_returns() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = Bufferer::with_options(sink.clone(), 1024, Duration::from_secs(60));

        buffer.write(b"tail").unwrap();
        buffer.close();
        buffer.wait().await;

        assert_eq!(sink.data(), vec![b"tail".to_vec()]);
        assert_eq!(buffer.write(b"late"), Err(LogClosed));
    }

    #[tokio::test]
    async fn test_close_without_data_flushes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let buffer =
            Bufferer::with_options(sink.clone(), DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_TIMEOUT);

        buffer.close();
        buffer.wait().await;
        buffer.wait().await;

        assert!(sink.data().is_empty());
    }
}
