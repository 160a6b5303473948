//! Read side of a durable stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::Stream;
use serde::de::DeserializeOwned;

use durastep_types::config::StreamConfig;
use durastep_types::error::{RepositoryError, StreamError};
use durastep_types::stream::StreamItem;

use crate::repository::stream::StreamStore;

use super::backpressure::BackpressureController;
use super::hub::{LiveWriters, StreamId};

/// Polls a stream store for items in position order.
///
/// The stream ends when it is closed and drained, or when the writer that
/// was feeding it went away without closing. An aborted stream ends with
/// [`StreamError::Aborted`]. While the stream is open and empty the reader
/// polls until `read_timeout_ms` passes without new items.
pub struct StreamReader<S: StreamStore> {
    store: Arc<S>,
    id: StreamId,
    controller: Arc<BackpressureController>,
    live: LiveWriters,
    poll_interval: Duration,
    read_timeout: Duration,
    batch_size: usize,
    position: u64,
    buffer: VecDeque<StreamItem>,
    seen_writer: bool,
    done: bool,
}

impl<S: StreamStore> StreamReader<S> {
    pub(crate) fn new(
        store: Arc<S>,
        id: StreamId,
        controller: Arc<BackpressureController>,
        live: LiveWriters,
        config: &StreamConfig,
        position: u64,
    ) -> Self {
        Self {
            store,
            id,
            controller,
            live,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            batch_size: config.read_batch_size.max(1),
            position,
            buffer: VecDeque::new(),
            seen_writer: false,
            done: false,
        }
    }

    /// Position of the next item to fetch from the store.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn writer_live(&self) -> bool {
        self.live.get(&self.id).is_some_and(|n| *n > 0)
    }

    async fn fetch(&mut self) -> Result<bool, StreamError> {
        let batch = self
            .store
            .read(&self.id.0, &self.id.1, self.position, self.batch_size)
            .await?;
        let Some(last) = batch.last() else {
            return Ok(false);
        };
        self.position = last.position + 1;
        self.buffer.extend(batch);
        Ok(true)
    }

    /// Next item, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Result<Option<StreamItem>, StreamError> {
        let mut idle_since = Instant::now();
        loop {
            if let Some(item) = self.buffer.pop_front() {
                self.controller.on_consume(1);
                return Ok(Some(item));
            }
            if self.done {
                return Ok(None);
            }

            // Liveness is sampled before reading so items written just
            // before the writer went away are still delivered.
            let writer_live = self.writer_live();
            self.seen_writer |= writer_live;

            if self.fetch().await? {
                idle_since = Instant::now();
                continue;
            }

            if let Some(meta) = self.store.get_metadata(&self.id.0, &self.id.1).await? {
                if self.fetch().await? {
                    continue;
                }
                self.done = true;
                return match meta.abort_reason {
                    Some(reason) => Err(StreamError::Aborted {
                        namespace: self.id.1.clone(),
                        reason,
                    }),
                    None => Ok(None),
                };
            }

            if self.seen_writer && !writer_live {
                tracing::warn!(
                    workflow_id = %self.id.0,
                    namespace = %self.id.1,
                    position = self.position,
                    "stream writer went away without closing; ending stream"
                );
                self.done = true;
                return Ok(None);
            }

            if idle_since.elapsed() >= self.read_timeout {
                let ms = u64::try_from(self.read_timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(StreamError::ReadTimeout(ms));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Next item decoded as `T`.
    pub async fn next_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>, StreamError> {
        let Some(item) = self.next().await? else {
            return Ok(None);
        };
        let value = serde_json::from_value(item.payload)
            .map_err(|e| {
                RepositoryError::Serialization(format!("stream item {}: {e}", item.position))
            })?;
        Ok(Some(value))
    }

    /// Adapt the reader into a `Stream` of items.
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamItem, StreamError>> {
        let mut reader = self;
        async_stream::try_stream! {
            while let Some(item) = reader.next().await? {
                yield item;
            }
        }
    }
}
