//! Append side of a durable stream.

use std::sync::Arc;

use serde::Serialize;

use durastep_types::error::{RepositoryError, StreamError};

use crate::repository::stream::StreamStore;

use super::backpressure::BackpressureController;
use super::hub::{LiveWriters, StreamId};

/// Writes items to one stream. Waits while readers lag behind by the
/// high-water mark. Dropping a writer without closing it leaves the stream
/// open; readers treat it as abandoned once they drain it.
pub struct StreamWriter<S: StreamStore> {
    store: Arc<S>,
    id: StreamId,
    controller: Arc<BackpressureController>,
    live: LiveWriters,
    closed: bool,
}

impl<S: StreamStore> StreamWriter<S> {
    pub(crate) fn new(
        store: Arc<S>,
        id: StreamId,
        controller: Arc<BackpressureController>,
        live: LiveWriters,
    ) -> Self {
        Self {
            store,
            id,
            controller,
            live,
            closed: false,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.id.1
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append one item and return its position.
    pub async fn write<T: Serialize + ?Sized>(&mut self, item: &T) -> Result<u64, StreamError> {
        if self.closed {
            return Err(StreamError::Closed {
                namespace: self.id.1.clone(),
            });
        }
        let payload =
            serde_json::to_value(item).map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        self.controller.wait_for_capacity().await;
        let position = self.store.append(&self.id.0, &self.id.1, &payload).await?;
        self.controller.on_write();
        Ok(position)
    }

    /// Close the stream cleanly. Readers end after the last item.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        self.finish(None).await
    }

    /// Close the stream as failed. Readers get `StreamError::Aborted`.
    pub async fn abort(&mut self, reason: impl Into<String>) -> Result<(), StreamError> {
        let reason = reason.into();
        self.finish(Some(&reason)).await
    }

    async fn finish(&mut self, abort_reason: Option<&str>) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::AlreadyClosed {
                namespace: self.id.1.clone(),
            });
        }
        self.closed = true;
        self.store.close_stream(&self.id.0, &self.id.1, abort_reason).await?;
        tracing::debug!(
            workflow_id = %self.id.0,
            namespace = %self.id.1,
            aborted = abort_reason.is_some(),
            "stream closed"
        );
        Ok(())
    }
}

impl<S: StreamStore> Drop for StreamWriter<S> {
    fn drop(&mut self) {
        let gone = match self.live.get_mut(&self.id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if gone {
            self.live.remove_if(&self.id, |_, count| *count == 0);
        }
        if !self.closed {
            tracing::debug!(
                workflow_id = %self.id.0,
                namespace = %self.id.1,
                "stream writer dropped without closing"
            );
        }
    }
}
