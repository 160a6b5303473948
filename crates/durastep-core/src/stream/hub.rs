//! Entry point for durable streams: hands out writers and readers that
//! share one backpressure controller per `(workflow_id, namespace)`.

use std::sync::Arc;

use dashmap::DashMap;

use durastep_types::config::StreamConfig;

use crate::repository::stream::StreamStore;

use super::backpressure::BackpressureController;
use super::reader::StreamReader;
use super::writer::StreamWriter;

pub(crate) type StreamId = (String, String);

/// Live writer count per stream, shared between the hub, writers and readers.
pub(crate) type LiveWriters = Arc<DashMap<StreamId, usize>>;

pub struct StreamHub<S: StreamStore> {
    store: Arc<S>,
    config: StreamConfig,
    controllers: DashMap<StreamId, Arc<BackpressureController>>,
    live_writers: LiveWriters,
}

impl<S: StreamStore> StreamHub<S> {
    pub fn new(store: Arc<S>, config: StreamConfig) -> Self {
        Self {
            store,
            config,
            controllers: DashMap::new(),
            live_writers: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// The shared controller for a stream, created on first use.
    pub fn controller(&self, workflow_id: &str, namespace: &str) -> Arc<BackpressureController> {
        self.controllers
            .entry((workflow_id.to_string(), namespace.to_string()))
            .or_insert_with(|| Arc::new(BackpressureController::new(self.config.high_water_mark)))
            .clone()
    }

    pub fn writer(&self, workflow_id: &str, namespace: &str) -> StreamWriter<S> {
        let id = (workflow_id.to_string(), namespace.to_string());
        *self.live_writers.entry(id.clone()).or_insert(0) += 1;
        tracing::debug!(workflow_id, namespace, "stream writer opened");
        StreamWriter::new(
            self.store.clone(),
            id,
            self.controller(workflow_id, namespace),
            self.live_writers.clone(),
        )
    }

    /// Reader starting at the first item.
    pub fn reader(&self, workflow_id: &str, namespace: &str) -> StreamReader<S> {
        self.reader_from(workflow_id, namespace, 0)
    }

    /// Reader starting at `position`, e.g. after a reconnect.
    pub fn reader_from(
        &self,
        workflow_id: &str,
        namespace: &str,
        position: u64,
    ) -> StreamReader<S> {
        StreamReader::new(
            self.store.clone(),
            (workflow_id.to_string(), namespace.to_string()),
            self.controller(workflow_id, namespace),
            self.live_writers.clone(),
            &self.config,
            position,
        )
    }

    /// Whether a writer handle for the stream is still alive.
    pub fn has_live_writer(&self, workflow_id: &str, namespace: &str) -> bool {
        self.live_writers
            .get(&(workflow_id.to_string(), namespace.to_string()))
            .is_some_and(|n| *n > 0)
    }
}
