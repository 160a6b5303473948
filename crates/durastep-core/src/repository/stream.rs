//! Stream store port: append-only item logs addressed by `(workflow_id, namespace)`.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use durastep_types::error::RepositoryError;
use durastep_types::stream::{StreamItem, StreamMetadata};

/// Append/read/close of stream items.
///
/// Positions are assigned by the store, start at zero and are contiguous.
pub trait StreamStore: Send + Sync {
    /// Append one item and return its position.
    fn append(
        &self,
        workflow_id: &str,
        namespace: &str,
        payload: &Value,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Items at `from_position` and later, at most `limit`.
    fn read(
        &self,
        workflow_id: &str,
        namespace: &str,
        from_position: u64,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<StreamItem>, RepositoryError>> + Send;

    /// Terminal metadata, `None` while the stream is open.
    fn get_metadata(
        &self,
        workflow_id: &str,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<Option<StreamMetadata>, RepositoryError>> + Send;

    /// Mark the stream closed; `abort_reason` marks it aborted.
    fn close_stream(
        &self,
        workflow_id: &str,
        namespace: &str,
        abort_reason: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

#[derive(Debug, Default)]
struct StreamLog {
    items: Vec<StreamItem>,
    metadata: Option<StreamMetadata>,
}

/// Process-local [`StreamStore`].
#[derive(Debug, Default)]
pub struct InMemoryStreamStore {
    streams: DashMap<(String, String), StreamLog>,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(workflow_id: &str, namespace: &str) -> (String, String) {
        (workflow_id.to_string(), namespace.to_string())
    }
}

impl StreamStore for InMemoryStreamStore {
    async fn append(
        &self,
        workflow_id: &str,
        namespace: &str,
        payload: &Value,
    ) -> Result<u64, RepositoryError> {
        let mut log = self.streams.entry(Self::key(workflow_id, namespace)).or_default();
        if log.metadata.is_some() {
            return Err(RepositoryError::Conflict(format!(
                "stream {workflow_id}/{namespace} is closed"
            )));
        }
        let position = log.items.len() as u64;
        log.items.push(StreamItem {
            position,
            payload: payload.clone(),
            written_at: Utc::now(),
        });
        Ok(position)
    }

    async fn read(
        &self,
        workflow_id: &str,
        namespace: &str,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<StreamItem>, RepositoryError> {
        let Some(log) = self.streams.get(&Self::key(workflow_id, namespace)) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from(from_position).unwrap_or(usize::MAX).min(log.items.len());
        Ok(log.items[start..].iter().take(limit).cloned().collect())
    }

    async fn get_metadata(
        &self,
        workflow_id: &str,
        namespace: &str,
    ) -> Result<Option<StreamMetadata>, RepositoryError> {
        Ok(self
            .streams
            .get(&Self::key(workflow_id, namespace))
            .and_then(|log| log.metadata.clone()))
    }

    async fn close_stream(
        &self,
        workflow_id: &str,
        namespace: &str,
        abort_reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut log = self.streams.entry(Self::key(workflow_id, namespace)).or_default();
        if log.metadata.is_none() {
            log.metadata = Some(StreamMetadata {
                closed: true,
                abort_reason: abort_reason.map(str::to_string),
                closed_at: Some(Utc::now()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_assigns_contiguous_positions() {
        let store = InMemoryStreamStore::new();
        assert_eq!(store.append("wf", "log", &json!("a")).await.unwrap(), 0);
        assert_eq!(store.append("wf", "log", &json!("b")).await.unwrap(), 1);
        assert_eq!(store.append("wf", "other", &json!("x")).await.unwrap(), 0);

        let items = store.read("wf", "log", 1, 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload, json!("b"));
        assert!(store.read("wf", "log", 5, 10).await.unwrap().is_empty());
        assert!(store.read("wf", "missing", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_is_recorded_once_and_blocks_appends() {
        let store = InMemoryStreamStore::new();
        store.append("wf", "log", &json!(1)).await.unwrap();
        assert!(store.get_metadata("wf", "log").await.unwrap().is_none());

        store.close_stream("wf", "log", Some("bad input")).await.unwrap();
        store.close_stream("wf", "log", None).await.unwrap();
        let meta = store.get_metadata("wf", "log").await.unwrap().unwrap();
        assert!(meta.closed);
        assert_eq!(meta.abort_reason.as_deref(), Some("bad input"));
        assert!(store.append("wf", "log", &json!(2)).await.is_err());
    }
}
