//! Durable streams between workflow steps and their consumers.
//!
//! - `hub` -- hands out writers/readers for `(workflow_id, namespace)`
//! - `writer` -- appends items, waits on backpressure, closes or aborts
//! - `reader` -- polls items in order, detects close, abort and abandonment
//! - `backpressure` -- high-water-mark controller shared by both sides

pub mod backpressure;
pub mod hub;
pub mod reader;
pub mod writer;

pub use backpressure::BackpressureController;
pub use hub::StreamHub;
pub use reader::StreamReader;
pub use writer::StreamWriter;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::StreamExt;
    use serde_json::json;

    use durastep_types::config::StreamConfig;
    use durastep_types::error::StreamError;

    use super::*;
    use crate::repository::stream::InMemoryStreamStore;

    fn hub(high_water_mark: usize) -> StreamHub<InMemoryStreamStore> {
        StreamHub::new(
            Arc::new(InMemoryStreamStore::new()),
            StreamConfig {
                high_water_mark,
                poll_interval_ms: 5,
                read_timeout_ms: 500,
                read_batch_size: 8,
            },
        )
    }

    #[tokio::test]
    async fn reader_sees_items_in_order_then_end() {
        let hub = hub(16);
        let mut writer = hub.writer("wf", "tokens");
        for word in ["a", "b", "c"] {
            writer.write(word).await.unwrap();
        }
        writer.close().await.unwrap();

        let items: Vec<String> = hub
            .reader("wf", "tokens")
            .into_stream()
            .map(|item| item.unwrap().payload.as_str().unwrap().to_string())
            .collect()
            .await;
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn second_close_is_an_error() {
        let hub = hub(16);
        let mut writer = hub.writer("wf", "log");
        writer.close().await.unwrap();
        assert!(matches!(writer.close().await, Err(StreamError::AlreadyClosed { .. })));
        assert!(matches!(writer.write(&json!(1)).await, Err(StreamError::Closed { .. })));
    }

    #[tokio::test]
    async fn writer_pauses_until_reader_consumes() {
        let hub = hub(2);
        let mut writer = hub.writer("wf", "bp");
        writer.write(&1).await.unwrap();
        writer.write(&2).await.unwrap();
        assert!(hub.controller("wf", "bp").is_paused());

        let blocked = tokio::spawn(async move {
            writer.write(&3).await.unwrap();
            writer.close().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        let mut reader = hub.reader("wf", "bp");
        assert_eq!(reader.next_as::<i32>().await.unwrap(), Some(1));
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("writer should resume")
            .unwrap();
        assert_eq!(reader.next_as::<i32>().await.unwrap(), Some(2));
        assert_eq!(reader.next_as::<i32>().await.unwrap(), Some(3));
        assert_eq!(reader.next_as::<i32>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn aborted_stream_surfaces_reason_after_items() {
        let hub = hub(16);
        let mut writer = hub.writer("wf", "job");
        writer.write("partial").await.unwrap();
        writer.abort("upstream failed").await.unwrap();

        let mut reader = hub.reader("wf", "job");
        assert!(reader.next().await.unwrap().is_some());
        match reader.next().await {
            Err(StreamError::Aborted { reason, .. }) => assert_eq!(reason, "upstream failed"),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abandoned_stream_ends_when_writer_drops() {
        let hub = hub(16);
        let mut writer = hub.writer("wf", "orphan");
        writer.write(&"only").await.unwrap();

        let mut reader = hub.reader("wf", "orphan");
        assert!(reader.next().await.unwrap().is_some());

        let pending = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(writer);

        let ended = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("reader should end")
            .unwrap()
            .unwrap();
        assert!(ended.is_none());
        assert!(!hub.has_live_writer("wf", "orphan"));
    }

    #[tokio::test]
    async fn open_empty_stream_times_out() {
        let hub = hub(16);
        let mut reader = hub.reader("wf", "silent");
        assert!(matches!(reader.next().await, Err(StreamError::ReadTimeout(500))));
    }
}
