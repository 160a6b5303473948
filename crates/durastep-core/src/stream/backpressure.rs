//! High-water-mark flow control between a stream writer and its readers.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts written-but-unconsumed items for one stream.
///
/// Writers wait in [`wait_for_capacity`](Self::wait_for_capacity) while the
/// count is at or above the high-water mark; readers release them through
/// [`on_consume`](Self::on_consume).
#[derive(Debug)]
pub struct BackpressureController {
    buffered: AtomicUsize,
    high_water_mark: usize,
    capacity: Notify,
}

impl BackpressureController {
    /// A mark of zero is treated as one.
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            buffered: AtomicUsize::new(0),
            high_water_mark: high_water_mark.max(1),
            capacity: Notify::new(),
        }
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.buffered() >= self.high_water_mark
    }

    /// Account for one written item. Returns the new buffered count.
    pub fn on_write(&self) -> usize {
        self.buffered.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Account for `n` consumed items and wake paused writers.
    pub fn on_consume(&self, n: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(n)));
        self.capacity.notify_waiters();
    }

    /// Resolve once the buffer is below the high-water mark.
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_paused() {
                return;
            }
            tracing::trace!(buffered = self.buffered(), "stream writer paused");
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn consume_never_underflows() {
        let ctl = BackpressureController::new(2);
        ctl.on_write();
        ctl.on_consume(5);
        assert_eq!(ctl.buffered(), 0);
    }

    #[test]
    fn pauses_at_high_water_mark() {
        let ctl = BackpressureController::new(2);
        ctl.on_write();
        assert!(!ctl.is_paused());
        ctl.on_write();
        assert!(ctl.is_paused());
    }

    #[tokio::test]
    async fn waiting_writer_resumes_after_consume() {
        let ctl = Arc::new(BackpressureController::new(1));
        ctl.on_write();

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.wait_for_capacity().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        ctl.on_consume(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("writer should resume")
            .unwrap();
    }
}
