//! Tracking for operations that outlived their step.
//!
//! When a timeout uses the disconnect policy, the step fails at its deadline
//! but the operation keeps running in the background. Its eventual outcome is
//! observed and logged here so it never becomes an unobserved panic.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// How a detached operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Panicked(String),
    Aborted,
}

/// Callback receiving `(label, settlement)` for every detached operation.
pub type SettlementSink = Arc<dyn Fn(&str, &Settlement) + Send + Sync>;

#[derive(Default)]
struct Inner {
    in_flight: AtomicUsize,
    idle: Notify,
    sink: Option<SettlementSink>,
}

/// Registry of background operations abandoned by their steps.
#[derive(Clone, Default)]
pub struct DetachedTasks {
    inner: Arc<Inner>,
}

impl DetachedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: SettlementSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: Some(sink),
                ..Inner::default()
            }),
        }
    }

    /// Take ownership of a still-running task and observe its outcome.
    pub fn adopt<T: Send + 'static>(&self, label: impl Into<String>, handle: JoinHandle<T>) {
        let label = label.into();
        let inner = self.inner.clone();
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let settlement = match handle.await {
                Ok(_) => Settlement::Completed,
                Err(e) if e.is_panic() => Settlement::Panicked(e.to_string()),
                Err(_) => Settlement::Aborted,
            };
            match &settlement {
                Settlement::Completed => tracing::debug!(
                    step = %label,
                    "detached operation settled after its step timed out"
                ),
                other => {
                    tracing::warn!(step = %label, outcome = ?other, "detached operation failed")
                }
            }
            if let Some(sink) = &inner.sink {
                sink(&label, &settlement);
            }
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every adopted operation has settled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for DetachedTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedTasks")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
