//! Cooperative cancellation for a workflow run.
//!
//! [`CancelSignal`] wraps a `CancellationToken` with the reason the run was
//! cancelled. The executor checks it before every step and races it inside
//! sleeps, backoff delays and timeout races. Plain step operations are not
//! interrupted; they may observe the signal themselves via [`CancelSignal::cancelled`].

use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared, cloneable cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<Option<String>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. a child of a server-wide shutdown token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Fire the signal. The first reason recorded wins.
    pub fn cancel(&self, reason: Option<String>) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned().flatten()
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run `listener` once when the signal fires.
    ///
    /// The returned guard unregisters the listener when dropped.
    pub fn on_cancel<F>(&self, listener: F) -> CancelListener
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        let signal = self.clone();
        let handle = tokio::spawn(async move {
            signal.cancelled().await;
            listener(signal.reason());
        });
        CancelListener { handle }
    }
}

/// Registration guard returned by [`CancelSignal::on_cancel`].
#[derive(Debug)]
pub struct CancelListener {
    handle: JoinHandle<()>,
}

impl CancelListener {
    pub fn remove(self) {}
}

impl Drop for CancelListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn first_reason_wins() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel(Some("deploy".to_string()));
        signal.cancel(Some("second".to_string()));
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), Some("deploy".to_string()));
    }

    #[test]
    fn clones_share_state() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        clone.cancel(None);
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), None);
    }

    #[tokio::test]
    async fn listener_runs_on_cancel() {
        let signal = CancelSignal::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _guard = signal.on_cancel(move |reason| {
            let _ = tx.send(reason);
        });
        signal.cancel(Some("stop".to_string()));
        let reason = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, Some("stop".to_string()));
    }

    #[tokio::test]
    async fn removed_listener_never_runs() {
        let signal = CancelSignal::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let guard = signal.on_cancel(move |_| flag.store(true, Ordering::SeqCst));
        guard.remove();
        signal.cancel(None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
