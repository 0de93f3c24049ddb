//! `tokio` based runtime implementation.

use crate::runtime::Runtime;
use std::future::Future;
use std::time::Duration;
use tracing::Instrument;

/// Tokio-based runtime implementation.
///
/// Spawned futures inherit the caller's tracing span, so worker logs stay
/// attributed to the client that started them.
#[derive(Clone, Debug, Default)]
pub struct TokioRuntime;

impl Runtime for TokioRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.in_current_span());
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn test_spawn_and_sleep() {
        let runtime = TokioRuntime;
        let (tx, rx) = oneshot::channel();
        let start = tokio::time::Instant::now();

        let rt = runtime.clone();
        runtime.spawn(async move {
            rt.sleep(Duration::from_secs(10)).await;
            let _ = tx.send(());
        });

        rx.await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
