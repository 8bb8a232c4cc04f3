//! Periodic background work with a cooperative stop flag.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Runs `tick` immediately and then once per `interval` until stopped.
///
/// Stopping only raises a flag: the loop notices it at its next wake, so
/// [`PeriodicTask::stop`] never waits on the task. A tick can also end the
/// loop itself by returning [`ControlFlow::Break`].
pub struct PeriodicTask {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = tokio::spawn(async move {
            while flag.load(Ordering::Acquire) {
                if tick().await.is_break() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
            flag.store(false, Ordering::Release);
        });

        Self { running, handle }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.handle.is_finished()
    }

    /// Waits for the loop to exit. Call [`PeriodicTask::stop`] first.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}
