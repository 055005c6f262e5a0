//! Cancellable background tasks.
//!
//! Every polling loop in the engine (inbox drain, connection refresh,
//! typing auto-clear) runs inside a [`TaskHandle`]: a spawned future
//! holding a watch-channel shutdown receiver it selects against its
//! timer. Cancellation is prompt and loops never outlive logout. Under
//! `tokio::time::pause` the timers run on virtual time, so tests
//! advance the clock instead of sleeping.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a cancellable background task.
pub struct TaskHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn a task built from a shutdown receiver.
    ///
    /// The future is expected to exit promptly once the receiver
    /// observes `true`.
    pub fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(make(rx));
        Self { shutdown, join }
    }

    /// Signal the task to stop.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Wait one poll interval or until shutdown.
///
/// Returns `false` when the loop should exit.
pub async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = shutdown.changed() => !*shutdown.borrow(),
    }
}
