use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{future, FutureExt};
use stream_cancel::{Trigger, Tripwire};
use tokio::time::{timeout_at, Instant};

/// When this struct goes out of scope, its `Trigger` fires the matching
/// completion tripwire held by the [`ShutdownCoordinator`].
#[derive(Debug)]
pub struct ShutdownCompleteToken {
    _trigger: Trigger,
}

/// Passed to each long-lived task to coordinate the shutdown process.
///
/// Resolves once global shutdown has begun. The task signals that its own
/// shutdown is complete by dropping all clones of this signal, which releases
/// the completion token.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    begin_shutdown: Tripwire,
    shutdown_complete: Option<Arc<ShutdownCompleteToken>>,
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.begin_shutdown.poll_unpin(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl ShutdownSignal {
    fn new(begin_shutdown: Tripwire, complete_trigger: Trigger) -> Self {
        Self {
            begin_shutdown,
            shutdown_complete: Some(Arc::new(ShutdownCompleteToken {
                _trigger: complete_trigger,
            })),
        }
    }

    /// A signal that never fires. For tests and detached tasks.
    pub fn noop() -> Self {
        let (trigger, tripwire) = Tripwire::new();
        trigger.disable();
        Self {
            begin_shutdown: tripwire,
            shutdown_complete: None,
        }
    }
}

/// Tracks one completion tripwire per registered task and triggers the shared
/// begin-shutdown tripwire when asked to shut everything down.
pub struct ShutdownCoordinator {
    begin_trigger: Trigger,
    begin_tripwire: Tripwire,
    complete_tripwires: Vec<(&'static str, Tripwire)>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        let (begin_trigger, begin_tripwire) = Tripwire::new();
        Self {
            begin_trigger,
            begin_tripwire,
            complete_tripwires: Vec::new(),
        }
    }
}

impl ShutdownCoordinator {
    pub fn register(&mut self, name: &'static str) -> ShutdownSignal {
        let (complete_trigger, complete_tripwire) = Tripwire::new();
        self.complete_tripwires.push((name, complete_tripwire));
        ShutdownSignal::new(self.begin_tripwire.clone(), complete_trigger)
    }

    /// Signals all registered tasks to begin shutting down and waits for each
    /// to complete, up to `deadline`. Tasks still running at the deadline are
    /// logged and abandoned.
    pub async fn shutdown_all(self, deadline: Instant) {
        self.begin_trigger.cancel();

        let waits = self
            .complete_tripwires
            .into_iter()
            .map(|(name, tripwire)| async move {
                if timeout_at(deadline, tripwire).await.is_err() {
                    error!(
                        message = "Task failed to shut down before deadline.",
                        task = name,
                    );
                }
            });

        future::join_all(waits).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn signal_fires_after_shutdown_all() {
        let mut coordinator = ShutdownCoordinator::default();
        let signal = coordinator.register("test");

        let task = tokio::spawn(async move {
            signal.await;
        });

        coordinator
            .shutdown_all(Instant::now() + Duration::from_secs(1))
            .await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_times_out_on_stuck_task() {
        let mut coordinator = ShutdownCoordinator::default();
        let signal = coordinator.register("stuck");

        // A task that never observes the signal and never drops it.
        let held = tokio::spawn(async move {
            let _signal = signal;
            futures::future::pending::<()>().await;
        });

        coordinator
            .shutdown_all(Instant::now() + Duration::from_millis(100))
            .await;
        held.abort();
    }

    #[tokio::test]
    async fn noop_signal_stays_pending() {
        let mut signal = ShutdownSignal::noop();
        assert!(futures::poll!(&mut signal).is_pending());
    }
}
