use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::QueueStats;
use crate::internal_events::{QueueBecameEmpty, QueueDepthObserved, QueuePollFailed};
use crate::shutdown::ShutdownSignal;

/// Rising-edge signal that the workload queue drained to zero. Carries only
/// the observation time (Unix seconds).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmptyQueueEvent {
    pub at: f64,
}

/// Polls the broker for the workload queue's message count and fires exactly
/// one [`EmptyQueueEvent`] per maximal run of zero-count samples.
pub struct QueueObserver<S> {
    broker: S,
    queue: String,
    events: mpsc::Sender<EmptyQueueEvent>,
    prev_queue_empty: bool,
}

impl<S: QueueStats> QueueObserver<S> {
    pub fn new(broker: S, queue: String, events: mpsc::Sender<EmptyQueueEvent>) -> Self {
        Self {
            broker,
            queue,
            events,
            prev_queue_empty: false,
        }
    }

    /// One poll of the broker. Poll failures leave the edge state untouched,
    /// so an intermittent error can never fabricate an empty-queue event.
    async fn poll_once(&mut self, now: f64) {
        match self.broker.message_count(&self.queue).await {
            Ok(messages) => {
                emit!(QueueDepthObserved {
                    queue: &self.queue,
                    messages,
                });
                if messages == 0 {
                    if !self.prev_queue_empty {
                        self.prev_queue_empty = true;
                        emit!(QueueBecameEmpty { queue: &self.queue });
                        if self.events.send(EmptyQueueEvent { at: now }).await.is_err() {
                            debug!("Controller is gone; dropping empty-queue event.");
                        }
                    }
                } else {
                    self.prev_queue_empty = false;
                }
            }
            Err(error) => emit!(QueuePollFailed { error }),
        }
    }

    pub async fn run(mut self, interval: Duration, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(crate::controller::unix_now()).await;
                }
                _ = &mut shutdown => {
                    debug!("Queue observer stopping.");
                    return;
                }
            }
        }
    }
}
