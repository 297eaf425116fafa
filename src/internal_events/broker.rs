use metrics::{counter, gauge};

use super::prelude::{error_stage, error_type};
use super::InternalEvent;

#[derive(Debug)]
pub struct QueueDepthObserved<'a> {
    pub queue: &'a str,
    pub messages: u32,
}

impl InternalEvent for QueueDepthObserved<'_> {
    fn emit(self) {
        trace!(
            message = "Queue depth observed.",
            queue = %self.queue,
            messages = self.messages,
        );
        gauge!("broker_queue_messages", self.messages as f64);
    }
}

#[derive(Debug)]
pub struct QueuePollFailed {
    pub error: crate::broker::BrokerError,
}

impl InternalEvent for QueuePollFailed {
    fn emit(self) {
        warn!(
            message = "Failed to poll broker queue; edge state untouched.",
            error = %self.error,
            error_type = error_type::REQUEST_FAILED,
            stage = error_stage::RECEIVING,
        );
        counter!(
            "broker_poll_errors_total", 1,
            "error_type" => error_type::REQUEST_FAILED,
        );
    }
}

#[derive(Debug)]
pub struct QueueBecameEmpty<'a> {
    pub queue: &'a str,
}

impl InternalEvent for QueueBecameEmpty<'_> {
    fn emit(self) {
        debug!(message = "Queue transitioned to empty.", queue = %self.queue);
    }
}
