use std::time::Duration;

use metrics::{counter, gauge};

use super::prelude::{error_stage, error_type};
use super::InternalEvent;

#[derive(Debug)]
pub struct GateStarted<'a> {
    pub service: &'a str,
    pub workers: usize,
    pub capacity: usize,
}

impl InternalEvent for GateStarted<'_> {
    fn emit(self) {
        info!(
            message = "Admission gate started.",
            service = %self.service,
            workers = self.workers,
            capacity = self.capacity,
        );
        counter!("started_total", 1, "component" => "gate");
    }
}

#[derive(Debug)]
pub struct RateUpdateReceived {
    pub rate: f64,
}

impl InternalEvent for RateUpdateReceived {
    fn emit(self) {
        debug!(message = "Admission rate updated.", rate = %self.rate);
        counter!("rate_updates_total", 1);
        gauge!("admission_rate", self.rate);
    }
}

#[derive(Debug)]
pub struct RateUpdateParseFailed<'a> {
    pub payload: &'a str,
}

impl InternalEvent for RateUpdateParseFailed<'_> {
    fn emit(self) {
        warn!(
            message = "Discarding unparseable rate payload.",
            payload = %self.payload,
            error_type = error_type::PARSER_FAILED,
            stage = error_stage::RECEIVING,
        );
        counter!(
            "rate_update_errors_total", 1,
            "error_type" => error_type::PARSER_FAILED,
        );
    }
}

#[derive(Debug)]
pub struct SubscriptionFailed {
    pub error: crate::Error,
    pub retry_in: Duration,
}

impl InternalEvent for SubscriptionFailed {
    fn emit(self) {
        warn!(
            message = "Rate subscription lost; reconnecting.",
            error = %self.error,
            retry_in = ?self.retry_in,
            error_type = error_type::CONNECTION_FAILED,
            stage = error_stage::RECEIVING,
        );
        counter!(
            "subscription_errors_total", 1,
            "error_type" => error_type::CONNECTION_FAILED,
        );
    }
}

#[derive(Debug)]
pub struct EventBuffered {
    pub depth: usize,
}

impl InternalEvent for EventBuffered {
    fn emit(self) {
        trace!(message = "Event buffered for forwarding.", depth = self.depth);
        gauge!("gate_buffer_depth", self.depth as f64);
    }
}

#[derive(Debug)]
pub struct EventForwarded {
    pub depth: usize,
}

impl InternalEvent for EventForwarded {
    fn emit(self) {
        trace!(message = "Event forwarded.");
        counter!("forward_success_total", 1);
        gauge!("gate_buffer_depth", self.depth as f64);
    }
}

#[derive(Debug)]
pub struct ForwardRetried {
    pub attempt: usize,
    pub error: crate::http::HttpError,
}

impl InternalEvent for ForwardRetried {
    fn emit(self) {
        warn!(
            message = "Forward attempt failed; retrying.",
            attempt = self.attempt,
            error = %self.error,
            error_type = error_type::REQUEST_FAILED,
            stage = error_stage::SENDING,
        );
        counter!("forward_retry_total", 1);
    }
}

#[derive(Debug)]
pub struct ForwardFailed {
    pub attempts: usize,
    pub error: crate::http::HttpError,
}

impl InternalEvent for ForwardFailed {
    fn emit(self) {
        error!(
            message = "Dropping event after exhausting forward retries.",
            attempts = self.attempts,
            error = %self.error,
            error_type = error_type::REQUEST_FAILED,
            stage = error_stage::SENDING,
        );
        counter!("forward_failure_total", 1);
    }
}
