use metrics::counter;

use super::prelude::{error_stage, error_type};
use super::InternalEvent;

#[derive(Debug)]
pub struct EventRouted<'a> {
    pub service: &'a str,
}

impl InternalEvent for EventRouted<'_> {
    fn emit(self) {
        trace!(message = "Event routed.", service = %self.service);
        counter!("events_routed_total", 1, "service" => self.service.to_owned());
    }
}

/// No destination could be selected because every routing weight was zero.
#[derive(Debug)]
pub struct NoDestinationAvailable;

impl InternalEvent for NoDestinationAvailable {
    fn emit(self) {
        warn!(message = "Routing failed: total routing weight is zero.");
        counter!("routing_failures_total", 1, "reason" => "zero_weight");
    }
}

#[derive(Debug)]
pub struct RouteForwardFailed<'a> {
    pub service: &'a str,
    pub error: crate::http::HttpError,
}

impl InternalEvent for RouteForwardFailed<'_> {
    fn emit(self) {
        error!(
            message = "Failed to forward routed event.",
            service = %self.service,
            error = %self.error,
            error_type = error_type::REQUEST_FAILED,
            stage = error_stage::SENDING,
        );
        counter!("routing_failures_total", 1, "reason" => "forward_error");
    }
}

#[derive(Debug)]
pub struct IngressRejected<'a> {
    pub reason: &'a str,
}

impl InternalEvent for IngressRejected<'_> {
    fn emit(self) {
        debug!(message = "Ingress request rejected.", reason = %self.reason);
        counter!(
            "ingress_rejected_total", 1,
            "error_type" => error_type::PARSER_FAILED,
        );
    }
}
