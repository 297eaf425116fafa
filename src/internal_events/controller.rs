use metrics::{counter, gauge};

use super::InternalEvent;

#[derive(Debug)]
pub struct ControllerStarted {
    pub services: usize,
}

impl InternalEvent for ControllerStarted {
    fn emit(self) {
        info!(message = "Controller started.", services = self.services);
        counter!("started_total", 1, "component" => "controller");
    }
}

/// One service's rates after a periodic tick. Feeds the per-service gauges
/// scraped at `/metrics`.
#[derive(Debug)]
pub struct AdmissionRateComputed<'a> {
    pub service: &'a str,
    pub raw: f64,
    pub weight: f64,
    pub baseline: f64,
}

impl InternalEvent for AdmissionRateComputed<'_> {
    fn emit(self) {
        trace!(
            message = "Admission rate computed.",
            service = %self.service,
            raw = %self.raw,
            weight = %self.weight,
        );
        gauge!("admission_rate", self.raw, "service" => self.service.to_owned());
        gauge!("routing_weight", self.weight, "service" => self.service.to_owned());
        gauge!("emptyq_weight", self.baseline, "service" => self.service.to_owned());
    }
}

#[derive(Debug)]
pub struct BaselineSnapshotted {
    pub tk: i64,
}

impl InternalEvent for BaselineSnapshotted {
    fn emit(self) {
        debug!(message = "Empty-queue baseline snapshotted.", tk = self.tk);
        counter!("queue_empty_events_total", 1);
    }
}

#[derive(Debug)]
pub struct AdmissionRatePublished<'a> {
    pub service: &'a str,
    pub rate: f64,
}

impl InternalEvent for AdmissionRatePublished<'_> {
    fn emit(self) {
        trace!(
            message = "Admission rate published.",
            service = %self.service,
            rate = %self.rate,
        );
        counter!("admission_rate_publishes_total", 1);
    }
}
