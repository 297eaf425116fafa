use metrics::counter;

use super::prelude::{error_stage, error_type};
use super::InternalEvent;

/// A best-effort store write failed. The in-memory state remains
/// authoritative, so the operation is logged and retried on the next tick.
#[derive(Debug)]
pub struct StoreWriteFailed<'a> {
    pub operation: &'a str,
    pub error: crate::store::StoreError,
}

impl InternalEvent for StoreWriteFailed<'_> {
    fn emit(self) {
        warn!(
            message = "State store write failed; continuing with in-memory state.",
            operation = %self.operation,
            error = %self.error,
            error_type = error_type::WRITER_FAILED,
            stage = error_stage::PROCESSING,
        );
        counter!(
            "store_errors_total", 1,
            "operation" => self.operation.to_owned(),
        );
    }
}

#[derive(Debug)]
pub struct StorePublishFailed<'a> {
    pub channel: &'a str,
    pub error: crate::store::StoreError,
}

impl InternalEvent for StorePublishFailed<'_> {
    fn emit(self) {
        warn!(
            message = "Publish failed; next tick republishes.",
            channel = %self.channel,
            error = %self.error,
            error_type = error_type::WRITER_FAILED,
            stage = error_stage::SENDING,
        );
        counter!("store_errors_total", 1, "operation" => "publish");
    }
}
