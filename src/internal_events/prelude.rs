//! Shared label values for error metrics.

pub mod error_type {
    pub const CONNECTION_FAILED: &str = "connection_failed";
    pub const PARSER_FAILED: &str = "parser_failed";
    pub const REQUEST_FAILED: &str = "request_failed";
    pub const WRITER_FAILED: &str = "writer_failed";
}

pub mod error_stage {
    pub const RECEIVING: &str = "receiving";
    pub const PROCESSING: &str = "processing";
    pub const SENDING: &str = "sending";
}
