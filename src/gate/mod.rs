//! The per-worker admission gate: subscribes to its service's rate channel,
//! paces event delivery through a retunable token bucket, and applies
//! backpressure at its ingress when the buffer fills.

mod forwarder;
mod limiter;

pub use forwarder::Forwarder;
pub use limiter::RateLimiter;

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::StreamExt;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use tokio::sync::mpsc;

use crate::event::Envelope;
use crate::internal_events::{
    EventBuffered, IngressRejected, RateUpdateParseFailed, RateUpdateReceived,
};
use crate::shutdown::ShutdownSignal;
use crate::store;

/// Parses a rate-channel payload. Admission rates are non-negative finite
/// decimals; anything else is discarded.
fn parse_rate(payload: &str) -> Option<f64> {
    match payload.trim().parse::<f64>() {
        Ok(rate) if rate.is_finite() && rate >= 0.0 => Some(rate),
        _ => None,
    }
}

/// Consumes the rate channel and retunes the limiter. Unparseable payloads
/// are discarded; the limiter keeps its last good rate.
pub async fn run_rate_subscription(
    client: redis::Client,
    service_name: String,
    limiter: Arc<RateLimiter>,
    shutdown: ShutdownSignal,
) {
    let channel = store::rate_channel(&service_name);
    let payloads = store::subscribe(client, channel, shutdown);
    futures::pin_mut!(payloads);

    while let Some(payload) = payloads.next().await {
        match parse_rate(&payload) {
            Some(rate) => {
                limiter.set_rate(rate);
                emit!(RateUpdateReceived { rate });
            }
            None => emit!(RateUpdateParseFailed { payload: &payload }),
        }
    }
}

/// The ingress side of the gate: accepts CloudEvents and pushes them into
/// the bounded buffer, blocking the producer when it is full.
pub struct Ingress {
    sender: mpsc::Sender<Envelope>,
    depth: Arc<AtomicUsize>,
    request_logging_enabled: bool,
}

impl Ingress {
    pub fn new(
        sender: mpsc::Sender<Envelope>,
        depth: Arc<AtomicUsize>,
        request_logging_enabled: bool,
    ) -> Self {
        Self {
            sender,
            depth,
            request_logging_enabled,
        }
    }

    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        match (request.method(), request.uri().path()) {
            (&Method::GET, "/healthz") => return status_response(StatusCode::NO_CONTENT),
            (&Method::POST, _) => {}
            _ => return status_response(StatusCode::METHOD_NOT_ALLOWED),
        }

        if self.request_logging_enabled {
            info!(
                message = "Inbound request.",
                method = %request.method(),
                uri = %request.uri(),
                headers = ?request.headers(),
            );
        }

        let (parts, body) = request.into_parts();
        let body = match hyper::body::to_bytes(body).await {
            Ok(body) => body,
            Err(_) => {
                emit!(IngressRejected {
                    reason: "body_read_failed",
                });
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        let envelope = match Envelope::from_parts(&parts.headers, body) {
            Ok(envelope) => envelope,
            Err(error) => {
                emit!(IngressRejected {
                    reason: "malformed_event",
                });
                return Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Body::from(error.to_string()))
                    .expect("building text response cannot fail");
            }
        };

        // Count the event before handing it over: a forwarder can dequeue it
        // the instant send returns, so incrementing afterwards would let the
        // counter underflow.
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;

        // Blocking here is the backpressure contract: the producer waits for
        // buffer space instead of the gate dropping events.
        match self.sender.send(envelope).await {
            Ok(()) => {
                emit!(EventBuffered { depth });
                status_response(StatusCode::ACCEPTED)
            }
            Err(_) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                status_response(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        address: SocketAddr,
        shutdown: ShutdownSignal,
    ) -> crate::Result<()> {
        let ingress = Arc::clone(&self);
        let service = make_service_fn(move |_| {
            let ingress = Arc::clone(&ingress);
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let ingress = Arc::clone(&ingress);
                    async move { Ok::<_, Infallible>(ingress.handle(request).await) }
                }))
            }
        });

        info!(message = "Gate ingress listening.", %address);

        Server::try_bind(&address)?
            .serve(service)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("building empty response cannot fail")
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::HeaderValue;

    use super::*;
    use crate::event::Data;

    fn event_request() -> Request<Body> {
        let mut request = Request::post("http://gate/")
            .body(Body::from(r#"{"imageData":"aGk="}"#))
            .unwrap();
        let headers = request.headers_mut();
        headers.insert("ce-id", HeaderValue::from_static("1"));
        headers.insert("ce-source", HeaderValue::from_static("/test"));
        headers.insert("ce-type", HeaderValue::from_static("test.event"));
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        request
    }

    #[tokio::test]
    async fn accepted_events_land_in_the_buffer() {
        let (tx, mut rx) = mpsc::channel(4);
        let ingress = Ingress::new(tx, Arc::new(AtomicUsize::new(0)), false);

        let response = ingress.handle(event_request()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.id, "1");
        assert_eq!(
            envelope.data,
            Data::Json(serde_json::json!({ "imageData": "aGk=" }))
        );
    }

    #[tokio::test]
    async fn malformed_events_are_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        let ingress = Ingress::new(tx, Arc::new(AtomicUsize::new(0)), false);

        let request = Request::post("http://gate/")
            .body(Body::from(Bytes::from_static(b"not an event")))
            .unwrap();
        let response = ingress.handle(request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_buffer_blocks_the_producer() {
        let (tx, mut rx) = mpsc::channel(1);
        let ingress = Arc::new(Ingress::new(tx, Arc::new(AtomicUsize::new(0)), false));

        let first = ingress.handle(event_request()).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        // The second submission must block until the buffer drains, not
        // complete and not drop the event.
        let blocked = {
            let ingress = Arc::clone(&ingress);
            tokio::spawn(async move { ingress.handle(event_request()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Draining one slot releases the blocked producer.
        rx.recv().await.unwrap();
        let response = blocked.await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn closed_buffer_maps_to_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let ingress = Ingress::new(tx, Arc::new(AtomicUsize::new(0)), false);

        let response = ingress.handle(event_request()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn rate_payload_parse_rules() {
        assert_eq!(parse_rate("17.5"), Some(17.5));
        assert_eq!(parse_rate("0"), Some(0.0));
        assert_eq!(parse_rate("  42 \n"), Some(42.0));
        assert_eq!(parse_rate("17.500000"), Some(17.5));
        assert_eq!(parse_rate("NaN"), None);
        assert_eq!(parse_rate("inf"), None);
        assert_eq!(parse_rate("-3"), None);
        assert_eq!(parse_rate("fast"), None);
        assert_eq!(parse_rate(""), None);
    }
}
