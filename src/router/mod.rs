//! The event router: accepts CloudEvents at the control-plane ingress,
//! selects a destination worker in proportion to the routing weights, and
//! forwards the event to that worker's front-end.

mod algorithm;

pub use algorithm::RouterAlgorithm;

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use http::Uri;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};

use crate::controller::Controller;
use crate::event::Envelope;
use crate::http::HttpClient;
use crate::internal_events::{
    EventRouted, IngressRejected, NoDestinationAvailable, RouteForwardFailed,
};
use crate::shutdown::ShutdownSignal;

pub struct Router {
    controller: Arc<Controller>,
    algorithm: RouterAlgorithm,
    client: HttpClient,
    target_suffix: String,
    forward_timeout: Duration,
}

impl Router {
    pub fn new(
        controller: Arc<Controller>,
        algorithm: RouterAlgorithm,
        target_suffix: String,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            algorithm,
            client: HttpClient::new(),
            target_suffix,
            forward_timeout,
        }
    }

    fn select_destination(&self) -> Option<String> {
        let table = self.controller.weights();
        self.algorithm.select(&table, &mut rand::thread_rng())
    }

    fn target_uri(&self, service: &str) -> Option<Uri> {
        format!("http://{}{}/", service, self.target_suffix)
            .parse()
            .ok()
    }

    /// Handles one ingress request end to end: parse, select, forward. The
    /// forward outcome is reflected back to the caller.
    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        match (request.method(), request.uri().path()) {
            (&Method::GET, "/healthz") => return empty_response(StatusCode::NO_CONTENT),
            (&Method::POST, _) => {}
            _ => return empty_response(StatusCode::METHOD_NOT_ALLOWED),
        }

        let (parts, body) = request.into_parts();
        let body = match hyper::body::to_bytes(body).await {
            Ok(body) => body,
            Err(_) => {
                emit!(IngressRejected {
                    reason: "body_read_failed",
                });
                return empty_response(StatusCode::BAD_REQUEST);
            }
        };

        let envelope = match Envelope::from_parts(&parts.headers, body) {
            Ok(envelope) => envelope,
            Err(error) => {
                emit!(IngressRejected {
                    reason: "malformed_event",
                });
                return text_response(StatusCode::BAD_REQUEST, error.to_string());
            }
        };

        self.route(envelope).await
    }

    async fn route(&self, envelope: Envelope) -> Response<Body> {
        let Some(destination) = self.select_destination() else {
            emit!(NoDestinationAvailable);
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "no destination available".to_owned(),
            );
        };

        let Some(target) = self.target_uri(&destination) else {
            error!(message = "Destination does not form a valid URI.", service = %destination);
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        };

        let request = match envelope.to_request(&target) {
            Ok(request) => request,
            Err(error) => {
                error!(message = "Failed to build forward request.", %error);
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        match self
            .client
            .send_with_timeout(request, self.forward_timeout)
            .await
        {
            Ok(()) => {
                emit!(EventRouted {
                    service: &destination,
                });
                empty_response(StatusCode::ACCEPTED)
            }
            Err(error) => {
                emit!(RouteForwardFailed {
                    service: &destination,
                    error,
                });
                empty_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        address: SocketAddr,
        shutdown: ShutdownSignal,
    ) -> crate::Result<()> {
        let router = Arc::clone(&self);
        let service = make_service_fn(move |_| {
            let router = Arc::clone(&router);
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let router = Arc::clone(&router);
                    async move { Ok::<_, Infallible>(router.handle(request).await) }
                }))
            }
        });

        info!(message = "Ingress listening.", %address);

        Server::try_bind(&address)?
            .serve(service)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("building empty response cannot fail")
}

fn text_response(status: StatusCode, message: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .expect("building text response cannot fail")
}
