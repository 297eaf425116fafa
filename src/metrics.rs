//! Metrics bootstrap and the `/metrics` + `/healthz` endpoint.
//!
//! Recording happens exclusively through internal events; this module only
//! installs the recorder and renders its registry over HTTP.

use std::{convert::Infallible, net::SocketAddr};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::shutdown::ShutdownSignal;

/// Installs the global prometheus recorder. Must run before any metric is
/// emitted; repeated installation is an error.
pub fn init() -> crate::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

async fn handle_request(
    request: Request<Body>,
    handle: PrometheusHandle,
) -> Result<Response<Body>, Infallible> {
    let response = match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => Response::new(Body::from(handle.render())),
        (&Method::GET, "/healthz") => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .expect("building empty response cannot fail"),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("building empty response cannot fail"),
    };
    Ok(response)
}

/// Serves the metrics endpoint until shutdown. Bind failures are returned so
/// startup can abort; anything later is logged by hyper.
pub async fn serve(
    address: SocketAddr,
    handle: PrometheusHandle,
    shutdown: ShutdownSignal,
) -> crate::Result<()> {
    let service = make_service_fn(move |_| {
        let handle = handle.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                handle_request(request, handle.clone())
            }))
        }
    });

    info!(message = "Metrics endpoint listening.", %address);

    Server::try_bind(&address)?
        .serve(service)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
