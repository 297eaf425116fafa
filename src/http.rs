use std::time::Duration;

use http::{header::HeaderValue, Request, Response, StatusCode};
use hyper::{
    body::Body,
    client::{Client, HttpConnector},
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    #[snafu(display("Failed to build HTTP request: {}", source))]
    BuildRequest { source: http::Error },
    #[snafu(display("Failed to make HTTP request: {}", source))]
    CallRequest { source: hyper::Error },
    #[snafu(display("Request timed out after {:?}", after))]
    RequestTimedOut { after: Duration },
    #[snafu(display("Unexpected response status: {}", status))]
    UnexpectedStatus { status: StatusCode },
}

/// A plain HTTP/1.1 client for in-cluster traffic, with a stable user agent
/// and per-call timeouts.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client<HttpConnector>,
    user_agent: HeaderValue,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        let user_agent = HeaderValue::from_str(&format!("floodgate/{}", crate::get_version()))
            .expect("Invalid header value for version!");
        Self {
            client: Client::new(),
            user_agent,
        }
    }

    pub async fn send(&self, mut request: Request<Body>) -> Result<Response<Body>, HttpError> {
        if !request.headers().contains_key(http::header::USER_AGENT) {
            request
                .headers_mut()
                .insert(http::header::USER_AGENT, self.user_agent.clone());
        }

        trace!(message = "Sending HTTP request.", uri = %request.uri(), method = %request.method());

        let response = self
            .client
            .request(request)
            .await
            .context(CallRequestSnafu)?;

        trace!(message = "HTTP response.", status = %response.status());
        Ok(response)
    }

    /// Sends `request` and treats both timeouts and non-2xx statuses as
    /// errors. The response body is discarded.
    pub async fn send_with_timeout(
        &self,
        request: Request<Body>,
        timeout: Duration,
    ) -> Result<(), HttpError> {
        let response = tokio::time::timeout(timeout, self.send(request))
            .await
            .map_err(|_| HttpError::RequestTimedOut { after: timeout })??;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HttpError::UnexpectedStatus { status })
        }
    }
}
