//! Broker access, limited to the two operations the control plane consumes:
//! queue discovery by name prefix (management API) and the current message
//! count of the workload queue (passive AMQP declare).

mod observer;

pub use observer::{EmptyQueueEvent, QueueObserver};

use std::time::Duration;

use async_trait::async_trait;
use headers::{Authorization, HeaderMapExt};
use http::{Request, StatusCode};
use hyper::Body;
use lapin::{
    options::QueueDeclareOptions, types::FieldTable, Channel, Connection, ConnectionProperties,
};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;

use crate::config::BrokerConfig;
use crate::http::HttpClient;

const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum BrokerError {
    #[snafu(display("Failed to connect to broker: {}", source))]
    Connect { source: lapin::Error },
    #[snafu(display("Failed to inspect queue: {}", source))]
    Inspect { source: lapin::Error },
    #[snafu(display("Management API request failed: {}", source))]
    Management { source: crate::http::HttpError },
    #[snafu(display("Management API returned status {}", status))]
    ManagementStatus { status: StatusCode },
    #[snafu(display("Failed to parse management API response: {}", source))]
    ParseQueues { source: serde_json::Error },
    #[snafu(display("No queue found with prefix {:?}", prefix))]
    QueueNotFound { prefix: String },
}

/// Message-count access to the broker. The observer is generic over this so
/// tests can script poll results.
#[async_trait]
pub trait QueueStats: Send + Sync {
    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError>;
}

#[derive(Debug, Deserialize)]
struct QueueInfo {
    name: String,
    #[serde(default)]
    messages: u32,
}

pub struct BrokerClient {
    config: BrokerConfig,
    http: HttpClient,
    // Rebuilt lazily after any AMQP failure.
    amqp: Mutex<Option<(Connection, Channel)>>,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
            amqp: Mutex::new(None),
        }
    }

    /// Finds the workload queue via the management API, matching the
    /// configured name prefix.
    pub async fn find_queue_with_prefix(&self) -> Result<String, BrokerError> {
        let url = format!(
            "{}/api/queues",
            self.config.management_url.trim_end_matches('/')
        );
        let mut request = Request::get(url.as_str())
            .body(Body::empty())
            .expect("static request is always valid");
        request.headers_mut().typed_insert(Authorization::basic(
            &self.config.username,
            &self.config.password,
        ));

        let response = match tokio::time::timeout(MANAGEMENT_TIMEOUT, self.http.send(request)).await
        {
            Ok(result) => result.context(ManagementSnafu)?,
            Err(_) => {
                return Err(BrokerError::Management {
                    source: crate::http::HttpError::RequestTimedOut {
                        after: MANAGEMENT_TIMEOUT,
                    },
                })
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::ManagementStatus { status });
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|source| BrokerError::Management {
                source: crate::http::HttpError::CallRequest { source },
            })?;
        let queues: Vec<QueueInfo> = serde_json::from_slice(&body).context(ParseQueuesSnafu)?;

        queues
            .into_iter()
            .map(|queue| queue.name)
            .find(|name| name.starts_with(&self.config.queue_prefix))
            .ok_or_else(|| BrokerError::QueueNotFound {
                prefix: self.config.queue_prefix.clone(),
            })
    }

    async fn channel(&self) -> Result<Channel, BrokerError> {
        let mut amqp = self.amqp.lock().await;

        if let Some((connection, channel)) = amqp.as_ref() {
            if connection.status().connected() && channel.status().connected() {
                return Ok(channel.clone());
            }
            *amqp = None;
        }

        debug!(message = "Connecting to broker.", url = %self.config.amqp_url);
        let connection =
            Connection::connect(&self.config.amqp_url, ConnectionProperties::default())
                .await
                .context(ConnectSnafu)?;
        let channel = connection.create_channel().await.context(ConnectSnafu)?;
        *amqp = Some((connection, channel.clone()));
        Ok(channel)
    }
}

#[async_trait]
impl QueueStats for BrokerClient {
    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        let channel = self.channel().await?;

        // A passive declare asserts existence and reports the current depth
        // without touching the queue.
        let options = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        let result = channel
            .queue_declare(queue, options, FieldTable::default())
            .await;

        match result {
            Ok(queue) => Ok(queue.message_count()),
            Err(source) => {
                // The channel is dead after a failed passive declare; drop it
                // so the next poll reconnects.
                *self.amqp.lock().await = None;
                Err(BrokerError::Inspect { source })
            }
        }
    }
}
