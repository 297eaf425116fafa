//! Drains the ingress buffer at the admitted rate and forwards events to the
//! worker's domain endpoint.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use futures::StreamExt;
use http::Uri;
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::limiter::RateLimiter;
use crate::event::Envelope;
use crate::http::{BuildRequestSnafu, HttpClient, HttpError};
use crate::internal_events::{EventForwarded, ForwardFailed, ForwardRetried};
use crate::retries::ExponentialBackoff;

const MAX_ATTEMPTS: usize = 3;

pub struct Forwarder {
    client: HttpClient,
    limiter: Arc<RateLimiter>,
    target: Uri,
    forward_timeout: Duration,
    /// Number of events currently sitting in the ingress buffer.
    depth: Arc<AtomicUsize>,
}

impl Forwarder {
    pub fn new(
        limiter: Arc<RateLimiter>,
        target: Uri,
        forward_timeout: Duration,
        depth: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            client: HttpClient::new(),
            limiter,
            target,
            forward_timeout,
            depth,
        }
    }

    /// Runs the forwarder pool: up to `workers` events in flight at once,
    /// each gated by the shared limiter. Returns once the ingress buffer is
    /// closed and drained.
    pub async fn run(self: Arc<Self>, receiver: mpsc::Receiver<Envelope>, workers: usize) {
        ReceiverStream::new(receiver)
            .for_each_concurrent(workers, |envelope| {
                let forwarder = Arc::clone(&self);
                async move {
                    forwarder.depth.fetch_sub(1, Ordering::Relaxed);
                    forwarder.limiter.wait().await;
                    forwarder.forward(envelope).await;
                }
            })
            .await;

        debug!("Ingress buffer closed; forwarder pool drained.");
    }

    async fn forward(&self, envelope: Envelope) {
        let mut backoff = ExponentialBackoff::from_millis(2).factor(100);

        for attempt in 1..=MAX_ATTEMPTS {
            let result = match envelope
                .to_request(&self.target)
                .context(BuildRequestSnafu)
            {
                Ok(request) => {
                    self.client
                        .send_with_timeout(request, self.forward_timeout)
                        .await
                }
                Err(error) => Err(error),
            };

            match result {
                Ok(()) => {
                    emit!(EventForwarded {
                        depth: self.depth.load(Ordering::Relaxed),
                    });
                    return;
                }
                Err(error) => {
                    if attempt == MAX_ATTEMPTS {
                        emit!(ForwardFailed {
                            attempts: attempt,
                            error,
                        });
                        return;
                    }
                    emit!(ForwardRetried { attempt, error });
                    let delay = backoff.next().expect("backoff is infinite");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;

    use hyper::{
        service::{make_service_fn, service_fn},
        Body, Response, Server, StatusCode,
    };

    use super::*;
    use crate::event::Data;

    fn envelope(id: usize) -> Envelope {
        let mut envelope = Envelope::new(
            "test.event",
            "/test",
            Data::Json(serde_json::json!({ "n": id })),
        );
        envelope.id = id.to_string();
        envelope
    }

    /// A worker stub; `fail` makes it answer 500 until cleared.
    async fn spawn_worker(fail: Arc<AtomicBool>) -> (SocketAddr, Arc<AtomicUsize>) {
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);

        let service = make_service_fn(move |_| {
            let counter = Arc::clone(&counter);
            let fail = Arc::clone(&fail);
            async move {
                Ok::<_, Infallible>(service_fn(move |_request| {
                    let counter = Arc::clone(&counter);
                    let fail = Arc::clone(&fail);
                    async move {
                        let status = if fail.load(Ordering::SeqCst) {
                            StatusCode::INTERNAL_SERVER_ERROR
                        } else {
                            counter.fetch_add(1, Ordering::SeqCst);
                            StatusCode::OK
                        };
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Body::empty())
                                .unwrap(),
                        )
                    }
                }))
            }
        });

        let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(service);
        let address = server.local_addr();
        tokio::spawn(server);
        (address, received)
    }

    fn forwarder_for(address: SocketAddr, limiter: Arc<RateLimiter>) -> (Arc<Forwarder>, Arc<AtomicUsize>) {
        let depth = Arc::new(AtomicUsize::new(0));
        let target: Uri = format!("http://{}/", address).parse().unwrap();
        (
            Arc::new(Forwarder::new(
                limiter,
                target,
                Duration::from_secs(2),
                Arc::clone(&depth),
            )),
            depth,
        )
    }

    #[tokio::test]
    async fn no_accepted_event_is_lost_under_backpressure() {
        let (address, received) = spawn_worker(Arc::new(AtomicBool::new(false))).await;
        let limiter = Arc::new(RateLimiter::new(1000.0, 1.0));
        let (forwarder, depth) = forwarder_for(address, limiter);

        // A small buffer and many more submissions than it holds: senders
        // must block rather than drop, and every accepted event must come
        // out the other side.
        let (tx, rx) = mpsc::channel(4);
        let pool = tokio::spawn(forwarder.run(rx, 2));

        for i in 0..50 {
            depth.fetch_add(1, Ordering::Relaxed);
            tx.send(envelope(i)).await.unwrap();
        }
        drop(tx);
        pool.await.unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 50);
        assert_eq!(depth.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn full_buffer_rejects_try_send_until_drained() {
        let (address, _received) = spawn_worker(Arc::new(AtomicBool::new(false))).await;
        // A parked limiter keeps the pool from draining.
        let limiter = Arc::new(RateLimiter::new(0.0, 1.0));
        let (forwarder, depth) = forwarder_for(address, Arc::clone(&limiter));

        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(forwarder.run(rx, 1));

        for i in 0..3 {
            depth.fetch_add(1, Ordering::Relaxed);
            tx.send(envelope(i)).await.unwrap();
        }

        // Channel capacity plus in-flight slots are exhausted; submission
        // now applies backpressure.
        let result = tx.try_send(envelope(3));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_forward_is_retried_then_succeeds() {
        let fail = Arc::new(AtomicBool::new(true));
        let (address, received) = spawn_worker(Arc::clone(&fail)).await;
        let limiter = Arc::new(RateLimiter::new(1000.0, 1.0));
        let (forwarder, _depth) = forwarder_for(address, limiter);

        // First attempt fails; the worker recovers before the retry lands.
        let recover = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fail.store(false, Ordering::SeqCst);
        });

        forwarder.forward(envelope(0)).await;
        recover.await.unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_event() {
        let fail = Arc::new(AtomicBool::new(true));
        let (address, received) = spawn_worker(fail).await;
        let limiter = Arc::new(RateLimiter::new(1000.0, 1.0));
        let (forwarder, _depth) = forwarder_for(address, limiter);

        forwarder.forward(envelope(0)).await;
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }
}
