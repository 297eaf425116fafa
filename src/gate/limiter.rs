//! A token-bucket limiter whose fill rate can be retuned while waiters are
//! parked on it.
//!
//! `wait` is cancellation safe: a token is only consumed synchronously, right
//! before returning, so a cancelled waiter never loses a reservation.
//! `set_rate` wakes every parked waiter so in-flight waits observe the new
//! rate on their next scheduling decision.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

#[derive(Debug)]
struct Bucket {
    /// Fill rate in tokens per second. Zero parks all waiters.
    rate: f64,
    /// Maximum tokens the bucket holds.
    burst: f64,
    tokens: f64,
    updated: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.updated = now;
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    rate_changed: Notify,
}

impl RateLimiter {
    /// A limiter starting with a full bucket. `burst` is clamped to at least
    /// one token so a positive rate can always make progress.
    pub fn new(rate: f64, burst: f64) -> Self {
        let burst = burst.max(1.0);
        Self {
            bucket: Mutex::new(Bucket {
                rate: rate.max(0.0),
                burst,
                tokens: burst,
                updated: Instant::now(),
            }),
            rate_changed: Notify::new(),
        }
    }

    pub fn rate(&self) -> f64 {
        self.bucket.lock().expect("limiter poisoned").rate
    }

    /// Applies a new fill rate. Time elapsed so far is credited at the old
    /// rate before switching over.
    pub fn set_rate(&self, rate: f64) {
        let mut bucket = self.bucket.lock().expect("limiter poisoned");
        bucket.refill(Instant::now());
        bucket.rate = rate.max(0.0);
        drop(bucket);

        self.rate_changed.notify_waiters();
    }

    /// Blocks until one token is available, then consumes it.
    pub async fn wait(&self) {
        loop {
            // Arm the rate-change notification before inspecting the bucket,
            // so an update between the inspection and the sleep still wakes
            // this waiter.
            let notified = self.rate_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delay = {
                let mut bucket = self.bucket.lock().expect("limiter poisoned");
                bucket.refill(Instant::now());

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }

                if bucket.rate > 0.0 {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / bucket.rate,
                    ))
                } else {
                    None
                }
            };

            match delay {
                Some(delay) => {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = &mut notified => {}
                    }
                }
                // Zero rate: nothing to pace against until a new rate lands.
                None => notified.await,
            }
        }
    }
}
