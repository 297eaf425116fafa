use futures::{Stream, StreamExt};
use tokio::time::sleep;

use crate::retries::reconnect_backoff;
use crate::shutdown::ShutdownSignal;

/// Subscribes to `channel` and yields each payload as a string.
///
/// The stream is infinite: on connection loss it reconnects with exponential
/// backoff (base 100 ms, cap 10 s) and resumes. It ends only when `shutdown`
/// fires.
pub fn subscribe(
    client: redis::Client,
    channel: String,
    mut shutdown: ShutdownSignal,
) -> impl Stream<Item = String> {
    async_stream::stream! {
        let mut backoff = reconnect_backoff();

        'reconnect: loop {
            let connect = async {
                let conn = client.get_async_connection().await?;
                let mut pubsub = conn.into_pubsub();
                pubsub.subscribe(channel.as_str()).await?;
                Ok::<_, redis::RedisError>(pubsub)
            };

            let mut pubsub = tokio::select! {
                result = connect => match result {
                    Ok(pubsub) => pubsub,
                    Err(error) => {
                        let retry_in = backoff.next().expect("backoff is infinite");
                        emit!(crate::internal_events::SubscriptionFailed {
                            error: error.into(),
                            retry_in,
                        });
                        tokio::select! {
                            _ = sleep(retry_in) => continue 'reconnect,
                            _ = &mut shutdown => return,
                        }
                    }
                },
                _ = &mut shutdown => return,
            };

            debug!(message = "Subscribed to channel.", channel = %channel);
            backoff.reset();

            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    message = messages.next() => match message {
                        Some(message) => match message.get_payload::<String>() {
                            Ok(payload) => yield payload,
                            Err(error) => {
                                warn!(
                                    message = "Discarding non-text payload.",
                                    channel = %channel,
                                    %error,
                                );
                            }
                        },
                        // The pub/sub connection dropped; rebuild it.
                        None => continue 'reconnect,
                    },
                    _ = &mut shutdown => return,
                }
            }
        }
    }
}
