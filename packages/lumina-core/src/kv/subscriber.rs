//! Substrate pub/sub subscriber task.
//!
//! One task per process owns the dedicated pub/sub connection. Channel
//! subscriptions change at runtime (rooms come and go), so the connection is
//! split into a sink (subscribe/unsubscribe commands) and a stream (incoming
//! messages), and the task selects over both. Death of the connection
//! triggers reconnect-with-backoff followed by resubscription of every
//! channel still registered.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::protocol_constants::{SUBSCRIBER_BACKOFF_INITIAL_MS, SUBSCRIBER_BACKOFF_MAX_MS};

use super::SubscriberFn;

/// Commands accepted by the subscriber task.
pub(crate) enum SubCmd {
    Subscribe(String),
    Unsubscribe(String),
}

/// Spawns the subscriber task for a Redis-backed store.
///
/// `handlers` is shared with the owning [`super::KvStore`]; the task consults
/// it both for dispatch and for resubscription after a reconnect.
pub(crate) fn spawn_subscriber(
    client: redis::Client,
    handlers: Arc<DashMap<String, SubscriberFn>>,
    mut rx: mpsc::UnboundedReceiver<SubCmd>,
) {
    tokio::spawn(async move {
        let mut backoff_ms = SUBSCRIBER_BACKOFF_INITIAL_MS;
        loop {
            let pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    log::warn!(
                        "[KV] Subscriber connect failed ({}), retrying in {}ms",
                        e,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(SUBSCRIBER_BACKOFF_MAX_MS);
                    continue;
                }
            };
            backoff_ms = SUBSCRIBER_BACKOFF_INITIAL_MS;

            let (mut sink, mut stream) = pubsub.split();

            // Resubscribe everything registered before the (re)connect.
            let mut resubscribe_failed = false;
            let channels: Vec<String> = handlers.iter().map(|entry| entry.key().clone()).collect();
            for channel in &channels {
                if let Err(e) = sink.subscribe(channel).await {
                    log::warn!("[KV] Resubscribe of {} failed: {}", channel, e);
                    resubscribe_failed = true;
                    break;
                }
            }
            if resubscribe_failed {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                continue;
            }

            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(SubCmd::Subscribe(channel)) => {
                            if let Err(e) = sink.subscribe(&channel).await {
                                log::warn!("[KV] Subscribe {} failed: {}", channel, e);
                            }
                        }
                        Some(SubCmd::Unsubscribe(channel)) => {
                            if let Err(e) = sink.unsubscribe(&channel).await {
                                log::debug!("[KV] Unsubscribe {} failed: {}", channel, e);
                            }
                        }
                        // Owning store dropped; nothing left to serve.
                        None => return,
                    },
                    msg = stream.next() => match msg {
                        Some(msg) => {
                            let channel = msg.get_channel_name().to_string();
                            let payload: String = msg.get_payload().unwrap_or_default();
                            if let Some(handler) = handlers.get(&channel) {
                                (handler.value())(&channel, &payload);
                            }
                        }
                        None => break,
                    }
                }
            }

            log::warn!("[KV] Subscriber connection lost, reconnecting");
        }
    });
}
