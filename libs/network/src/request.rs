//! Request/response correlation on top of a channel
//!
//! A request is a plain post whose reply carries `reply_to` equal to the
//! request's id. Ids of requests that timed out are remembered for a while so
//! a late reply is logged and dropped instead of reaching the handler.

use crate::channel::Channel;
use crate::{Result, TransportError};
use dashmap::DashMap;
use hublink_codec::{MessageHeader, MessageId, PreemptiveHashSet, Serializer};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Timed-out request ids remembered for late-reply detection
pub const EXPIRED_REQUEST_MEMORY: usize = 1024;

type Handler<T> = Arc<dyn Fn(MessageHeader, T) + Send + Sync>;

/// Removes a request's waiter however its future ends
struct PendingEntry<'a, T> {
    pending: &'a DashMap<MessageId, oneshot::Sender<T>>,
    id: MessageId,
}

impl<T> Drop for PendingEntry<'_, T> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Wraps a channel and takes over its callback
pub struct RequestClient<S: Serializer> {
    channel: Channel<S>,
    pending: Arc<DashMap<MessageId, oneshot::Sender<S::Item>>>,
    expired: Arc<Mutex<PreemptiveHashSet<MessageId>>>,
    unsolicited: Arc<RwLock<Option<Handler<S::Item>>>>,
    timeout: Duration,
}

impl<S: Serializer> RequestClient<S> {
    pub fn new(channel: Channel<S>, timeout: Duration) -> Self {
        let pending: Arc<DashMap<MessageId, oneshot::Sender<S::Item>>> = Arc::new(DashMap::new());
        let expired = Arc::new(Mutex::new(PreemptiveHashSet::new(EXPIRED_REQUEST_MEMORY)));
        let unsolicited: Arc<RwLock<Option<Handler<S::Item>>>> = Arc::new(RwLock::new(None));

        {
            let pending = pending.clone();
            let expired = expired.clone();
            let unsolicited = unsolicited.clone();
            channel.set_callback(move |header: MessageHeader, data: S::Item| {
                if header.is_reply() {
                    if let Some((_, waiter)) = pending.remove(&header.reply_to) {
                        if waiter.send(data).is_err() {
                            debug!(reply_to = %header.reply_to, "Requester gave up before the reply arrived");
                        }
                        return;
                    }
                    if expired.lock().contains(&header.reply_to) {
                        debug!(reply_to = %header.reply_to, "Dropping late reply to a timed-out request");
                        return;
                    }
                }

                let handler = unsolicited.read().clone();
                match handler {
                    Some(handler) => handler(header, data),
                    None => debug!(message_id = %header.message_id, "No handler for unsolicited message"),
                }
            });
        }

        Self {
            channel,
            pending,
            expired,
            unsolicited,
            timeout,
        }
    }

    /// Handler for messages that are not replies to a pending request
    pub fn on_unsolicited<F>(&self, handler: F)
    where
        F: Fn(MessageHeader, S::Item) + Send + Sync + 'static,
    {
        *self.unsolicited.write() = Some(Arc::new(handler));
    }

    /// Post `data` and wait for the reply addressed to it
    ///
    /// Dropping the returned future forgets the request; a reply arriving
    /// afterwards goes to the unsolicited handler.
    pub async fn request(&self, data: S::Item) -> Result<S::Item> {
        let (tx, rx) = oneshot::channel();
        let pending = self.pending.clone();
        let id = self.channel.post_tracked(data, MessageId::EMPTY, move |id| {
            pending.insert(id, tx);
        });
        let _pending = PendingEntry {
            pending: &*self.pending,
            id,
        };

        let wait = async {
            tokio::select! {
                reply = rx => reply.map_err(|_| TransportError::Canceled),
                _ = self.channel.closed() => Err(TransportError::connection("Channel closed while awaiting reply", None)),
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.expired.lock().insert(id);
                debug!(request_id = %id, timeout_ms = self.timeout.as_millis() as u64, "Request timed out");
                Err(TransportError::timeout("request", self.timeout.as_millis() as u64))
            }
        }
    }

    /// Reply to the message `to`
    pub fn reply(&self, to: MessageId, data: S::Item) -> MessageId {
        self.channel.post(data, to)
    }

    /// Post without expecting a reply
    pub fn post(&self, data: S::Item) -> MessageId {
        self.channel.post(data, MessageId::EMPTY)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn channel(&self) -> &Channel<S> {
        &self.channel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::endpoint::Endpoint;
    use hublink_codec::{BufferPool, HubId, TextSerializer};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    async fn unreachable_client(timeout: Duration) -> RequestClient<TextSerializer> {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut options = ConnectionOptions::new(HubId::new("requester").unwrap());
        options.reconnect_delay = Duration::from_millis(50);
        let channel = Channel::dial(
            Endpoint::tcp("127.0.0.1", port),
            Arc::new(TextSerializer),
            BufferPool::default(),
            options,
            &CancellationToken::new(),
        );
        RequestClient::new(channel, timeout)
    }

    #[tokio::test]
    async fn test_abandoned_requests_leave_nothing_pending() {
        let client = unreachable_client(Duration::from_secs(30)).await;
        for i in 0..50 {
            let abandoned = tokio::time::timeout(Duration::from_millis(1), client.request(format!("req-{}", i))).await;
            assert!(abandoned.is_err());
        }
        assert_eq!(client.pending_requests(), 0);
        client.channel().close().await;
    }

    #[tokio::test]
    async fn test_timed_out_request_is_forgotten() {
        let client = unreachable_client(Duration::from_millis(20)).await;
        let err = client.request("lonely".to_string()).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert_eq!(client.pending_requests(), 0);
        assert!(client.expired.lock().contains(&MessageId::new(1)));
        client.channel().close().await;
    }
}
