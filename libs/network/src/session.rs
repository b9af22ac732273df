//! Session: the serialization pipeline behind a channel
//!
//! ```text
//! post ──► pending ──[serialize worker]──► outgoing ──► writer loop
//!                                                          │ socket
//! callback ◄──[deserialize worker]◄── incoming ◄── reader loop
//! ```
//!
//! Ids are assigned and the item enqueued inside one critical section, so the
//! order of `post` calls is the order on the wire. User codecs and callbacks
//! run on the two worker tasks and never on the socket loops.

use crate::metrics::ChannelMetrics;
use crate::queue::{AwaitableQueue, QueueError};
use crate::{Result, TransportError};
use hublink_codec::{BufferPool, CodecError, Message, MessageHeader, MessageId, Serializer};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Per-message callback installed by the application
pub type Callback<T> = Arc<dyn Fn(MessageHeader, T) + Send + Sync>;

struct PendingItem<T> {
    message_id: MessageId,
    reply_to: MessageId,
    data: T,
}

pub struct Session<S: Serializer> {
    label: String,
    serializer: Arc<S>,
    pool: BufferPool,
    next_id: Mutex<MessageId>,
    pending: AwaitableQueue<PendingItem<S::Item>>,
    outgoing: AwaitableQueue<Message>,
    incoming: AwaitableQueue<Message>,
    callback: RwLock<Option<Callback<S::Item>>>,
    cancel: CancellationToken,
    metrics: Arc<ChannelMetrics>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Serializer> Session<S> {
    /// Create a session and spawn its two workers under `cancel`
    pub fn start(
        label: impl Into<String>,
        serializer: Arc<S>,
        pool: BufferPool,
        metrics: Arc<ChannelMetrics>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            label: label.into(),
            serializer,
            pool,
            next_id: Mutex::new(MessageId::EMPTY),
            pending: AwaitableQueue::new(),
            outgoing: AwaitableQueue::new(),
            incoming: AwaitableQueue::new(),
            callback: RwLock::new(None),
            cancel,
            metrics,
            workers: Mutex::new(Vec::with_capacity(2)),
        });

        let serialize = tokio::spawn(session.clone().serialize_loop());
        let deserialize = tokio::spawn(session.clone().deserialize_loop());
        session.workers.lock().extend([serialize, deserialize]);
        session
    }

    /// Assign the next id and queue `data` for serialization
    pub fn enqueue_outgoing(&self, data: S::Item, reply_to: MessageId) -> MessageId {
        self.enqueue_outgoing_with(data, reply_to, |_| {})
    }

    /// Like [`enqueue_outgoing`](Self::enqueue_outgoing), running `on_assigned`
    /// with the new id before the item becomes visible to the worker
    pub fn enqueue_outgoing_with<F>(&self, data: S::Item, reply_to: MessageId, on_assigned: F) -> MessageId
    where
        F: FnOnce(MessageId),
    {
        let mut next_id = self.next_id.lock();
        let message_id = next_id.next();
        *next_id = message_id;
        on_assigned(message_id);

        let item = PendingItem {
            message_id,
            reply_to,
            data,
        };
        if self.pending.enqueue(item).is_err() {
            debug!(channel = %self.label, %message_id, "Session closed, dropping outgoing message");
        }
        message_id
    }

    /// Hand a received message to the deserialization worker
    pub fn enqueue_incoming(&self, message: Message) -> bool {
        match self.incoming.enqueue(message) {
            Ok(()) => true,
            Err(message) => {
                debug!(
                    channel = %self.label,
                    message_id = %message.header().message_id,
                    "Session closed, dropping incoming message"
                );
                false
            }
        }
    }

    /// Next serialized message for the writer loop
    pub async fn next_outgoing(&self, cancel: &CancellationToken) -> std::result::Result<Message, QueueError> {
        self.outgoing.dequeue(cancel).await
    }

    pub fn try_next_outgoing(&self) -> Option<Message> {
        self.outgoing.try_dequeue()
    }

    /// Install or replace the callback; applies from the next delivered message
    pub fn set_callback(&self, callback: Callback<S::Item>) {
        *self.callback.write() = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// Messages waiting for serialization or for the writer
    pub fn queued_outgoing(&self) -> usize {
        self.pending.len() + self.outgoing.len()
    }

    pub fn last_assigned_id(&self) -> MessageId {
        *self.next_id.lock()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop both workers and close all queues, releasing held buffers
    ///
    /// The callback is dropped too, so one that captured its own channel
    /// does not keep it alive.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.clear_callback();

        let mut dropped = 0usize;
        self.pending.close(|_| dropped += 1);
        self.outgoing.close(|_| dropped += 1);
        self.incoming.close(|_| dropped += 1);

        if dropped > 0 {
            debug!(channel = %self.label, dropped, "Session shut down with queued messages");
        }
    }

    /// Wait for both workers to exit
    pub async fn join(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    error!(channel = %self.label, "Session worker panicked");
                }
            }
        }
    }

    async fn serialize_loop(self: Arc<Self>) {
        loop {
            let item = match self.pending.dequeue(&self.cancel).await {
                Ok(item) => item,
                Err(_) => break,
            };
            let message_id = item.message_id;

            match self.serialize(item) {
                Ok(message) => {
                    if self.outgoing.enqueue(message).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    self.metrics.record_serialization_error();
                    warn!(channel = %self.label, %message_id, error = %e, "Failed to serialize message, dropping it");
                }
            }
        }
        debug!(channel = %self.label, "Serialization worker stopped");
    }

    fn serialize(&self, item: PendingItem<S::Item>) -> Result<Message> {
        let mut payload = self.pool.rent();
        let type_id = self.serializer.serialize(&item.data, &mut payload)?;
        if type_id.is_handshake() {
            return Err(CodecError::ReservedTypeId(type_id).into());
        }
        let header = MessageHeader::new(type_id, item.message_id, item.reply_to);
        Message::new(header, payload).map_err(TransportError::from)
    }

    async fn deserialize_loop(self: Arc<Self>) {
        loop {
            let message = match self.incoming.dequeue(&self.cancel).await {
                Ok(message) => message,
                Err(_) => break,
            };

            let (header, mut payload) = message.into_parts();
            let result = self.serializer.deserialize(&header, &mut payload);
            drop(payload);

            match result {
                Ok(data) => self.deliver(header, data),
                Err(e) => {
                    self.metrics.record_deserialization_error();
                    warn!(
                        channel = %self.label,
                        message_id = %header.message_id,
                        type_id = %header.type_id,
                        error = %e,
                        "Failed to deserialize message, dropping it"
                    );
                }
            }
        }
        debug!(channel = %self.label, "Deserialization worker stopped");
    }

    fn deliver(&self, header: MessageHeader, data: S::Item) {
        let callback = self.callback.read().clone();
        let Some(callback) = callback else {
            debug!(channel = %self.label, message_id = %header.message_id, "No callback installed, dropping message");
            return;
        };

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(header, data))) {
            self.metrics.record_callback_panic();
            error!(
                channel = %self.label,
                message_id = %header.message_id,
                panic = panic_message(&*panic),
                "Message callback panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hublink_codec::{MessageTypeId, PooledBuffer, TextSerializer};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn start<S: Serializer>(serializer: S, pool: &BufferPool) -> Arc<Session<S>> {
        Session::start(
            "test",
            Arc::new(serializer),
            pool.clone(),
            Arc::new(ChannelMetrics::new()),
            CancellationToken::new(),
        )
    }

    fn text_message(pool: &BufferPool, id: u64, text: &str) -> Message {
        let mut payload = pool.rent();
        payload.write_slice(text.as_bytes());
        let header = MessageHeader::new(TextSerializer::TYPE_ID, MessageId::new(id), MessageId::EMPTY);
        Message::new(header, payload).unwrap()
    }

    #[tokio::test]
    async fn test_ids_are_sequential_and_serialized_in_order() {
        let pool = BufferPool::new(64, 16);
        let session = start(TextSerializer, &pool);
        let cancel = CancellationToken::new();

        let ids: Vec<_> = (0..5)
            .map(|i| session.enqueue_outgoing(format!("msg-{}", i), MessageId::EMPTY))
            .collect();
        assert_eq!(ids, (1..=5).map(MessageId::new).collect::<Vec<_>>());

        for (i, id) in ids.iter().enumerate() {
            let message = session.next_outgoing(&cancel).await.unwrap();
            assert_eq!(message.header().message_id, *id);
            assert_eq!(message.header().type_id, TextSerializer::TYPE_ID);
            assert_eq!(message.payload().to_vec(), format!("msg-{}", i).into_bytes());
        }
        session.shutdown();
    }

    #[tokio::test]
    async fn test_reply_to_is_carried() {
        let pool = BufferPool::default();
        let session = start(TextSerializer, &pool);
        session.enqueue_outgoing("answer".to_string(), MessageId::new(41));
        let message = session.next_outgoing(&CancellationToken::new()).await.unwrap();
        assert_eq!(message.header().reply_to, MessageId::new(41));
        session.shutdown();
    }

    #[tokio::test]
    async fn test_callback_receives_and_survives_panics() {
        let pool = BufferPool::default();
        let session = start(TextSerializer, &pool);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_callback(Arc::new(move |header: MessageHeader, text: String| {
            if text == "boom" {
                panic!("callback exploded");
            }
            let _ = tx.send((header.message_id, text));
        }));

        session.enqueue_incoming(text_message(&pool, 1, "boom"));
        session.enqueue_incoming(text_message(&pool, 2, "still alive"));

        let (id, text) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(id, MessageId::new(2));
        assert_eq!(text, "still alive");
        session.shutdown();
    }

    struct ReservedType;

    impl Serializer for ReservedType {
        type Item = u8;

        fn serialize(&self, item: &u8, sink: &mut PooledBuffer) -> std::result::Result<MessageTypeId, CodecError> {
            sink.write_slice(&[*item]);
            Ok(if *item == 0 { MessageTypeId::HANDSHAKE } else { MessageTypeId(3) })
        }

        fn deserialize(&self, _: &MessageHeader, _: &mut PooledBuffer) -> std::result::Result<u8, CodecError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_handshake_type_is_dropped_and_buffer_returned() {
        let pool = BufferPool::new(16, 4);
        let session = start(ReservedType, &pool);
        session.enqueue_outgoing(0, MessageId::EMPTY);
        session.enqueue_outgoing(1, MessageId::EMPTY);

        let message = session.next_outgoing(&CancellationToken::new()).await.unwrap();
        assert_eq!(message.header().message_id, MessageId::new(2));
        drop(message);
        assert_eq!(pool.stats().outstanding(), 0);
        session.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_releases_queued_buffers() {
        let pool = BufferPool::new(16, 4);
        let session = start(TextSerializer, &pool);
        session.shutdown();
        session.join().await;

        // Nothing is accepted after shutdown and nothing leaks
        assert!(!session.enqueue_incoming(text_message(&pool, 1, "late")));
        session.enqueue_outgoing("late".to_string(), MessageId::EMPTY);
        assert_eq!(session.queued_outgoing(), 0);
        assert_eq!(pool.stats().outstanding(), 0);
    }
}
