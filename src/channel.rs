//! Inbound message channels
//!
//! A [`MessageChannel`] is the FIFO between the session's delivery task and
//! the application. The delivery side pushes; the application drains it
//! through a single [`MessageStream`] at a time. Closing the channel marks
//! end-of-stream: the consumer still receives everything pushed before the
//! close, then `None`.

use crate::error::{ClientError, ClientResult};
use crate::protocol::InboundMessage;
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffering policy, fixed when the channel is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelPolicy {
    #[default]
    Unbounded,
    Bounded {
        capacity: usize,
    },
}

#[derive(Debug, Clone)]
enum Sender {
    Unbounded(mpsc::UnboundedSender<InboundMessage>),
    Bounded(mpsc::Sender<InboundMessage>),
}

#[derive(Debug)]
enum Receiver {
    Unbounded(mpsc::UnboundedReceiver<InboundMessage>),
    Bounded(mpsc::Receiver<InboundMessage>),
}

impl Receiver {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<InboundMessage>> {
        match self {
            Receiver::Unbounded(rx) => rx.poll_recv(cx),
            Receiver::Bounded(rx) => rx.poll_recv(cx),
        }
    }

    fn blocking_recv(&mut self) -> Option<InboundMessage> {
        match self {
            Receiver::Unbounded(rx) => rx.blocking_recv(),
            Receiver::Bounded(rx) => rx.blocking_recv(),
        }
    }
}

fn new_pair(policy: ChannelPolicy) -> (Sender, Receiver) {
    match policy {
        ChannelPolicy::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Sender::Unbounded(tx), Receiver::Unbounded(rx))
        }
        ChannelPolicy::Bounded { capacity } => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (Sender::Bounded(tx), Receiver::Bounded(rx))
        }
    }
}

/// Why a non-blocking push did not go through
enum Rejected {
    Full(InboundMessage),
    Closed,
}

#[derive(Debug)]
struct Slots {
    /// Bumped on every reopen so a stale stream cannot park its receiver
    generation: u64,
    sender: Option<Sender>,
    receiver: Option<Receiver>,
}

/// FIFO of inbound messages with a single consumer
#[derive(Debug)]
pub struct MessageChannel {
    name: String,
    policy: ChannelPolicy,
    slots: Arc<Mutex<Slots>>,
}

impl MessageChannel {
    pub fn new(name: impl Into<String>, policy: ChannelPolicy) -> Self {
        let (sender, receiver) = new_pair(policy);
        Self {
            name: name.into(),
            policy,
            slots: Arc::new(Mutex::new(Slots {
                generation: 0,
                sender: Some(sender),
                receiver: Some(receiver),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> ChannelPolicy {
        self.policy
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn closed(&self) -> ClientError {
        ClientError::ChannelClosed(self.name.clone())
    }

    fn try_push(&self, message: InboundMessage) -> Result<(), Rejected> {
        let slots = self.slots();
        match &slots.sender {
            None => Err(Rejected::Closed),
            Some(Sender::Unbounded(tx)) => tx.send(message).map_err(|_| Rejected::Closed),
            Some(Sender::Bounded(tx)) => tx.try_send(message).map_err(|e| match e {
                mpsc::error::TrySendError::Full(message) => Rejected::Full(message),
                mpsc::error::TrySendError::Closed(_) => Rejected::Closed,
            }),
        }
    }

    /// Append a message without waiting
    ///
    /// Fails with [`ClientError::Backpressure`] when a bounded channel is full
    /// and [`ClientError::ChannelClosed`] after [`close`](Self::close).
    pub fn push(&self, message: InboundMessage) -> ClientResult<()> {
        match self.try_push(message) {
            Ok(()) => Ok(()),
            Err(Rejected::Full(_)) => Err(ClientError::Backpressure {
                channel: self.name.clone(),
                capacity: match self.policy {
                    ChannelPolicy::Bounded { capacity } => capacity,
                    ChannelPolicy::Unbounded => 0,
                },
            }),
            Err(Rejected::Closed) => Err(self.closed()),
        }
    }

    /// Append a message, waiting for capacity when a bounded channel is full
    pub async fn push_wait(&self, message: InboundMessage) -> ClientResult<()> {
        let message = match self.try_push(message) {
            Ok(()) => return Ok(()),
            Err(Rejected::Closed) => return Err(self.closed()),
            Err(Rejected::Full(message)) => message,
        };

        warn!(channel = %self.name, "Channel full, waiting for the consumer to catch up");
        let sender = self.slots().sender.clone().ok_or_else(|| self.closed())?;
        match sender {
            Sender::Unbounded(tx) => tx.send(message).map_err(|_| self.closed()),
            Sender::Bounded(tx) => tx.send(message).await.map_err(|_| self.closed()),
        }
    }

    /// Mark end-of-stream; idempotent
    ///
    /// A consumer blocked in `next()` wakes with `None` once it has drained
    /// what was pushed before the close.
    pub fn close(&self) {
        if self.slots().sender.take().is_some() {
            debug!(channel = %self.name, "Channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.slots().sender.is_none()
    }

    /// Start a fresh generation after a close; a no-op while open
    ///
    /// Messages left undrained in the closed generation are discarded.
    pub fn reopen(&self) {
        let mut slots = self.slots();
        if slots.sender.is_some() {
            return;
        }
        let (sender, receiver) = new_pair(self.policy);
        slots.generation += 1;
        slots.sender = Some(sender);
        slots.receiver = Some(receiver);
        debug!(channel = %self.name, generation = slots.generation, "Channel reopened");
    }

    /// Take the consumer handle
    ///
    /// Only one stream can be active at a time; dropping it hands the
    /// receiver back so a later call resumes where it stopped.
    pub fn stream(&self) -> ClientResult<MessageStream> {
        let mut slots = self.slots();
        let receiver = slots
            .receiver
            .take()
            .ok_or_else(|| ClientError::ConsumerActive(self.name.clone()))?;
        Ok(MessageStream {
            generation: slots.generation,
            receiver: Some(receiver),
            slots: self.slots.clone(),
        })
    }
}

/// Single consumer of a [`MessageChannel`]
///
/// Yields messages in push order and `None` once the channel is closed and
/// drained. Usable as a [`futures::Stream`], through the inherent
/// [`next`](Self::next), or from a plain thread via
/// [`blocking_iter`](Self::blocking_iter).
#[derive(Debug)]
pub struct MessageStream {
    generation: u64,
    receiver: Option<Receiver>,
    slots: Arc<Mutex<Slots>>,
}

impl MessageStream {
    /// Wait for the next message; `None` is end-of-stream
    pub async fn next(&mut self) -> Option<InboundMessage> {
        futures::future::poll_fn(|cx| self.poll_message(cx)).await
    }

    fn poll_message(&mut self, cx: &mut Context<'_>) -> Poll<Option<InboundMessage>> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }

    /// Blocking iterator for consumers outside the async runtime
    ///
    /// Panics if iterated from within an async execution context, like
    /// tokio's own `blocking_recv`.
    pub fn blocking_iter(self) -> BlockingMessages {
        BlockingMessages { stream: self }
    }
}

impl Stream for MessageStream {
    type Item = InboundMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_message(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            if slots.generation == self.generation && slots.receiver.is_none() {
                slots.receiver = Some(receiver);
            }
        }
    }
}

/// Iterator returned by [`MessageStream::blocking_iter`]
#[derive(Debug)]
pub struct BlockingMessages {
    stream: MessageStream,
}

impl Iterator for BlockingMessages {
    type Item = InboundMessage;

    fn next(&mut self) -> Option<Self::Item> {
        self.stream.receiver.as_mut()?.blocking_recv()
    }
}
