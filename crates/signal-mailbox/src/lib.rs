//! Username-keyed mailbox used to relay handshake messages between peers.
//!
//! A relay holds one mailbox per recipient. Every message is delivered to the
//! recipient's reader exactly once and removed from the relay on delivery.
//! Ordering is kept per mailbox but is not guaranteed across distinct senders.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

mod client;
mod message;
#[cfg(feature = "redis")]
mod redis_relay;

pub use client::MailboxClient;
pub use message::{IceCandidate, SignalKind, SignalingMessage};
#[cfg(feature = "redis")]
pub use redis_relay::RedisMailbox;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox channel closed")]
    Closed,
    #[error("mailbox backend error: {0}")]
    Backend(String),
    #[error("malformed signaling payload: {0}")]
    MalformedSignaling(String),
    #[error("signaling serialization failed: {0}")]
    Serialization(String),
}

pub type MailboxResult<T> = Result<T, MailboxError>;

/// Receiving half of a mailbox subscription.
pub type Inbox = mpsc::UnboundedReceiver<SignalingMessage>;

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Fire-and-forget delivery into `message.target`'s mailbox.
    async fn send(&self, message: SignalingMessage) -> MailboxResult<()>;

    /// Starts reading `recipient`'s mailbox. Messages queued before the call
    /// are delivered first. A later subscription for the same recipient
    /// replaces the earlier reader.
    async fn subscribe(&self, recipient: &str) -> MailboxResult<Inbox>;
}

#[derive(Debug, Default)]
struct Slot {
    backlog: VecDeque<SignalingMessage>,
    reader: Option<mpsc::UnboundedSender<SignalingMessage>>,
}

/// In-process relay for tests and single-process wiring.
#[derive(Debug, Default)]
pub struct LocalMailbox {
    slots: parking_lot::Mutex<HashMap<String, Slot>>,
}

impl LocalMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting for a reader in `recipient`'s mailbox.
    pub fn pending(&self, recipient: &str) -> usize {
        self.slots
            .lock()
            .get(recipient)
            .map(|slot| slot.backlog.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Mailbox for LocalMailbox {
    async fn send(&self, message: SignalingMessage) -> MailboxResult<()> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(message.target.clone()).or_default();
        tracing::trace!(
            target = "signal_mailbox",
            kind = %message.kind,
            sender = %message.sender,
            recipient = %message.target,
            "mailbox send"
        );
        if let Some(reader) = slot.reader.as_ref() {
            match reader.send(message) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(message)) => {
                    slot.reader = None;
                    slot.backlog.push_back(message);
                }
            }
        } else {
            slot.backlog.push_back(message);
        }
        Ok(())
    }

    async fn subscribe(&self, recipient: &str) -> MailboxResult<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slots = self.slots.lock();
        let slot = slots.entry(recipient.to_string()).or_default();
        while let Some(message) = slot.backlog.pop_front() {
            tx.send(message).map_err(|_| MailboxError::Closed)?;
        }
        slot.reader = Some(tx);
        Ok(rx)
    }
}
