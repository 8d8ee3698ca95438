use std::sync::Arc;

use crate::{IceCandidate, Inbox, Mailbox, MailboxResult, SignalKind, SignalingMessage};

/// Typed handle on a relay for one local identity.
#[derive(Clone)]
pub struct MailboxClient {
    local_id: String,
    mailbox: Arc<dyn Mailbox>,
}

impl MailboxClient {
    pub fn new(local_id: impl Into<String>, mailbox: Arc<dyn Mailbox>) -> Self {
        Self {
            local_id: local_id.into(),
            mailbox,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub async fn send(&self, target: &str, kind: SignalKind, payload: String) -> MailboxResult<()> {
        tracing::debug!(
            target = "signal_mailbox",
            sender = %self.local_id,
            recipient = %target,
            kind = %kind,
            payload_len = payload.len(),
            "sending signaling message"
        );
        self.mailbox
            .send(SignalingMessage::new(kind, self.local_id.as_str(), target, payload))
            .await
    }

    pub async fn send_offer(&self, target: &str, sdp: String) -> MailboxResult<()> {
        self.send(target, SignalKind::Offer, sdp).await
    }

    pub async fn send_answer(&self, target: &str, sdp: String) -> MailboxResult<()> {
        self.send(target, SignalKind::Answer, sdp).await
    }

    pub async fn send_ice(&self, target: &str, candidate: &IceCandidate) -> MailboxResult<()> {
        self.send(target, SignalKind::Ice, candidate.to_payload()).await
    }

    /// Reads this identity's own mailbox.
    pub async fn subscribe(&self) -> MailboxResult<Inbox> {
        self.mailbox.subscribe(&self.local_id).await
    }
}

impl std::fmt::Debug for MailboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxClient")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}
