use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tokio::sync::{OnceCell, mpsc};

use crate::{Inbox, Mailbox, MailboxError, MailboxResult, SignalingMessage};

const DEFAULT_PREFIX: &str = "tandem:mailbox";
const BLOCK_SECS: u64 = 1;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Redis-backed relay. Each recipient owns a list; readers pop with `BLPOP`
/// so every message is handed to exactly one reader and removed.
pub struct RedisMailbox {
    client: redis::Client,
    prefix: String,
    writer: OnceCell<ConnectionManager>,
}

impl RedisMailbox {
    pub fn new(url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            writer: OnceCell::new(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key_for(&self, recipient: &str) -> String {
        format!("{}:{}", self.prefix, recipient)
    }

    /// Shared writer connection; the manager reconnects on its own.
    async fn conn(&self) -> RedisResult<ConnectionManager> {
        let manager = self
            .writer
            .get_or_try_init(|| self.client.get_connection_manager())
            .await?;
        Ok(manager.clone())
    }
}

impl From<redis::RedisError> for MailboxError {
    fn from(err: redis::RedisError) -> Self {
        MailboxError::Backend(err.to_string())
    }
}

#[async_trait]
impl Mailbox for RedisMailbox {
    async fn send(&self, message: SignalingMessage) -> MailboxResult<()> {
        let payload = message.to_json()?;
        let key = self.key_for(&message.target);
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(&key, payload).await?;
        tracing::trace!(
            target = "signal_mailbox",
            key = %key,
            kind = %message.kind,
            "pushed to redis mailbox"
        );
        Ok(())
    }

    async fn subscribe(&self, recipient: &str) -> MailboxResult<Inbox> {
        let key = self.key_for(recipient);
        let client = self.client.clone();
        // Fail fast on an unreachable relay instead of inside the reader task.
        let first = client.get_multiplexed_async_connection().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(client, first, key, tx));
        Ok(rx)
    }
}

async fn read_loop(
    client: redis::Client,
    mut conn: redis::aio::MultiplexedConnection,
    key: String,
    tx: mpsc::UnboundedSender<SignalingMessage>,
) {
    while !tx.is_closed() {
        let reply: RedisResult<Option<(String, String)>> = redis::cmd("BLPOP")
            .arg(&key)
            .arg(BLOCK_SECS)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(Some((_, raw))) => match SignalingMessage::from_json(&raw) {
                Ok(message) => {
                    if let Err(mpsc::error::SendError(message)) = tx.send(message) {
                        // Reader went away after the pop; hand the message back.
                        if let Ok(raw) = message.to_json() {
                            let _: RedisResult<()> = conn.lpush(&key, raw).await;
                        }
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "signal_mailbox",
                        key = %key,
                        error = %err,
                        "dropping undecodable mailbox entry"
                    );
                }
            },
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(
                    target = "signal_mailbox",
                    key = %key,
                    error = %err,
                    "redis mailbox read failed; reconnecting"
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
                match client.get_multiplexed_async_connection().await {
                    Ok(fresh) => conn = fresh,
                    Err(err) => {
                        tracing::debug!(target = "signal_mailbox", error = %err, "reconnect failed");
                    }
                }
            }
        }
    }
    tracing::debug!(target = "signal_mailbox", key = %key, "mailbox reader stopped");
}
