//! Peer-to-peer chat sessions between username-identified peers: signaling
//! over a shared mailbox, negotiation per peer, sealed text over a WebRTC
//! data channel.

pub mod config;
pub mod connection;
pub mod message;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::SessionConfig;
pub use connection::{ConnectionState, PeerSession};
pub use message::{MemoryMessageLog, MessageRecord, MessageSink};
pub use session::{EventSubscription, SessionError, SessionEvent, SessionRegistry};
