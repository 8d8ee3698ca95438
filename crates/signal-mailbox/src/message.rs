use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::MailboxError;

/// Handshake step carried by a [`SignalingMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "OFFER",
            SignalKind::Answer => "ANSWER",
            SignalKind::Ice => "ICE",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One handshake message addressed to `target`'s mailbox.
///
/// For `OFFER`/`ANSWER` the payload is the raw session description; for `ICE`
/// it is the comma-joined triple produced by [`IceCandidate::to_payload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub kind: SignalKind,
    pub sender: String,
    pub target: String,
    pub payload: String,
}

impl SignalingMessage {
    pub fn new(
        kind: SignalKind,
        sender: impl Into<String>,
        target: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender: sender.into(),
            target: target.into(),
            payload: payload.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, MailboxError> {
        serde_json::to_string(self).map_err(|err| MailboxError::Serialization(err.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, MailboxError> {
        serde_json::from_str(text).map_err(|err| MailboxError::Serialization(err.to_string()))
    }
}

/// ICE candidate descriptor as exchanged through the mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
        }
    }

    /// Encodes as `sdpFragment,sdpMid,sdpMLineIndex`.
    pub fn to_payload(&self) -> String {
        format!("{},{},{}", self.candidate, self.sdp_mid, self.sdp_mline_index)
    }

    /// Parses the comma-joined triple. Anything other than exactly three
    /// fields, or a non-numeric line index, is rejected.
    pub fn from_payload(payload: &str) -> Result<Self, MailboxError> {
        let fields: Vec<&str> = payload.split(',').collect();
        let [candidate, sdp_mid, index] = fields.as_slice() else {
            return Err(MailboxError::MalformedSignaling(format!(
                "expected 3 ice fields, got {}",
                fields.len()
            )));
        };
        if candidate.is_empty() {
            return Err(MailboxError::MalformedSignaling(
                "empty ice candidate".into(),
            ));
        }
        let sdp_mline_index = index.trim().parse::<u16>().map_err(|err| {
            MailboxError::MalformedSignaling(format!("invalid m-line index {index:?}: {err}"))
        })?;
        Ok(Self {
            candidate: (*candidate).to_string(),
            sdp_mid: (*sdp_mid).to_string(),
            sdp_mline_index,
        })
    }
}

impl FromStr for IceCandidate {
    type Err = MailboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_payload(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "candidate:842163049 1 udp 1677729535 192.168.1.7 50214 typ host generation 0";

    #[test]
    fn ice_payload_parses_three_fields() {
        let parsed = IceCandidate::from_payload(&format!("{HOST},0,0")).expect("valid payload");
        assert_eq!(parsed.candidate, HOST);
        assert_eq!(parsed.sdp_mid, "0");
        assert_eq!(parsed.sdp_mline_index, 0);
        assert_eq!(parsed.to_payload(), format!("{HOST},0,0"));
    }

    #[test]
    fn ice_payload_rejects_wrong_field_count() {
        for bad in ["", "only-one", "a,b", "a,b,1,extra"] {
            let err = IceCandidate::from_payload(bad).unwrap_err();
            assert!(matches!(err, MailboxError::MalformedSignaling(_)), "{bad:?}");
        }
    }

    #[test]
    fn ice_payload_rejects_non_numeric_index() {
        let err = IceCandidate::from_payload("candidate:1,data,abc").unwrap_err();
        assert!(matches!(err, MailboxError::MalformedSignaling(_)));
    }

    #[test]
    fn signaling_message_json_uses_upper_case_kind() {
        let message = SignalingMessage::new(SignalKind::Answer, "bob", "alice", "v=0");
        let json = message.to_json().unwrap();
        assert!(json.contains("\"kind\":\"ANSWER\""), "{json}");
        assert_eq!(SignalingMessage::from_json(&json).unwrap(), message);
    }
}
