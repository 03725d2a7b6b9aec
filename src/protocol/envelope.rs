//! Protocol envelopes: the unit a transport carries between agents.

use crate::codec::WireTree;
use crate::error::TransportError;
use crate::token::Token;
use crate::types::MessageId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Init,
    Ack,
    Nack,
    Data,
    Final,
    Error,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Init => "init",
            EnvelopeKind::Ack => "ack",
            EnvelopeKind::Nack => "nack",
            EnvelopeKind::Data => "data",
            EnvelopeKind::Final => "final",
            EnvelopeKind::Error => "error",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub token: Token,
    pub message_id: MessageId,
    /// Id of the message this one acknowledges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
    #[serde(default)]
    pub payload: WireTree,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, token: Token, message_id: MessageId, payload: WireTree) -> Self {
        Self {
            kind,
            token,
            message_id,
            in_reply_to: None,
            payload,
        }
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.in_reply_to = Some(message_id);
        self
    }

    /// JSON frame for byte-oriented transports.
    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Frame(e.to_string()))
    }

    pub fn from_json(frame: &str) -> Result<Self, TransportError> {
        serde_json::from_str(frame).map_err(|e| TransportError::Frame(e.to_string()))
    }
}
