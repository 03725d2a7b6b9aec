//! Packet Memory
//!
//! In-flight outbound envelopes that still expect an acknowledgement, indexed
//! both by the peer they were sent to and by their correlation token. An ack
//! names the message it answers through `in_reply_to`, which is how inbound
//! acks find the requester or responder that owns them.

use crate::protocol::Envelope;
use crate::token::Token;
use crate::types::{Address, MessageId};
use std::collections::HashMap;

/// An envelope that was sent to `peer`
#[derive(Debug, Clone)]
pub struct Packet {
    pub peer: Address,
    pub envelope: Envelope,
}

#[derive(Debug, Default)]
pub struct PacketMemory {
    packets: HashMap<(Address, MessageId), Packet>,
    by_token: HashMap<Token, HashMap<MessageId, Address>>,
}

impl PacketMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&mut self, peer: Address, envelope: Envelope) {
        let message_id = envelope.message_id;
        self.by_token
            .entry(envelope.token.clone())
            .or_default()
            .insert(message_id, peer.clone());
        self.packets
            .insert((peer.clone(), message_id), Packet { peer, envelope });
    }

    pub fn by_address(&self, peer: &Address, message_id: MessageId) -> Option<&Packet> {
        self.packets.get(&(peer.clone(), message_id))
    }

    pub fn by_token(&self, token: &Token, message_id: MessageId) -> Option<&Packet> {
        let peer = self.by_token.get(token)?.get(&message_id)?;
        self.by_address(peer, message_id)
    }

    pub fn forget(&mut self, peer: &Address, message_id: MessageId) -> Option<Packet> {
        let packet = self.packets.remove(&(peer.clone(), message_id))?;
        if let Some(ids) = self.by_token.get_mut(&packet.envelope.token) {
            ids.remove(&message_id);
            if ids.is_empty() {
                self.by_token.remove(&packet.envelope.token);
            }
        }
        Some(packet)
    }

    /// Drop everything remembered under `token`. Returns the count.
    pub fn purge(&mut self, token: &Token) -> usize {
        let Some(ids) = self.by_token.remove(token) else {
            return 0;
        };
        ids.into_iter()
            .filter(|(message_id, peer)| self.packets.remove(&(peer.clone(), *message_id)).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
