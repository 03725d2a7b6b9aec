//! Request/response protocol.
//!
//! One logical operation is a handshake between a [`Requester`] and a
//! [`Responder`]: init, ack, a stream of data, then final (or nack / error).
//! [`deliver`] routes each inbound envelope to the machine that owns it.

mod envelope;
mod requester;
mod responder;

pub use envelope::{Envelope, EnvelopeKind};
pub use requester::{Requester, RequesterState};
pub use responder::{authorize_operation, Responder, ResponderState, AUTHORIZED, NOT_AUTHORIZED};

use crate::agent::AgentContext;
use crate::transport::Inbound;
use crate::types::Address;
use tracing::{debug, warn};

/// Hand one inbound envelope to its requester or responder.
pub fn deliver(ctx: &AgentContext, inbound: Inbound) {
    let Inbound { from, envelope } = inbound;
    debug!(
        peer = %from,
        kind = %envelope.kind,
        token = %envelope.token,
        message_id = %envelope.message_id,
        "Received envelope"
    );

    match envelope.kind {
        EnvelopeKind::Init => {
            if let Err(err) = Responder::accept(ctx, from.clone(), &envelope) {
                warn!(peer = %from, error = %err, "Rejected init");
            }
        }
        EnvelopeKind::Ack => deliver_ack(ctx, &from, &envelope),
        EnvelopeKind::Nack | EnvelopeKind::Data | EnvelopeKind::Final | EnvelopeKind::Error => {
            match ctx.requester(envelope.token.initiator()) {
                Some(requester) => requester.handle(&from, &envelope),
                None => warn!(
                    peer = %from,
                    kind = %envelope.kind,
                    token = %envelope.token,
                    "No requester for envelope"
                ),
            }
        }
    }
}

/// Acks name the packet they answer; the packet says who is waiting.
fn deliver_ack(ctx: &AgentContext, from: &Address, envelope: &Envelope) {
    let Some(reply_to) = envelope.in_reply_to else {
        warn!(peer = %from, token = %envelope.token, "Acknowledgement without in_reply_to");
        return;
    };
    let packet = {
        let packets = ctx.packets();
        packets
            .by_address(from, reply_to)
            .or_else(|| packets.by_token(&envelope.token, reply_to))
            .cloned()
    };
    let Some(packet) = packet else {
        debug!(peer = %from, message_id = %reply_to, "Acknowledgement for unknown packet");
        return;
    };

    match packet.envelope.kind {
        EnvelopeKind::Init => match ctx.requester(packet.envelope.token.initiator()) {
            Some(requester) => requester.handle(from, envelope),
            None => debug!(token = %packet.envelope.token, "Acknowledged requester is gone"),
        },
        EnvelopeKind::Data | EnvelopeKind::Final => match ctx.responder(&packet.envelope.token) {
            Some(responder) => responder.acknowledged(&packet),
            None => debug!(token = %packet.envelope.token, "Acknowledged responder is gone"),
        },
        other => debug!(kind = %other, "Acknowledgement for non-acknowledgeable packet"),
    }
}
