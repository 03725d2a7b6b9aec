//! Shared harness: a loopback network, a manual clock and scripted peers.

use ganglion::agent::{pump, Agent};
use ganglion::clock::ManualClock;
use ganglion::codec::{Codec, Value, WireTree};
use ganglion::config::AgentConfig;
use ganglion::protocol::{Envelope, EnvelopeKind};
use ganglion::resource::ResourcePath;
use ganglion::token::Token;
use ganglion::transport::{Inbound, Inbox, LoopbackNetwork, LoopbackTransport, Transport};
use ganglion::types::{Address, MessageId};
use std::cell::Cell;
use std::rc::Rc;

pub struct Harness {
    pub network: LoopbackNetwork,
    pub clock: Rc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            network: LoopbackNetwork::new(),
            clock: Rc::new(ManualClock::new()),
        }
    }

    pub fn agent(&self, config: AgentConfig) -> Agent {
        let address = config.address.clone().expect("test agents need an address");
        let (transport, inbox) = self.network.connect(address);
        Agent::new(&config, Rc::new(transport), inbox, self.clock.clone()).unwrap()
    }

    pub fn peer(&self, address: &str) -> ScriptedPeer {
        let (transport, inbox) = self.network.connect(address);
        ScriptedPeer {
            address: Address::from(address),
            transport,
            inbox,
            next: Cell::new(1),
        }
    }
}

/// Pump until nothing moves.
pub fn settle(agents: &[&Agent]) {
    for _ in 0..1000 {
        if !pump(agents) {
            return;
        }
    }
    panic!("agents never went quiet");
}

pub fn path(text: &str) -> ResourcePath {
    ResourcePath::parse(text).unwrap()
}

pub fn wire(value: impl Into<Value>) -> WireTree {
    Codec::default().encode(&value.into()).unwrap()
}

pub fn unwire(tree: &WireTree) -> Value {
    Codec::default().decode(tree).unwrap()
}

/// A hand-driven endpoint that speaks raw envelopes.
pub struct ScriptedPeer {
    pub address: Address,
    transport: LoopbackTransport,
    inbox: Inbox,
    next: Cell<u64>,
}

impl ScriptedPeer {
    pub fn send(
        &self,
        to: &Address,
        kind: EnvelopeKind,
        token: &Token,
        payload: WireTree,
        in_reply_to: Option<MessageId>,
    ) -> MessageId {
        let id = MessageId(self.next.get());
        self.next.set(id.0 + 1);
        let mut envelope = Envelope::new(kind, token.clone(), id, payload);
        if let Some(reply) = in_reply_to {
            envelope = envelope.replying_to(reply);
        }
        self.transport.send(to, envelope).unwrap();
        id
    }

    pub fn ack(&self, to: &Address, token: &Token, packet: &Envelope) -> MessageId {
        self.send(to, EnvelopeKind::Ack, token, wire(Value::Nil), Some(packet.message_id))
    }

    pub fn drain(&self) -> Vec<Inbound> {
        self.inbox.try_iter().collect()
    }

    pub fn kinds(received: &[Inbound]) -> Vec<EnvelopeKind> {
        received.iter().map(|inbound| inbound.envelope.kind).collect()
    }
}
