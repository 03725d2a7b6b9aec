//! Per-agent shared state.
//!
//! One [`AgentContext`] owns everything the protocol state machines share:
//! transport, task queue, busy flags, correlation tables, packet memory and
//! the dispatcher. Handles are cheap clones; all mutation happens on the
//! agent's loop thread.

use crate::codec::{Codec, Value, WireTree};
use crate::dispatch::Dispatcher;
use crate::error::TransportError;
use crate::packet::PacketMemory;
use crate::protocol::{Envelope, EnvelopeKind, Requester, Responder};
use crate::scheduler::{Step, Synapse, TaskQueue, Verdict};
use crate::token::{InitiatorToken, Token};
use crate::transport::Transport;
use crate::types::{Address, MessageId};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

/// Settings the protocol machines read from the context
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub address: Address,
    pub directory: Option<Address>,
    pub authorizer: Option<Address>,
    pub operation_timeout: Duration,
    pub advertise_ttl: Duration,
}

struct ContextInner {
    settings: ProtocolSettings,
    codec: Codec,
    transport: Rc<dyn Transport>,
    queue: TaskQueue,
    busy: RefCell<HashSet<Address>>,
    requesters: RefCell<HashMap<InitiatorToken, Requester>>,
    responders: RefCell<HashMap<Token, Responder>>,
    packets: RefCell<PacketMemory>,
    dispatcher: RefCell<Dispatcher>,
    next_message: Cell<u64>,
}

#[derive(Clone)]
pub struct AgentContext {
    inner: Rc<ContextInner>,
}

impl AgentContext {
    pub fn new(
        settings: ProtocolSettings,
        codec: Codec,
        transport: Rc<dyn Transport>,
        queue: TaskQueue,
    ) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                settings,
                codec,
                transport,
                queue,
                busy: RefCell::new(HashSet::new()),
                requesters: RefCell::new(HashMap::new()),
                responders: RefCell::new(HashMap::new()),
                packets: RefCell::new(PacketMemory::new()),
                dispatcher: RefCell::new(Dispatcher::new()),
                next_message: Cell::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.inner.settings
    }

    pub fn address(&self) -> &Address {
        &self.inner.settings.address
    }

    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn is_usable(&self) -> bool {
        self.inner.transport.is_usable()
    }

    pub fn next_message_id(&self) -> MessageId {
        let id = self.inner.next_message.get();
        self.inner.next_message.set(id + 1);
        MessageId(id)
    }

    /// Build an envelope with a fresh message id.
    pub fn envelope(&self, kind: EnvelopeKind, token: Token, payload: WireTree) -> Envelope {
        Envelope::new(kind, token, self.next_message_id(), payload)
    }

    pub fn send(&self, to: &Address, envelope: Envelope) -> Result<(), TransportError> {
        debug!(
            peer = %to,
            kind = %envelope.kind,
            token = %envelope.token,
            message_id = %envelope.message_id,
            "Sending envelope"
        );
        self.inner.transport.send(to, envelope)
    }

    /// Send once the transport is usable. Returns the enqueued task.
    pub fn post(&self, to: Address, envelope: Envelope) -> Synapse {
        let ctx = self.clone();
        let task = Synapse::new(format!("post:{}:{}", envelope.kind, envelope.message_id))
            .when(move |_| {
                if ctx.is_usable() {
                    Verdict::Succeed
                } else {
                    Verdict::Defer
                }
            });
        let ctx = self.clone();
        let task = task.then(move |_, _| {
            let kind = envelope.kind;
            if let Err(err) = ctx.send(&to, envelope) {
                warn!(peer = %to, kind = %kind, error = %err, "Dropped outbound envelope");
            }
            Step::Done
        });
        self.inner.queue.enqueue(&task);
        task
    }

    /// Payload helper: encode `value`, falling back to nil on failure.
    pub fn encode_or_nil(&self, value: &Value) -> WireTree {
        match self.inner.codec.encode(value) {
            Ok(tree) => tree,
            Err(err) => {
                warn!(error = %err, "Payload not encodable, sending nil");
                WireTree::Null
            }
        }
    }

    pub fn is_busy(&self, address: &Address) -> bool {
        self.inner.busy.borrow().contains(address)
    }

    /// Returns false if the address was already busy.
    pub fn mark_busy(&self, address: &Address) -> bool {
        self.inner.busy.borrow_mut().insert(address.clone())
    }

    pub fn release_busy(&self, address: &Address) {
        self.inner.busy.borrow_mut().remove(address);
    }

    pub fn register_requester(&self, requester: &Requester) {
        self.inner
            .requesters
            .borrow_mut()
            .insert(requester.initiator(), requester.clone());
    }

    pub fn unregister_requester(&self, initiator: &InitiatorToken) {
        self.inner.requesters.borrow_mut().remove(initiator);
    }

    pub fn requester(&self, initiator: &InitiatorToken) -> Option<Requester> {
        self.inner.requesters.borrow().get(initiator).cloned()
    }

    pub fn register_responder(&self, responder: &Responder) {
        self.inner
            .responders
            .borrow_mut()
            .insert(responder.token(), responder.clone());
    }

    pub fn unregister_responder(&self, token: &Token) {
        self.inner.responders.borrow_mut().remove(token);
    }

    pub fn responder(&self, token: &Token) -> Option<Responder> {
        self.inner.responders.borrow().get(token).cloned()
    }

    /// Live (requesters, responders)
    pub fn active_operations(&self) -> (usize, usize) {
        (
            self.inner.requesters.borrow().len(),
            self.inner.responders.borrow().len(),
        )
    }

    pub fn packets(&self) -> Ref<'_, PacketMemory> {
        self.inner.packets.borrow()
    }

    pub fn packets_mut(&self) -> RefMut<'_, PacketMemory> {
        self.inner.packets.borrow_mut()
    }

    pub fn dispatcher(&self) -> Ref<'_, Dispatcher> {
        self.inner.dispatcher.borrow()
    }

    pub fn dispatcher_mut(&self) -> RefMut<'_, Dispatcher> {
        self.inner.dispatcher.borrow_mut()
    }

    /// Drop every table entry and queued task so reference cycles between
    /// tasks, machines and this context are broken.
    pub fn shutdown(&self) {
        self.inner.queue.clear();
        let requesters: Vec<Requester> =
            self.inner.requesters.borrow_mut().drain().map(|(_, r)| r).collect();
        let responders: Vec<Responder> =
            self.inner.responders.borrow_mut().drain().map(|(_, r)| r).collect();
        drop(requesters);
        drop(responders);
        *self.inner.packets.borrow_mut() = PacketMemory::new();
        self.inner.busy.borrow_mut().clear();
    }
}
