//! Responder side of an operation.
//!
//! `new -> verify -> producing -> flush -> {commit | error}`, or `denied` when
//! the authorizer refuses. Results are streamed as data envelopes; each one
//! stays in packet memory until the requester acknowledges it, and the final
//! envelope only goes out once nothing is outstanding.

use super::envelope::{Envelope, EnvelopeKind};
use super::requester::Requester;
use crate::agent::AgentContext;
use crate::codec::Value;
use crate::dispatch::{Dispatcher, Job, Scope};
use crate::error::{TaskError, TokenError};
use crate::packet::Packet;
use crate::resource::ResourcePath;
use crate::scheduler::{Step, Synapse, Verdict};
use crate::token::Token;
use crate::types::Address;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

/// Answer an authorizer gives to let an operation through
pub const AUTHORIZED: &str = "authorized";
/// Answer an authorizer gives to refuse an operation
pub const NOT_AUTHORIZED: &str = "notauthorized";

/// Operation path of authorization checks
pub fn authorize_operation() -> ResourcePath {
    ResourcePath::from_static(&["authorize"])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    New,
    Verify,
    Producing,
    Flush,
    Commit,
    Denied,
    Error,
}

impl ResponderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponderState::Commit | ResponderState::Denied | ResponderState::Error
        )
    }
}

struct ResponderInner {
    state: ResponderState,
    token: Token,
    peer: Address,
    outstanding: usize,
    dispatched: bool,
    sent: usize,
}

/// One inbound operation from one requester
#[derive(Clone)]
pub struct Responder {
    inner: Rc<RefCell<ResponderInner>>,
    ctx: AgentContext,
}

struct WeakResponder {
    inner: Weak<RefCell<ResponderInner>>,
    ctx: AgentContext,
}

impl WeakResponder {
    fn upgrade(&self) -> Option<Responder> {
        Some(Responder {
            inner: self.inner.upgrade()?,
            ctx: self.ctx.clone(),
        })
    }
}

impl Responder {
    /// Take on the operation announced by `init`: extend its token,
    /// acknowledge it, then verify and produce.
    pub fn accept(ctx: &AgentContext, from: Address, init: &Envelope) -> Result<Responder, TokenError> {
        let token = init.token.extend()?;
        let responder = Responder {
            inner: Rc::new(RefCell::new(ResponderInner {
                state: ResponderState::New,
                token: token.clone(),
                peer: from.clone(),
                outstanding: 0,
                dispatched: false,
                sent: 0,
            })),
            ctx: ctx.clone(),
        };
        ctx.register_responder(&responder);

        let ack = ctx
            .envelope(EnvelopeKind::Ack, token.clone(), init.payload.clone())
            .replying_to(init.message_id);
        ctx.post(from.clone(), ack);
        responder.set_state(ResponderState::Verify);
        debug!(token = %token, peer = %from, "Responder verifying");

        match Job::from_wire(ctx.codec(), token, &init.payload) {
            Ok(mut job) => {
                job.origin = from;
                job.target = ctx.address().clone();
                responder.verify(job);
            }
            Err(err) => responder.abort(TaskError::Codec(err)),
        }
        Ok(responder)
    }

    fn downgrade(&self) -> WeakResponder {
        WeakResponder {
            inner: Rc::downgrade(&self.inner),
            ctx: self.ctx.clone(),
        }
    }

    pub fn state(&self) -> ResponderState {
        self.inner.borrow().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn token(&self) -> Token {
        self.inner.borrow().token.clone()
    }

    pub fn peer(&self) -> Address {
        self.inner.borrow().peer.clone()
    }

    /// Data envelopes sent but not yet acknowledged
    pub fn outstanding(&self) -> usize {
        self.inner.borrow().outstanding
    }

    fn set_state(&self, state: ResponderState) {
        self.inner.borrow_mut().state = state;
    }

    fn verify(&self, job: Job) {
        let own = self.ctx.address().clone();
        let authorizer = self
            .ctx
            .settings()
            .authorizer
            .clone()
            .filter(|authorizer| *authorizer != own);
        let Some(authorizer) = authorizer else {
            self.produce(job);
            return;
        };

        let resources: Vec<Value> = job.resources().into_iter().map(Value::Resource).collect();
        let check = Job::new(authorize_operation(), Scope::Direct, own.clone(), authorizer.clone())
            .arg("requester", job.origin.as_str())
            .arg("responder", own.as_str())
            .arg("operation", Value::Resource(job.kind.clone()))
            .arg("resources", resources);

        let requester = match Requester::start(&self.ctx, authorizer, &check) {
            Ok(requester) => requester,
            Err(err) => {
                self.deny(format!("authorization request failed: {}", err));
                return;
            }
        };

        let on_answer = self.clone();
        let on_failure = self.clone();
        requester.completion().on_settled(
            move |_, answer| {
                let granted = answer
                    .clone()
                    .into_items()
                    .first()
                    .and_then(|v| v.as_str().map(|s| s == AUTHORIZED))
                    .unwrap_or(false);
                if granted {
                    on_answer.produce(job);
                } else {
                    on_answer.deny(format!("{} may not run {}", job.origin, job.kind));
                }
                Step::Done
            },
            move |_, err| {
                on_failure.deny(err.to_string());
                Step::Done
            },
        );
    }

    /// Refuse the operation: exactly one nack, then terminal.
    fn deny(&self, reason: String) {
        if self.state() != ResponderState::Verify {
            return;
        }
        self.set_state(ResponderState::Denied);
        let (token, peer) = {
            let inner = self.inner.borrow();
            (inner.token.clone(), inner.peer.clone())
        };
        let payload = self.ctx.encode_or_nil(&Value::String(reason.clone()));
        let nack = self.ctx.envelope(EnvelopeKind::Nack, token.clone(), payload);
        self.ctx.post(peer.clone(), nack);
        info!(token = %token, peer = %peer, reason = %reason, "Operation denied");
        self.release();
    }

    fn produce(&self, job: Job) {
        if self.state() != ResponderState::Verify {
            return;
        }
        self.set_state(ResponderState::Producing);

        let sink = self.downgrade();
        let job = job.with_emitter(Rc::new(move |value| {
            if let Some(responder) = sink.upgrade() {
                responder.emit(value);
            }
        }));
        let candidates = self.ctx.dispatcher().candidates(&job.kind, &job.args);
        debug!(
            token = %job.token,
            operation = %job.kind,
            scope = %job.scope,
            candidates = candidates.len(),
            "Dispatching"
        );
        let gatherer = Dispatcher::gather(&job, candidates, self.ctx.queue());

        let on_results = self.clone();
        let on_failure = self.clone();
        gatherer.on_settled(
            move |_, results| {
                for item in results.clone().into_items() {
                    on_results.emit(item);
                }
                on_results.inner.borrow_mut().dispatched = true;
                Step::Done
            },
            move |gatherer, err| {
                // Whatever the other handlers produced still goes out ahead of the fault.
                for item in gatherer.results().map(Value::into_items).unwrap_or_default() {
                    on_failure.emit(item);
                }
                on_failure.abort(err.clone());
                Step::Done
            },
        );

        let gate = self.downgrade();
        let flusher = self.clone();
        let flush = Synapse::new(format!("flush:{}", job.token))
            .when(move |_| match gate.upgrade() {
                Some(responder) => responder.flush_verdict(),
                None => Verdict::Fail,
            })
            .then(move |_, _| {
                flusher.send_final();
                Step::Done
            });
        self.ctx.queue().enqueue(&flush);
    }

    /// Send one result as a data envelope.
    fn emit(&self, value: Value) {
        if self.state() != ResponderState::Producing {
            debug!(token = %self.token(), "Dropping result emitted outside production");
            return;
        }
        let payload = match self.ctx.codec().encode(&value) {
            Ok(payload) => payload,
            Err(err) => {
                self.abort(TaskError::Codec(err));
                return;
            }
        };
        let (token, peer) = {
            let mut inner = self.inner.borrow_mut();
            inner.outstanding += 1;
            inner.sent += 1;
            (inner.token.clone(), inner.peer.clone())
        };
        let data = self.ctx.envelope(EnvelopeKind::Data, token, payload);
        self.ctx.packets_mut().remember(peer.clone(), data.clone());
        self.ctx.post(peer, data);
    }

    fn flush_verdict(&self) -> Verdict {
        let inner = self.inner.borrow();
        match inner.state {
            ResponderState::Producing if inner.dispatched && inner.outstanding == 0 => {
                Verdict::Succeed
            }
            ResponderState::Producing => Verdict::Defer,
            _ => Verdict::Fail,
        }
    }

    fn send_final(&self) {
        let (token, peer, sent) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = ResponderState::Flush;
            (inner.token.clone(), inner.peer.clone(), inner.sent)
        };
        let payload = self.ctx.encode_or_nil(&Value::Nil);
        let envelope = self.ctx.envelope(EnvelopeKind::Final, token.clone(), payload);
        self.ctx.packets_mut().remember(peer.clone(), envelope.clone());
        self.ctx.post(peer, envelope);
        debug!(token = %token, sent, "Responder flushing");
    }

    /// The requester acknowledged one of our packets.
    pub fn acknowledged(&self, packet: &Packet) {
        self.ctx
            .packets_mut()
            .forget(&packet.peer, packet.envelope.message_id);
        match (packet.envelope.kind, self.state()) {
            (EnvelopeKind::Data, _) => {
                let mut inner = self.inner.borrow_mut();
                inner.outstanding = inner.outstanding.saturating_sub(1);
            }
            (EnvelopeKind::Final, ResponderState::Flush) => {
                self.set_state(ResponderState::Commit);
                info!(token = %self.token(), peer = %self.peer(), "Operation served");
                self.release();
            }
            (kind, state) => {
                debug!(kind = %kind, state = ?state, "Ignoring acknowledgement");
            }
        }
    }

    /// Report `error` to the requester and stop.
    fn abort(&self, error: TaskError) {
        if self.is_done() {
            return;
        }
        self.set_state(ResponderState::Error);
        let (token, peer) = {
            let inner = self.inner.borrow();
            (inner.token.clone(), inner.peer.clone())
        };
        let payload = self.ctx.encode_or_nil(&Value::Fault(error.to_fault()));
        let envelope = self.ctx.envelope(EnvelopeKind::Error, token.clone(), payload);
        self.ctx.post(peer.clone(), envelope);
        warn!(token = %token, peer = %peer, error = %error, "Operation aborted");
        self.release();
    }

    fn release(&self) {
        let token = self.token();
        self.ctx.unregister_responder(&token);
        self.ctx.packets_mut().purge(&token);
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Responder")
            .field("state", &inner.state)
            .field("token", &inner.token)
            .field("peer", &inner.peer)
            .field("outstanding", &inner.outstanding)
            .finish()
    }
}
