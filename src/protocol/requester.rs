//! Requester side of an operation.
//!
//! `new -> ready -> consume -> {commit | authfail | error}`. Every transition
//! is driven either by a scheduled task or by an inbound envelope routed here
//! by the agent.

use super::envelope::{Envelope, EnvelopeKind};
use crate::agent::AgentContext;
use crate::codec::{Fault, Value, WireTree};
use crate::dispatch::Job;
use crate::error::{CodecError, TaskError};
use crate::resource::ResourcePath;
use crate::scheduler::{Step, Synapse, Verdict, RESULTS};
use crate::token::{InitiatorToken, Token};
use crate::types::Address;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterState {
    New,
    Ready,
    Consume,
    Commit,
    AuthFail,
    Error,
}

impl RequesterState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequesterState::Commit | RequesterState::AuthFail | RequesterState::Error
        )
    }
}

struct RequesterInner {
    state: RequesterState,
    token: Token,
    target: Address,
    kind: ResourcePath,
    payload: WireTree,
    results: Vec<Value>,
    error: Option<TaskError>,
    holds_busy: bool,
    completion: Synapse,
}

/// One outbound operation to one target
#[derive(Clone)]
pub struct Requester {
    inner: Rc<RefCell<RequesterInner>>,
    ctx: AgentContext,
}

struct WeakRequester {
    inner: Weak<RefCell<RequesterInner>>,
    ctx: AgentContext,
}

impl WeakRequester {
    fn upgrade(&self) -> Option<Requester> {
        Some(Requester {
            inner: self.inner.upgrade()?,
            ctx: self.ctx.clone(),
        })
    }
}

impl Requester {
    /// Schedule `job` against `target`. The announcement goes out once the
    /// transport is usable and no other operation holds the target.
    pub fn start(ctx: &AgentContext, target: Address, job: &Job) -> Result<Requester, CodecError> {
        let payload = job.to_wire(ctx.codec())?;
        let token = job.token.initiator_only();
        let requester = Requester {
            inner: Rc::new(RefCell::new(RequesterInner {
                state: RequesterState::New,
                token: token.clone(),
                target: target.clone(),
                kind: job.kind.clone(),
                payload,
                results: Vec::new(),
                error: None,
                holds_busy: false,
                completion: Synapse::new(format!("request:{}", token)),
            })),
            ctx: ctx.clone(),
        };

        let on_timeout = requester.downgrade();
        requester
            .completion()
            // Settled by `finish`; while queued it only carries the timeout.
            .when(|_: &Synapse| Verdict::Defer)
            .with_timeout(ctx.settings().operation_timeout)
            .otherwise(move |_, err| {
                if let Some(requester) = on_timeout.upgrade() {
                    if !requester.is_done() {
                        requester.finish(RequesterState::Error, Some(err.clone()));
                    }
                }
                Step::Done
            });

        let busy_check = (ctx.clone(), target);
        let usable_check = ctx.clone();
        let state_check = requester.downgrade();
        let initiator = requester.clone();
        let initiate = Synapse::new(format!("initiate:{}", token))
            .when(move |_| {
                let (ctx, target) = &busy_check;
                if ctx.is_busy(target) {
                    Verdict::Defer
                } else {
                    Verdict::Succeed
                }
            })
            .when(move |_| {
                if usable_check.is_usable() {
                    Verdict::Succeed
                } else {
                    Verdict::Defer
                }
            })
            .when(move |_| {
                let state = state_check.upgrade().map(|r| r.state());
                Verdict::from(state == Some(RequesterState::New))
            })
            .then(move |_, _| {
                initiator.initiate();
                Step::Done
            });

        ctx.queue().enqueue(&initiate);
        ctx.queue().enqueue(&requester.completion());
        debug!(token = %token, peer = %requester.target(), "Requester scheduled");
        Ok(requester)
    }

    fn downgrade(&self) -> WeakRequester {
        WeakRequester {
            inner: Rc::downgrade(&self.inner),
            ctx: self.ctx.clone(),
        }
    }

    pub fn state(&self) -> RequesterState {
        self.inner.borrow().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Current token; carries the responder half once acknowledged.
    pub fn token(&self) -> Token {
        self.inner.borrow().token.clone()
    }

    pub fn initiator(&self) -> InitiatorToken {
        self.inner.borrow().token.initiator().clone()
    }

    pub fn target(&self) -> Address {
        self.inner.borrow().target.clone()
    }

    pub fn kind(&self) -> ResourcePath {
        self.inner.borrow().kind.clone()
    }

    /// Results received so far; partial when the operation failed.
    pub fn results(&self) -> Vec<Value> {
        self.inner.borrow().results.clone()
    }

    pub fn error(&self) -> Option<TaskError> {
        self.inner.borrow().error.clone()
    }

    /// Resolves with the result list on commit and fails with the captured
    /// error otherwise. Carries the operation timeout.
    pub fn completion(&self) -> Synapse {
        self.inner.borrow().completion.clone()
    }

    fn initiate(&self) {
        let (token, target, payload) = {
            let inner = self.inner.borrow();
            (inner.token.clone(), inner.target.clone(), inner.payload.clone())
        };
        self.ctx.mark_busy(&target);
        let envelope = self.ctx.envelope(EnvelopeKind::Init, token.clone(), payload);
        self.ctx
            .packets_mut()
            .remember(target.clone(), envelope.clone());
        {
            let mut inner = self.inner.borrow_mut();
            inner.holds_busy = true;
            inner.state = RequesterState::Ready;
        }
        self.ctx.register_requester(self);
        debug!(token = %token, peer = %target, "Requester ready");

        if let Err(err) = self.ctx.send(&target, envelope) {
            self.finish(RequesterState::Error, Some(TaskError::Transport(err)));
        }
    }

    /// Apply an inbound envelope from the target.
    pub fn handle(&self, from: &Address, envelope: &Envelope) {
        let (state, target) = {
            let inner = self.inner.borrow();
            (inner.state, inner.target.clone())
        };
        if *from != target {
            warn!(peer = %from, expected = %target, kind = %envelope.kind, "Envelope from unexpected peer");
            return;
        }

        match (envelope.kind, state) {
            (EnvelopeKind::Ack, RequesterState::Ready) => self.accept_ack(envelope),
            // The responder acknowledges before it verifies, so a refusal
            // usually lands after the acknowledgement.
            (EnvelopeKind::Nack, RequesterState::Ready | RequesterState::Consume) => {
                let reason = self.decode_text(&envelope.payload);
                self.finish(
                    RequesterState::AuthFail,
                    Some(TaskError::AuthorizationDenied(reason)),
                );
            }
            (EnvelopeKind::Data, RequesterState::Consume) => {
                match self.ctx.codec().decode(&envelope.payload) {
                    Ok(value) => self.inner.borrow_mut().results.push(value),
                    Err(err) => self.finish(RequesterState::Error, Some(TaskError::Codec(err))),
                }
                self.acknowledge(envelope);
            }
            (EnvelopeKind::Error, RequesterState::Consume) => {
                let fault = match self.ctx.codec().decode(&envelope.payload) {
                    Ok(Value::Fault(fault)) => fault,
                    Ok(other) => Fault::new("RemoteError", format!("{:?}", other)),
                    Err(err) => Fault::new("RemoteError", err.to_string()),
                };
                self.finish(RequesterState::Error, Some(TaskError::Remote(fault)));
                self.acknowledge(envelope);
            }
            (EnvelopeKind::Final, RequesterState::Consume) => {
                self.finish(RequesterState::Commit, None);
                self.acknowledge(envelope);
            }
            (kind, state) => {
                debug!(kind = %kind, state = ?state, token = %self.token(), "Ignoring envelope");
            }
        }
    }

    fn accept_ack(&self, envelope: &Envelope) {
        let Some(responder) = envelope.token.responder() else {
            warn!(token = %envelope.token, "Acknowledgement without responder token");
            return;
        };
        let extended = self.inner.borrow().token.extend_with(responder.clone());
        match extended {
            Ok(token) => {
                debug!(token = %token, "Requester consuming");
                let mut inner = self.inner.borrow_mut();
                inner.token = token;
                inner.state = RequesterState::Consume;
            }
            Err(err) => warn!(error = %err, "Duplicate acknowledgement"),
        }
    }

    fn acknowledge(&self, envelope: &Envelope) {
        let (token, target) = {
            let inner = self.inner.borrow();
            (inner.token.clone(), inner.target.clone())
        };
        let payload = self.ctx.encode_or_nil(&Value::Nil);
        let ack = self
            .ctx
            .envelope(EnvelopeKind::Ack, token, payload)
            .replying_to(envelope.message_id);
        self.ctx.post(target, ack);
    }

    fn decode_text(&self, payload: &WireTree) -> String {
        match self.ctx.codec().decode(payload) {
            Ok(Value::String(text)) => text,
            Ok(Value::Fault(fault)) => fault.to_string(),
            Ok(other) => format!("{:?}", other),
            Err(err) => err.to_string(),
        }
    }

    /// Enter a terminal state and release everything the operation held.
    fn finish(&self, state: RequesterState, error: Option<TaskError>) {
        let (token, target, held_busy, completion, outcome) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = state;
            if error.is_some() {
                inner.error = error;
            }
            let held_busy = std::mem::take(&mut inner.holds_busy);
            let results = Value::List(inner.results.clone());
            let outcome = match state {
                RequesterState::Commit => Ok(results),
                _ => {
                    inner.completion.set(RESULTS, results);
                    Err(inner
                        .error
                        .clone()
                        .unwrap_or_else(|| TaskError::ConditionFailed(inner.completion.label())))
                }
            };
            (
                inner.token.clone(),
                inner.target.clone(),
                held_busy,
                inner.completion.clone(),
                outcome,
            )
        };

        self.ctx.unregister_requester(token.initiator());
        let purged = self.ctx.packets_mut().purge(&token.initiator_only());
        if held_busy {
            self.ctx.release_busy(&target);
        }
        completion.cancel_timeout();

        match state {
            RequesterState::Commit => {
                info!(token = %token, peer = %target, results = self.inner.borrow().results.len(), "Operation committed")
            }
            _ => warn!(
                token = %token,
                peer = %target,
                state = ?state,
                error = ?self.error().map(|e| e.to_string()),
                purged,
                "Operation failed"
            ),
        }

        // A timeout has already settled the completion by the time it lands here.
        if completion.is_pending() {
            if let Err(err) = self.ctx.queue().settle(&completion, outcome) {
                warn!(token = %token, error = %err, "Completion already settled");
            }
        }
    }
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Requester")
            .field("state", &inner.state)
            .field("token", &inner.token)
            .field("target", &inner.target)
            .field("results", &inner.results.len())
            .finish()
    }
}
