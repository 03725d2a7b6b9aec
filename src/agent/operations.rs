//! Outbound operations: direct requests, directory traffic and fan-out.

use super::{Agent, AgentContext};
use crate::codec::Value;
use crate::directory::{advertise_operation, discover_operation};
use crate::dispatch::{Job, Scope};
use crate::error::{AgentError, TaskError};
use crate::protocol::{Requester, RequesterState};
use crate::resource::ResourcePath;
use crate::scheduler::{Outcome, Step, Synapse, Verdict, RESULTS};
use crate::types::Address;
use rand::seq::SliceRandom;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Stops a [`keep_advertised`](Agent::keep_advertised) loop.
#[derive(Debug, Clone)]
pub struct AdvertiseHandle {
    active: Rc<Cell<bool>>,
}

impl AdvertiseHandle {
    pub fn stop(&self) {
        self.active.set(false);
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}

fn resource_values(resources: &[ResourcePath]) -> Value {
    Value::List(resources.iter().cloned().map(Value::Resource).collect())
}

fn directory(ctx: &AgentContext) -> Result<Address, AgentError> {
    ctx.settings()
        .directory
        .clone()
        .ok_or_else(|| AgentError::ConfigError("no directory configured".to_string()))
}

fn request(
    ctx: &AgentContext,
    target: Address,
    kind: ResourcePath,
    scope: Scope,
    args: BTreeMap<String, Value>,
) -> Result<Requester, AgentError> {
    let job = Job::new(kind, scope, ctx.address().clone(), target.clone()).with_args(args);
    Ok(Requester::start(ctx, target, &job)?)
}

/// Whole seconds for the wire, rounded up so only a zero TTL withdraws.
fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn advertise(ctx: &AgentContext, resources: &[ResourcePath], ttl: Duration) -> Result<Requester, AgentError> {
    let mut args = BTreeMap::new();
    args.insert("resources".to_string(), resource_values(resources));
    args.insert("ttl".to_string(), Value::Int(ttl_seconds(ttl)));
    request(ctx, directory(ctx)?, advertise_operation(), Scope::Direct, args)
}

/// Advertise now and schedule the next refresh at half the TTL.
fn readvertise(
    ctx: &AgentContext,
    resources: Rc<Vec<ResourcePath>>,
    ttl: Duration,
    active: Rc<Cell<bool>>,
) -> Result<Synapse, AgentError> {
    advertise(ctx, &resources, ttl)?;
    let due: Instant = ctx.queue().now() + ttl / 2;

    let clock_ctx = ctx.clone();
    let gate = Rc::clone(&active);
    let next_ctx = ctx.clone();
    let next = Synapse::new(format!("readvertise:{}", ctx.address()))
        .when(move |_| {
            if !gate.get() {
                Verdict::Fail
            } else if clock_ctx.queue().now() >= due {
                Verdict::Succeed
            } else {
                Verdict::Defer
            }
        })
        .then(move |_, _| match readvertise(&next_ctx, resources, ttl, active) {
            Ok(following) => Step::Await(following),
            Err(err) => {
                warn!(error = %err, "Re-advertisement stopped");
                Step::Done
            }
        });
    Ok(next)
}

impl Agent {
    /// Run one operation against one target.
    pub fn request(
        &self,
        target: Address,
        kind: ResourcePath,
        scope: Scope,
        args: BTreeMap<String, Value>,
    ) -> Result<Requester, AgentError> {
        request(&self.ctx, target, kind, scope, args)
    }

    /// Tell the directory this agent provides `resources` for `ttl`.
    pub fn advertise(&self, resources: &[ResourcePath], ttl: Duration) -> Result<Requester, AgentError> {
        advertise(&self.ctx, resources, ttl)
    }

    /// Advertise everything the dispatcher can serve.
    pub fn advertise_capabilities(&self, ttl: Duration) -> Result<Requester, AgentError> {
        let resources = self.ctx.dispatcher().advertised_resources();
        self.advertise(&resources, ttl)
    }

    /// Keep `resources` advertised, refreshing at half the TTL until the
    /// returned handle is stopped. A zero TTL withdraws once and returns an
    /// inactive handle.
    pub fn keep_advertised(
        &self,
        resources: Vec<ResourcePath>,
        ttl: Duration,
    ) -> Result<AdvertiseHandle, AgentError> {
        if ttl.is_zero() {
            self.advertise(&resources, ttl)?;
            return Ok(AdvertiseHandle {
                active: Rc::new(Cell::new(false)),
            });
        }
        let active = Rc::new(Cell::new(true));
        let next = readvertise(&self.ctx, Rc::new(resources), ttl, Rc::clone(&active))?;
        self.ctx.queue().enqueue(&next);
        info!(address = %self.address(), ttl_secs = ttl.as_secs(), "Keeping advertisements fresh");
        Ok(AdvertiseHandle { active })
    }

    /// Ask the directory who provides all of `resources`. Resolves with a
    /// list of address strings.
    pub fn discover(&self, resources: &[ResourcePath]) -> Result<Synapse, AgentError> {
        let mut args = BTreeMap::new();
        args.insert("resources".to_string(), resource_values(resources));
        let requester = request(
            &self.ctx,
            directory(&self.ctx)?,
            discover_operation(),
            Scope::Direct,
            args,
        )?;
        let label = format!("discover:{}", requester.token());
        Ok(self.ctx.queue().follow(label, &requester.completion(), |answers| {
            let addresses = answers
                .into_items()
                .into_iter()
                .filter_map(|answer| answer.as_struct().and_then(|map| map.get("addresses")).cloned())
                .flat_map(Value::into_items)
                .collect();
            Ok(Value::List(addresses))
        }))
    }

    /// Discover the providers of `kind` (and of every resource in `args`),
    /// then run the operation on one random provider (`single`) or all of
    /// them. Resolves with the concatenated results.
    pub fn perform(
        &self,
        kind: ResourcePath,
        scope: Scope,
        args: BTreeMap<String, Value>,
    ) -> Result<Synapse, AgentError> {
        let mut resources = vec![kind.clone()];
        resources.extend(args.values().flat_map(Value::resources));
        let discovery = self.discover(&resources)?;

        let ctx = self.ctx.clone();
        let mut requesters: Option<Vec<Requester>> = None;
        let task = Synapse::new(format!("perform:{}", kind)).when(move |task: &Synapse| {
            if requesters.is_none() {
                match discovery.outcome() {
                    Outcome::Pending => return Verdict::Defer,
                    Outcome::Failed(err) => {
                        task.stash_error(err);
                        return Verdict::Fail;
                    }
                    Outcome::Succeeded(found) => match fan_out(&ctx, &kind, scope, &args, found) {
                        Ok(started) => requesters = Some(started),
                        Err(err) => {
                            task.stash_error(err);
                            return Verdict::Fail;
                        }
                    },
                }
            }
            match &requesters {
                Some(running) => settle_fan_out(task, running, scope),
                None => Verdict::Defer,
            }
        });
        self.ctx.queue().enqueue(&task);
        Ok(task)
    }
}

fn fan_out(
    ctx: &AgentContext,
    kind: &ResourcePath,
    scope: Scope,
    args: &BTreeMap<String, Value>,
    found: Value,
) -> Result<Vec<Requester>, TaskError> {
    let mut targets: Vec<Address> = found
        .into_items()
        .iter()
        .filter_map(|v| v.as_str().map(Address::from))
        .collect();
    if scope == Scope::Single {
        let chosen = targets.choose(&mut rand::thread_rng()).cloned();
        targets = chosen.into_iter().collect();
    }
    debug!(operation = %kind, scope = %scope, targets = targets.len(), "Fanning out");

    targets
        .into_iter()
        .map(|target| {
            let job = Job::new(kind.clone(), scope, ctx.address().clone(), target.clone())
                .with_args(args.clone());
            Requester::start(ctx, target, &job).map_err(TaskError::Codec)
        })
        .collect()
}

fn settle_fan_out(task: &Synapse, requesters: &[Requester], scope: Scope) -> Verdict {
    if requesters.iter().any(|r| !r.is_done()) {
        return Verdict::Defer;
    }
    let mut results = Vec::new();
    for requester in requesters {
        match requester.state() {
            RequesterState::Commit => results.extend(requester.results()),
            _ if scope == Scope::Single => {
                let error = requester
                    .error()
                    .unwrap_or_else(|| TaskError::ConditionFailed(task.label()));
                task.set(RESULTS, Value::List(requester.results()));
                task.stash_error(error);
                return Verdict::Fail;
            }
            state => warn!(
                peer = %requester.target(),
                state = ?state,
                error = ?requester.error().map(|e| e.to_string()),
                "Dropping failed target"
            ),
        }
    }
    task.set(RESULTS, Value::List(results));
    Verdict::Succeed
}
