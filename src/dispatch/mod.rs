//! Dispatcher / Capability Router
//!
//! Capabilities are registered against an operation path and declare the
//! resources they provide. A request reaches every capability bound to its
//! operation whose resources cover the resources named in its arguments; the
//! per-handler outcomes are gathered through the scheduler into one list.
//! With `all` or `direct` scope a failing handler does not stop its siblings,
//! but the gatherer fails with its error once everyone is done; the sibling
//! results stay under `results` on the gatherer.

mod job;

pub use job::{Emitter, Job, Scope};

use crate::codec::Value;
use crate::error::{DispatchError, TaskError};
use crate::resource::ResourcePath;
use crate::scheduler::{Step, Synapse, TaskQueue, Verdict, ERROR, RESULTS};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, warn};

/// What a handler produced for one invocation
pub enum HandlerOutput {
    Value(Value),
    /// Nothing beyond any streamed fragments
    Empty,
    /// Finishes later; a non-nil success value is appended to the results
    Deferred(Synapse),
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        HandlerOutput::Value(value)
    }
}

/// A locally provided operation handler
pub trait Capability {
    fn name(&self) -> &str;

    /// Resources this handler can act on; `/` covers everything.
    fn provides(&self) -> &[ResourcePath];

    fn invoke(&self, job: &Job) -> Result<HandlerOutput, DispatchError>;
}

/// Closure-backed [`Capability`]
pub struct FnCapability<F> {
    name: String,
    provides: Vec<ResourcePath>,
    handler: F,
}

impl<F> FnCapability<F>
where
    F: Fn(&Job) -> Result<HandlerOutput, DispatchError>,
{
    pub fn new(name: impl Into<String>, provides: Vec<ResourcePath>, handler: F) -> Self {
        Self {
            name: name.into(),
            provides,
            handler,
        }
    }
}

impl<F> Capability for FnCapability<F>
where
    F: Fn(&Job) -> Result<HandlerOutput, DispatchError>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> &[ResourcePath] {
        &self.provides
    }

    fn invoke(&self, job: &Job) -> Result<HandlerOutput, DispatchError> {
        (self.handler)(job)
    }
}

/// Operation path -> registered capabilities
#[derive(Default)]
pub struct Dispatcher {
    routes: HashMap<ResourcePath, Vec<Rc<dyn Capability>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: ResourcePath, capability: Rc<dyn Capability>) {
        debug!(operation = %operation, capability = capability.name(), "Capability registered");
        self.routes.entry(operation).or_default().push(capability);
    }

    pub fn register_fn<F>(
        &mut self,
        operation: ResourcePath,
        name: impl Into<String>,
        provides: Vec<ResourcePath>,
        handler: F,
    ) where
        F: Fn(&Job) -> Result<HandlerOutput, DispatchError> + 'static,
    {
        self.register(operation, Rc::new(FnCapability::new(name, provides, handler)));
    }

    /// Registered operation paths, sorted.
    pub fn operations(&self) -> Vec<ResourcePath> {
        let mut operations: Vec<ResourcePath> = self.routes.keys().cloned().collect();
        operations.sort_by_key(|path| path.to_string());
        operations
    }

    /// Operation paths plus every provided resource, deduplicated. This is
    /// what an agent advertises to the directory.
    pub fn advertised_resources(&self) -> Vec<ResourcePath> {
        let mut resources = self.operations();
        for capabilities in self.routes.values() {
            for capability in capabilities {
                for resource in capability.provides() {
                    if !resource.is_root() && !resources.contains(resource) {
                        resources.push(resource.clone());
                    }
                }
            }
        }
        resources
    }

    /// Capabilities bound to exactly `operation` that cover every resource
    /// value in `args`.
    pub fn candidates(
        &self,
        operation: &ResourcePath,
        args: &BTreeMap<String, Value>,
    ) -> Vec<Rc<dyn Capability>> {
        let Some(capabilities) = self.routes.get(operation) else {
            return Vec::new();
        };
        let requested: Vec<ResourcePath> = args.values().flat_map(Value::resources).collect();
        capabilities
            .iter()
            .filter(|capability| {
                requested.iter().all(|resource| {
                    capability
                        .provides()
                        .iter()
                        .any(|provided| provided.provides(resource))
                })
            })
            .cloned()
            .collect()
    }

    /// Invoke the candidates for `job` and return the enqueued gatherer.
    pub fn handle(&self, job: &Job, queue: &TaskQueue) -> Synapse {
        Self::gather(job, self.candidates(&job.kind, &job.args), queue)
    }

    /// Like [`handle`](Self::handle) for an already selected candidate set.
    /// Callers holding the dispatcher in a `RefCell` select candidates first
    /// and release the borrow before handlers run.
    pub fn gather(job: &Job, candidates: Vec<Rc<dyn Capability>>, queue: &TaskQueue) -> Synapse {
        let gatherer = match job.scope {
            Scope::Single => gather_single(job, candidates, queue),
            Scope::All | Scope::Direct => gather_all(job, candidates, queue),
        };
        queue.enqueue(&gatherer);
        gatherer
    }
}

/// Run one handler. The returned slot ends up holding either `results` (a
/// list) or `error`.
fn invoke(capability: &Rc<dyn Capability>, job: &Job, queue: &TaskQueue) -> Synapse {
    let name = capability.name().to_string();
    let slot = Synapse::new(format!("slot:{}", name));
    let handler_job = job.for_handler();

    match capability.invoke(&handler_job) {
        Ok(HandlerOutput::Value(value)) => {
            let mut items = handler_job.take_fragments();
            items.push(value);
            slot.set(RESULTS, Value::List(items));
        }
        Ok(HandlerOutput::Empty) => {
            slot.set(RESULTS, Value::List(handler_job.take_fragments()));
        }
        Ok(HandlerOutput::Deferred(deferred)) => {
            let on_ok = slot.clone();
            let on_err = slot.clone();
            deferred.on_settled(
                move |_, value| {
                    let mut items = handler_job.take_fragments();
                    if !value.is_nil() {
                        items.push(value.clone());
                    }
                    on_ok.set(RESULTS, Value::List(items));
                    Step::Done
                },
                move |_, err| {
                    on_err.stash_error(as_dispatch_error(&name, err));
                    Step::Done
                },
            );
            queue.enqueue(&deferred);
        }
        Err(err) => slot.stash_error(TaskError::Dispatch(err)),
    }
    slot
}

fn as_dispatch_error(capability: &str, err: &TaskError) -> TaskError {
    match err {
        TaskError::Dispatch(_) => err.clone(),
        other => TaskError::Dispatch(DispatchError::new(capability, other.to_string())),
    }
}

fn gather_all(job: &Job, candidates: Vec<Rc<dyn Capability>>, queue: &TaskQueue) -> Synapse {
    let slots: Vec<(String, Synapse)> = candidates
        .iter()
        .map(|capability| (capability.name().to_string(), invoke(capability, job, queue)))
        .collect();

    Synapse::new(format!("gather:{}", job.kind)).when(move |gatherer: &Synapse| {
        if slots
            .iter()
            .any(|(_, slot)| !slot.has(RESULTS) && !slot.has(ERROR))
        {
            return Verdict::Defer;
        }
        let mut results = Vec::new();
        let mut failure = None;
        for (name, slot) in &slots {
            match slot.results() {
                Some(value) => results.extend(value.into_items()),
                None => {
                    let error = slot.take_stashed_error().unwrap_or_else(|| {
                        TaskError::Dispatch(DispatchError::new(name.clone(), "failed"))
                    });
                    warn!(capability = %name, error = %error, "Handler failed");
                    failure.get_or_insert(error);
                }
            }
        }
        gatherer.set(RESULTS, Value::List(results));
        match failure {
            Some(error) => {
                gatherer.stash_error(error);
                Verdict::Fail
            }
            None => Verdict::Succeed,
        }
    })
}

struct SingleAttempt {
    remaining: VecDeque<Rc<dyn Capability>>,
    current: Option<(String, Synapse)>,
    last_error: Option<TaskError>,
}

impl SingleAttempt {
    /// Walk candidates until one is still running or one has an outcome.
    fn advance(&mut self, job: &Job, queue: &TaskQueue, gatherer: &Synapse) -> Verdict {
        loop {
            if self.current.is_none() {
                let Some(capability) = self.remaining.pop_front() else {
                    return match self.last_error.take() {
                        Some(error) => {
                            gatherer.stash_error(error);
                            Verdict::Fail
                        }
                        None => {
                            gatherer.set(RESULTS, Value::List(Vec::new()));
                            Verdict::Succeed
                        }
                    };
                };
                let slot = invoke(&capability, job, queue);
                self.current = Some((capability.name().to_string(), slot));
            }

            let Some((name, slot)) = &self.current else {
                continue;
            };
            if let Some(results) = slot.results() {
                gatherer.set(RESULTS, results);
                return Verdict::Succeed;
            }
            if !slot.has(ERROR) {
                return Verdict::Defer;
            }
            let error = slot
                .take_stashed_error()
                .unwrap_or_else(|| TaskError::Dispatch(DispatchError::new(name.clone(), "failed")));
            warn!(capability = %name, error = %error, "Handler failed, trying next candidate");
            self.last_error = Some(error);
            self.current = None;
        }
    }
}

fn gather_single(job: &Job, mut candidates: Vec<Rc<dyn Capability>>, queue: &TaskQueue) -> Synapse {
    candidates.shuffle(&mut rand::thread_rng());
    let mut attempt = SingleAttempt {
        remaining: candidates.into(),
        current: None,
        last_error: None,
    };
    // Fragments of an attempt that later fails must never reach the caller.
    let job = job.buffered();
    let queue = queue.clone();
    Synapse::new(format!("gather:{}", job.kind))
        .when(move |gatherer: &Synapse| attempt.advance(&job, &queue, gatherer))
}
