//! Deferred tasks.
//!
//! A [`Synapse`] is a unit of asynchronous work: a set of readiness conditions,
//! stacks of success and failure callbacks, an optional timeout and a scratch
//! map for handing values to the next stage of a chain. Handles are cheap
//! clones of the same shared task; everything runs on the agent's loop thread.

use crate::codec::Value;
use crate::error::{SchedulerError, TaskError};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Scratch key holding a stage's results
pub const RESULTS: &str = "results";
/// Scratch key holding a stage's error
pub const ERROR: &str = "error";

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// What a condition says about readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Succeed,
    Fail,
    Defer,
}

impl From<bool> for Verdict {
    fn from(value: bool) -> Self {
        if value {
            Verdict::Succeed
        } else {
            Verdict::Fail
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Succeeded,
    Failed,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
        }
    }
}

/// Result of a task; write-once once it leaves `Pending`
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pending,
    Succeeded(Value),
    Failed(TaskError),
}

impl Outcome {
    pub fn status(&self) -> Status {
        match self {
            Outcome::Pending => Status::Pending,
            Outcome::Succeeded(_) => Status::Succeeded,
            Outcome::Failed(_) => Status::Failed,
        }
    }
}

/// Continuation returned by a callback
#[derive(Debug)]
pub enum Step {
    Done,
    Yield(Value),
    /// Wait for this nested task too; the queue schedules it.
    Await(Synapse),
}

impl Step {
    pub fn value(self) -> Option<Value> {
        match self {
            Step::Yield(value) => Some(value),
            _ => None,
        }
    }
}

type Condition = Box<dyn FnMut(&Synapse) -> Verdict>;
type SuccessCallback = Box<dyn FnOnce(&Synapse, &Value) -> Step>;
type FailureCallback = Box<dyn FnOnce(&Synapse, &TaskError) -> Step>;

enum Timeout {
    Unset,
    /// Waiting for the queue to start the countdown
    Requested(Duration),
    Armed(Instant),
}

struct Inner {
    id: u64,
    label: String,
    outcome: Outcome,
    conditions: Vec<Condition>,
    on_success: Vec<SuccessCallback>,
    on_failure: Vec<FailureCallback>,
    timeout: Timeout,
    scratch: HashMap<String, Value>,
    stashed_error: Option<TaskError>,
    spawned: Vec<Synapse>,
    queued: bool,
}

/// Shared handle to a deferred task
#[derive(Clone)]
pub struct Synapse {
    inner: Rc<RefCell<Inner>>,
}

impl Synapse {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                outcome: Outcome::Pending,
                conditions: Vec::new(),
                on_success: Vec::new(),
                on_failure: Vec::new(),
                timeout: Timeout::Unset,
                scratch: HashMap::new(),
                stashed_error: None,
                spawned: Vec::new(),
                queued: false,
            })),
        }
    }

    /// A task that is already resolved with `value`, with `results` set.
    pub fn ready(label: impl Into<String>, value: Value) -> Self {
        let task = Self::new(label);
        task.set(RESULTS, value.clone());
        {
            let mut inner = task.inner.borrow_mut();
            inner.outcome = Outcome::Succeeded(value);
        }
        task
    }

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn label(&self) -> String {
        self.inner.borrow().label.clone()
    }

    pub fn status(&self) -> Status {
        self.inner.borrow().outcome.status()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    pub fn outcome(&self) -> Outcome {
        self.inner.borrow().outcome.clone()
    }

    pub fn ptr_eq(&self, other: &Synapse) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Add a readiness condition. Conditions returning `bool` map `true` to
    /// succeed and `false` to fail.
    pub fn add_condition<F, V>(&self, mut condition: F)
    where
        F: FnMut(&Synapse) -> V + 'static,
        V: Into<Verdict>,
    {
        self.inner
            .borrow_mut()
            .conditions
            .push(Box::new(move |task| condition(task).into()));
    }

    /// Builder form of [`add_condition`](Self::add_condition).
    pub fn when<F, V>(self, condition: F) -> Self
    where
        F: FnMut(&Synapse) -> V + 'static,
        V: Into<Verdict>,
    {
        self.add_condition(condition);
        self
    }

    /// Evaluate conditions, newest first, stopping at the first that does not
    /// succeed.
    pub fn evaluate(&self) -> Verdict {
        let mut conditions = std::mem::take(&mut self.inner.borrow_mut().conditions);
        let mut verdict = Verdict::Succeed;
        for condition in conditions.iter_mut().rev() {
            verdict = condition(self);
            if verdict != Verdict::Succeed {
                break;
            }
        }

        let mut inner = self.inner.borrow_mut();
        let added = std::mem::replace(&mut inner.conditions, conditions);
        inner.conditions.extend(added);
        verdict
    }

    /// Register a success callback. Runs inline when the task already
    /// succeeded; rejected when it already failed.
    pub fn on_success<F>(&self, callback: F) -> Result<Step, SchedulerError>
    where
        F: FnOnce(&Synapse, &Value) -> Step + 'static,
    {
        match self.outcome() {
            Outcome::Pending => {
                self.inner.borrow_mut().on_success.push(Box::new(callback));
                Ok(Step::Done)
            }
            Outcome::Succeeded(value) => Ok(self.record(callback(self, &value))),
            Outcome::Failed(_) => Err(self.mismatch(Status::Failed, "success")),
        }
    }

    /// Register a failure callback. Runs inline when the task already
    /// failed; rejected when it already succeeded.
    pub fn on_failure<F>(&self, callback: F) -> Result<Step, SchedulerError>
    where
        F: FnOnce(&Synapse, &TaskError) -> Step + 'static,
    {
        match self.outcome() {
            Outcome::Pending => {
                self.inner.borrow_mut().on_failure.push(Box::new(callback));
                Ok(Step::Done)
            }
            Outcome::Failed(error) => Ok(self.record(callback(self, &error))),
            Outcome::Succeeded(_) => Err(self.mismatch(Status::Succeeded, "failure")),
        }
    }

    /// Builder form of [`on_success`](Self::on_success).
    pub fn then<F>(self, callback: F) -> Self
    where
        F: FnOnce(&Synapse, &Value) -> Step + 'static,
    {
        if let Err(err) = self.on_success(callback) {
            warn!(task = %self.label(), error = %err, "Dropped success callback");
        }
        self
    }

    /// Builder form of [`on_failure`](Self::on_failure).
    pub fn otherwise<F>(self, callback: F) -> Self
    where
        F: FnOnce(&Synapse, &TaskError) -> Step + 'static,
    {
        if let Err(err) = self.on_failure(callback) {
            warn!(task = %self.label(), error = %err, "Dropped failure callback");
        }
        self
    }

    /// Register both outcomes at once; whichever applies runs.
    pub fn on_settled<S, F>(&self, on_success: S, on_failure: F) -> Step
    where
        S: FnOnce(&Synapse, &Value) -> Step + 'static,
        F: FnOnce(&Synapse, &TaskError) -> Step + 'static,
    {
        match self.outcome() {
            Outcome::Pending => {
                let mut inner = self.inner.borrow_mut();
                inner.on_success.push(Box::new(on_success));
                inner.on_failure.push(Box::new(on_failure));
                Step::Done
            }
            Outcome::Succeeded(value) => self.record(on_success(self, &value)),
            Outcome::Failed(error) => self.record(on_failure(self, &error)),
        }
    }

    /// Resolve the task, cancel its timeout and drain the matching callback
    /// stack last-in first-out. Returns the last callback's step. Conditions
    /// are dropped along with whatever they captured.
    pub fn resolve(&self, result: Result<Value, TaskError>) -> Result<Step, SchedulerError> {
        let mut inner = self.inner.borrow_mut();
        if inner.outcome.status() != Status::Pending {
            return Err(SchedulerError::AlreadyResolved(inner.label.clone()));
        }
        inner.timeout = Timeout::Unset;
        inner.conditions.clear();

        match result {
            Ok(value) => {
                inner.outcome = Outcome::Succeeded(value.clone());
                let callbacks = std::mem::take(&mut inner.on_success);
                inner.on_failure.clear();
                drop(inner);

                let mut step = Step::Done;
                for callback in callbacks.into_iter().rev() {
                    step = self.record(callback(self, &value));
                }
                Ok(step)
            }
            Err(error) => {
                inner.outcome = Outcome::Failed(error.clone());
                let callbacks = std::mem::take(&mut inner.on_failure);
                inner.on_success.clear();
                drop(inner);

                let mut step = Step::Done;
                for callback in callbacks.into_iter().rev() {
                    step = self.record(callback(self, &error));
                }
                Ok(step)
            }
        }
    }

    pub fn succeed(&self, value: Value) -> Result<Step, SchedulerError> {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, error: TaskError) -> Result<Step, SchedulerError> {
        self.resolve(Err(error))
    }

    /// Force failure after `duration` unless cancelled. Replaces any previous
    /// timeout. The countdown starts when the queue first sees the task.
    pub fn timeout(&self, duration: Duration) {
        self.inner.borrow_mut().timeout = Timeout::Requested(duration);
    }

    pub fn with_timeout(self, duration: Duration) -> Self {
        self.timeout(duration);
        self
    }

    pub fn cancel_timeout(&self) {
        self.inner.borrow_mut().timeout = Timeout::Unset;
    }

    pub fn has_timeout(&self) -> bool {
        !matches!(self.inner.borrow().timeout, Timeout::Unset)
    }

    pub(crate) fn arm_timeout(&self, now: Instant) {
        let mut inner = self.inner.borrow_mut();
        if let Timeout::Requested(duration) = inner.timeout {
            inner.timeout = Timeout::Armed(now + duration);
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        matches!(self.inner.borrow().timeout, Timeout::Armed(deadline) if now >= deadline)
    }

    pub fn set(&self, key: &str, value: Value) {
        self.inner.borrow_mut().scratch.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.borrow().scratch.get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.borrow().scratch.contains_key(key)
    }

    pub fn take(&self, key: &str) -> Option<Value> {
        self.inner.borrow_mut().scratch.remove(key)
    }

    /// Shorthand for the `results` scratch key.
    pub fn results(&self) -> Option<Value> {
        self.get(RESULTS)
    }

    /// Failure reason used when a condition yields [`Verdict::Fail`].
    pub fn stash_error(&self, error: TaskError) {
        self.set(ERROR, Value::Fault(error.to_fault()));
        self.inner.borrow_mut().stashed_error = Some(error);
    }

    pub(crate) fn take_stashed_error(&self) -> Option<TaskError> {
        self.inner.borrow_mut().stashed_error.take()
    }

    pub(crate) fn take_spawned(&self) -> Vec<Synapse> {
        std::mem::take(&mut self.inner.borrow_mut().spawned)
    }

    /// Returns false when the task was already queued.
    pub(crate) fn mark_queued(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.queued {
            return false;
        }
        inner.queued = true;
        true
    }

    pub(crate) fn clear_queued(&self) {
        self.inner.borrow_mut().queued = false;
    }

    fn record(&self, step: Step) -> Step {
        if let Step::Await(nested) = &step {
            self.inner.borrow_mut().spawned.push(nested.clone());
        }
        step
    }

    fn mismatch(&self, actual: Status, requested: &'static str) -> SchedulerError {
        SchedulerError::OutcomeMismatch {
            label: self.label(),
            actual: actual.as_str(),
            requested,
        }
    }
}

impl fmt::Debug for Synapse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Synapse")
            .field("id", &inner.id)
            .field("label", &inner.label)
            .field("status", &inner.outcome.status())
            .field("conditions", &inner.conditions.len())
            .finish()
    }
}
