//! Task Queue
//!
//! Ordered collection of unresolved tasks, driven one generation at a time by
//! the agent's run loop. Each [`tick`](TaskQueue::tick) looks only at the tasks
//! that were queued when it started; anything enqueued while it runs waits for
//! the next tick.

use super::task::{Outcome, Status, Step, Synapse, Verdict, RESULTS};
use crate::clock::Clock;
use crate::codec::Value;
use crate::error::{SchedulerError, TaskError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;
use tracing::{trace, warn};

/// Counters for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks whose conditions were checked
    pub evaluated: usize,
    /// Tasks resolved (including timeouts)
    pub resolved: usize,
    /// Tasks left in the queue afterwards
    pub pending: usize,
}

impl TickReport {
    pub fn made_progress(&self) -> bool {
        self.resolved > 0
    }
}

/// Shared handle to an agent's task queue
#[derive(Clone)]
pub struct TaskQueue {
    tasks: Rc<RefCell<VecDeque<Synapse>>>,
    clock: Rc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            tasks: Rc::new(RefCell::new(VecDeque::new())),
            clock,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn clock(&self) -> Rc<dyn Clock> {
        Rc::clone(&self.clock)
    }

    /// Append a task. Returns false if it is already queued or resolved.
    pub fn enqueue(&self, task: &Synapse) -> bool {
        if task.status() != Status::Pending || !task.mark_queued() {
            return false;
        }
        self.tasks.borrow_mut().push_back(task.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    pub fn contains(&self, task: &Synapse) -> bool {
        self.tasks.borrow().iter().any(|queued| queued.ptr_eq(task))
    }

    /// Drop every queued task without resolving it.
    pub fn clear(&self) {
        let drained: Vec<Synapse> = self.tasks.borrow_mut().drain(..).collect();
        for task in drained {
            task.clear_queued();
        }
    }

    /// Resolve a task outside of a tick and schedule any nested tasks its
    /// callbacks asked to wait on.
    pub fn settle(
        &self,
        task: &Synapse,
        result: Result<Value, TaskError>,
    ) -> Result<Step, SchedulerError> {
        let step = task.resolve(result)?;
        for nested in task.take_spawned() {
            self.enqueue(&nested);
        }
        Ok(step)
    }

    /// Enqueue a task that settles after `source`, with `map` applied to a
    /// successful value. Failures pass through unchanged.
    pub fn follow<F>(&self, label: impl Into<String>, source: &Synapse, map: F) -> Synapse
    where
        F: FnOnce(Value) -> Result<Value, TaskError> + 'static,
    {
        let source = source.clone();
        let mut map = Some(map);
        let task = Synapse::new(label).when(move |task: &Synapse| match source.outcome() {
            Outcome::Pending => Verdict::Defer,
            Outcome::Succeeded(value) => match map.take().map(|map| map(value)) {
                Some(Ok(mapped)) => {
                    task.set(RESULTS, mapped);
                    Verdict::Succeed
                }
                Some(Err(err)) => {
                    task.stash_error(err);
                    Verdict::Fail
                }
                None => Verdict::Fail,
            },
            Outcome::Failed(err) => {
                task.stash_error(err);
                Verdict::Fail
            }
        });
        self.enqueue(&task);
        task
    }

    /// Evaluate one generation of tasks.
    pub fn tick(&self) -> TickReport {
        let generation = self.len();
        let now = self.clock.now();
        let mut report = TickReport::default();

        for _ in 0..generation {
            let Some(task) = self.tasks.borrow_mut().pop_front() else {
                break;
            };
            if task.status() != Status::Pending {
                // Resolved directly by someone else since it was queued.
                task.clear_queued();
                continue;
            }

            report.evaluated += 1;
            task.arm_timeout(now);
            let result = if task.is_expired(now) {
                Some(Err(TaskError::ProtocolTimeout(task.label())))
            } else {
                match task.evaluate() {
                    Verdict::Succeed => Some(Ok(task.get(RESULTS).unwrap_or(Value::Nil))),
                    Verdict::Fail => Some(Err(task
                        .take_stashed_error()
                        .unwrap_or_else(|| TaskError::ConditionFailed(task.label())))),
                    Verdict::Defer => None,
                }
            };

            match result {
                Some(result) => {
                    task.clear_queued();
                    report.resolved += 1;
                    trace!(task = %task.label(), ok = result.is_ok(), "Resolving task");
                    if let Err(err) = self.settle(&task, result) {
                        warn!(task = %task.label(), error = %err, "Task resolved during evaluation");
                    }
                }
                None => self.tasks.borrow_mut().push_back(task),
            }
        }

        report.pending = self.len();
        report
    }
}
