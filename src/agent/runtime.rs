//! The run loop.

use super::Agent;
use crate::protocol::deliver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::TryRecvError;
use tracing::{debug, trace};

impl Agent {
    /// Drain the inbox, then evaluate one generation of tasks. Returns true
    /// if anything happened.
    pub fn run_once(&self) -> bool {
        let mut received = 0usize;
        loop {
            match self.inbox.try_recv() {
                Ok(inbound) => {
                    deliver(&self.ctx, inbound);
                    received += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    trace!(address = %self.address(), "Inbox disconnected");
                    break;
                }
            }
        }
        let report = self.ctx.queue().tick();
        if received > 0 || report.resolved > 0 {
            trace!(
                address = %self.address(),
                received,
                evaluated = report.evaluated,
                resolved = report.resolved,
                pending = report.pending,
                "Loop iteration"
            );
        }
        received > 0 || report.made_progress()
    }

    /// Loop until `stop` is set, backing off while idle.
    pub fn run(&mut self, stop: &AtomicBool) {
        debug!(address = %self.address(), "Run loop started");
        while !stop.load(Ordering::SeqCst) {
            if self.run_once() {
                self.backoff.reset();
            } else {
                std::thread::sleep(self.backoff.next_delay());
            }
        }
        debug!(address = %self.address(), "Run loop stopped");
    }
}

/// One loop iteration for each of several agents sharing a thread. Returns
/// true if any of them made progress.
pub fn pump(agents: &[&Agent]) -> bool {
    agents
        .iter()
        .fold(false, |progress, agent| agent.run_once() || progress)
}
