//! Agents
//!
//! An [`Agent`] is one addressable participant: it owns an [`AgentContext`],
//! an inbox, and a run loop that feeds inbound envelopes to the protocol
//! machines and ticks the task queue.

mod context;
mod operations;
mod runtime;

pub use context::{AgentContext, ProtocolSettings};
pub use operations::AdvertiseHandle;
pub use runtime::pump;

use crate::clock::Clock;
use crate::codec::Codec;
use crate::config::AgentConfig;
use crate::directory::{AccessPolicy, Directory};
use crate::dispatch::{Capability, Dispatcher, HandlerOutput, Job};
use crate::error::{AgentError, DispatchError};
use crate::resource::ResourcePath;
use crate::scheduler::{Backoff, TaskQueue};
use crate::transport::{Inbox, Transport};
use crate::types::Address;
use std::cell::RefMut;
use std::rc::Rc;
use tracing::info;

pub struct Agent {
    ctx: AgentContext,
    inbox: Inbox,
    backoff: Backoff,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        transport: Rc<dyn Transport>,
        inbox: Inbox,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let address = config.require_address()?.clone();
        let settings = ProtocolSettings {
            address: address.clone(),
            directory: config.directory.clone(),
            authorizer: config.authorizer.clone(),
            operation_timeout: config.operation_timeout(),
            advertise_ttl: config.advertise_ttl(),
        };
        let ctx = AgentContext::new(
            settings,
            Codec::new(config.protocol.wide_integers),
            transport,
            TaskQueue::new(clock),
        );
        info!(
            address = %address,
            directory = ?config.directory.as_ref().map(|d| d.to_string()),
            authorizer = ?config.authorizer.as_ref().map(|a| a.to_string()),
            "Agent created"
        );
        Ok(Self {
            ctx,
            inbox,
            backoff: config.backoff(),
        })
    }

    pub fn address(&self) -> &Address {
        self.ctx.address()
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn queue(&self) -> &TaskQueue {
        self.ctx.queue()
    }

    pub fn dispatcher_mut(&self) -> RefMut<'_, Dispatcher> {
        self.ctx.dispatcher_mut()
    }

    pub fn register(&self, operation: ResourcePath, capability: Rc<dyn Capability>) {
        self.ctx.dispatcher_mut().register(operation, capability);
    }

    pub fn register_fn<F>(
        &self,
        operation: ResourcePath,
        name: impl Into<String>,
        provides: Vec<ResourcePath>,
        handler: F,
    ) where
        F: Fn(&Job) -> Result<HandlerOutput, DispatchError> + 'static,
    {
        self.ctx
            .dispatcher_mut()
            .register_fn(operation, name, provides, handler);
    }

    /// Turn this agent into a directory: serve `/advertise`, `/discover` and
    /// `/authorize` from a fresh advertisement cache.
    pub fn serve_directory(&self, policy: AccessPolicy) -> Directory {
        let directory = Directory::new(self.ctx.queue().clock(), policy);
        directory.install(&mut self.ctx.dispatcher_mut());
        info!(address = %self.address(), "Serving directory");
        directory
    }

    /// Drop all in-flight operations and queued tasks.
    pub fn shutdown(&self) {
        self.ctx.shutdown();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.ctx.shutdown();
    }
}
