//! Transport seam.
//!
//! The runtime only needs to send an envelope to an address and know whether
//! the link is currently up. Inbound traffic is pushed into the agent's inbox
//! channel from whatever thread the transport runs on.

use crate::error::TransportError;
use crate::protocol::Envelope;
use crate::types::Address;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::trace;

/// An envelope received from `from`
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: Address,
    pub envelope: Envelope,
}

pub type InboxSender = mpsc::Sender<Inbound>;
pub type Inbox = mpsc::Receiver<Inbound>;

pub fn inbox() -> (InboxSender, Inbox) {
    mpsc::channel()
}

pub trait Transport {
    fn is_usable(&self) -> bool;

    fn send(&self, to: &Address, envelope: Envelope) -> Result<(), TransportError>;
}

/// In-process network: every connected address gets a mailbox.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    mailboxes: Arc<RwLock<HashMap<Address, InboxSender>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `address`, replacing any previous mailbox under that name.
    pub fn connect(&self, address: impl Into<Address>) -> (LoopbackTransport, Inbox) {
        let address = address.into();
        let (sender, receiver) = inbox();
        self.mailboxes.write().insert(address.clone(), sender);
        let transport = LoopbackTransport {
            address,
            network: self.clone(),
            usable: Arc::new(AtomicBool::new(true)),
        };
        (transport, receiver)
    }

    pub fn disconnect(&self, address: &Address) {
        self.mailboxes.write().remove(address);
    }

    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.mailboxes.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

/// One agent's handle on a [`LoopbackNetwork`]. Clones share the usable flag.
#[derive(Clone)]
pub struct LoopbackTransport {
    address: Address,
    network: LoopbackNetwork,
    usable: Arc<AtomicBool>,
}

impl LoopbackTransport {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn set_usable(&self, usable: bool) {
        self.usable.store(usable, Ordering::SeqCst);
    }
}

impl Transport for LoopbackTransport {
    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }

    fn send(&self, to: &Address, envelope: Envelope) -> Result<(), TransportError> {
        if !self.is_usable() {
            return Err(TransportError::NotUsable);
        }
        // Round-trip through the JSON frame so nothing relies on shared memory.
        let frame = envelope.to_json()?;
        let envelope = Envelope::from_json(&frame)?;

        let mailboxes = self.network.mailboxes.read();
        let mailbox = mailboxes
            .get(to)
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))?;
        trace!(from = %self.address, to = %to, kind = %envelope.kind, "Loopback send");
        mailbox
            .send(Inbound {
                from: self.address.clone(),
                envelope,
            })
            .map_err(|_| TransportError::Unreachable(to.to_string()))
    }
}
