//! Ganglion: Cooperative Agents
//!
//! Agents advertise the resources they provide to a directory, discover each
//! other through it, and run operations over a streaming
//! init/ack/data/final protocol with optional authorization.

pub mod advert;
pub mod agent;
pub mod clock;
pub mod codec;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod packet;
pub mod protocol;
pub mod resource;
pub mod scheduler;
pub mod token;
pub mod transport;
pub mod types;

pub use agent::{pump, Agent, AgentContext};
pub use codec::Value;
pub use config::AgentConfig;
pub use dispatch::{Job, Scope};
pub use resource::ResourcePath;
pub use types::Address;
