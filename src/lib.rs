//! smbcast broker - hands out shared-memory broadcast channels.
//!
//! Processes that want to publish or consume on a named channel
//! (`smbcast://test.0`) ask the broker over a Unix control socket. The
//! broker creates the channel's shared-memory board on first use and passes
//! each client its own descriptor for it. Payload traffic never goes
//! through the broker.
//!
//! # Modules
//!
//! - [`broker`] - control server, registry, wire protocol, client connection
//! - [`config`] - configuration loading and validation
//! - [`permissions`] - peer credentials and the uid/gid allow-list
//! - [`logging`] - log file rotation and logger setup
//! - [`constants`] - protocol numbers, sizes and paths

pub mod broker;
pub mod config;
pub mod constants;
pub mod logging;
pub mod permissions;

// Re-export commonly used types
pub use broker::error::{BrokerError, Status};
pub use broker::registry::{ChannelRegistry, TeardownPolicy};
pub use broker::{BrokerConnection, BrokerServer};
pub use config::BrokerConfig;
