//! Per-connection session state.
//!
//! A session never owns a channel. It remembers which registry handles it
//! was given descriptors for and how many times, so that closing the
//! connection can release exactly what it acquired.

use std::collections::HashMap;

use super::protocol::ChannelName;
use super::registry::{ChannelHandle, ChannelRegistry};
use crate::constants::PROTOCOL_VERSION;
use crate::permissions::PeerCredentials;

/// State of one control connection.
#[derive(Debug)]
pub struct ClientSession {
    id: u64,
    peer: PeerCredentials,
    version: u8,
    holdings: HashMap<ChannelHandle, u32>,
}

impl ClientSession {
    /// New session with no holdings.
    pub fn new(id: u64, peer: PeerCredentials) -> Self {
        Self {
            id,
            peer,
            version: PROTOCOL_VERSION,
            holdings: HashMap::new(),
        }
    }

    /// Session number, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Credentials of the connected peer.
    pub fn peer(&self) -> &PeerCredentials {
        &self.peer
    }

    /// Protocol version spoken on this connection.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Record one successful handoff of `handle`.
    pub fn record(&mut self, handle: ChannelHandle) {
        *self.holdings.entry(handle).or_insert(0) += 1;
    }

    /// Outstanding handoffs for `name`.
    pub fn outstanding(&self, name: &ChannelName) -> u32 {
        self.holdings
            .iter()
            .filter(|(h, _)| h.name() == name)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Total outstanding handoffs across all channels.
    pub fn total_outstanding(&self) -> u32 {
        self.holdings.values().sum()
    }

    /// Release every acquisition this session made, once per handoff.
    ///
    /// Holdings are drained first, so a second call is a no-op. Returns the
    /// number of releases performed.
    pub fn release_all(&mut self, registry: &ChannelRegistry) -> u32 {
        let mut released = 0;
        for (handle, count) in self.holdings.drain() {
            for _ in 0..count {
                match registry.release(&handle) {
                    Ok(remaining) => {
                        released += 1;
                        log::debug!(
                            "[session {}] released \"{}\" ({remaining} holder(s) left)",
                            self.id,
                            handle.name()
                        );
                    }
                    Err(e) => {
                        log::warn!("[session {}] release of \"{}\" failed: {e}", self.id, handle.name());
                        break;
                    }
                }
            }
        }
        released
    }
}
