//! Channel registry: name → channel state, with reference counting.
//!
//! The registry is the only shared mutable state in the broker. Every
//! lookup-or-insert, refcount change and teardown runs under one mutex, so
//! two near-simultaneous first requests for a name produce exactly one
//! endpoint: the loser of the race simply finds the winner's entry.
//!
//! Endpoint creation and destruction happen while that lock is held. They
//! are short kernel calls (`memfd_create`, `ftruncate`, `close`); nothing in
//! here waits on a client.
//!
//! Callers only ever see a [`ChannelHandle`] (name plus generation id) and
//! duplicated descriptors, never the channel itself.

use std::collections::HashMap;
use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::endpoint::{Endpoint, EndpointFactories, EndpointFactory};
use super::error::{BrokerError, BrokerResult};
use super::protocol::ChannelName;

// ─── Policy ────────────────────────────────────────────────────────────────

/// What happens to a channel whose refcount returns to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownPolicy {
    /// Destroy the endpoint and remove the entry as soon as the last holder
    /// releases it.
    #[default]
    Immediate,
    /// Keep the channel until the broker shuts down, so a restarted writer
    /// reattaches to the same board.
    Retain,
}

impl std::str::FromStr for TeardownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "retain" => Ok(Self::Retain),
            other => Err(format!("unknown teardown policy '{other}' (expected immediate or retain)")),
        }
    }
}

impl std::fmt::Display for TeardownPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Immediate => "immediate",
            Self::Retain => "retain",
        })
    }
}

// ─── Handles ───────────────────────────────────────────────────────────────

/// Reference to a registry entry.
///
/// `id` is unique per created channel, so a handle to a torn-down channel
/// never matches a later channel that reuses the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    name: ChannelName,
    id: u64,
}

impl ChannelHandle {
    /// Channel name.
    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    /// Generation id of the channel this handle was issued for.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Result of a successful [`ChannelRegistry::attach`].
#[derive(Debug)]
pub struct Attachment {
    /// Handle to release when the holder goes away.
    pub handle: ChannelHandle,
    /// Duplicate of the endpoint descriptor, ready for handoff.
    pub descriptor: OwnedFd,
    /// Real size of the channel buffer.
    pub buffer_size: u64,
    /// Refcount after this attachment.
    pub refcount: u32,
    /// `true` if this call created the channel.
    pub created: bool,
}

/// Read-only view of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel name.
    pub name: ChannelName,
    /// Real size of the channel buffer.
    pub buffer_size: u64,
    /// Outstanding acquisitions.
    pub refcount: u32,
    /// Creation time.
    pub created_at: SystemTime,
}

// ─── Registry ──────────────────────────────────────────────────────────────

struct Channel {
    id: u64,
    endpoint: Endpoint,
    factory: Arc<dyn EndpointFactory>,
    refcount: u32,
    created_at: SystemTime,
}

#[derive(Default)]
struct RegistryState {
    channels: HashMap<ChannelName, Channel>,
    next_id: u64,
}

/// Shared channel registry. Pass it around as `Arc<ChannelRegistry>`.
pub struct ChannelRegistry {
    state: Mutex<RegistryState>,
    factories: EndpointFactories,
    policy: TeardownPolicy,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("policy", &self.policy)
            .field("factories", &self.factories)
            .finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    /// Empty registry using `factories` to build endpoints.
    pub fn new(factories: EndpointFactories, policy: TeardownPolicy) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            factories,
            policy,
        }
    }

    /// Configured teardown policy.
    pub fn policy(&self) -> TeardownPolicy {
        self.policy
    }

    fn lock(&self) -> BrokerResult<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|e| BrokerError::InternalError(format!("registry lock poisoned: {e}")))
    }

    /// Look up `name`, creating the channel if it does not exist yet.
    ///
    /// `capacity_hint` only matters for the creating call; later callers get
    /// the existing channel whatever hint they pass.
    ///
    /// A channel created here starts with refcount 0 and is only torn down
    /// by a `release` that brings it back to 0, or by [`shutdown`]. Callers
    /// must follow up with [`acquire`]; use [`attach`] to do both at once.
    ///
    /// [`shutdown`]: ChannelRegistry::shutdown
    /// [`acquire`]: ChannelRegistry::acquire
    /// [`attach`]: ChannelRegistry::attach
    pub fn resolve_or_create(
        &self,
        name: &ChannelName,
        capacity_hint: u32,
    ) -> BrokerResult<ChannelHandle> {
        let mut state = self.lock()?;
        let (id, _) = self.resolve_locked(&mut state, name, capacity_hint)?;
        Ok(ChannelHandle {
            name: name.clone(),
            id,
        })
    }

    /// Increment the refcount of the channel behind `handle`.
    ///
    /// Returns the new count. Fails with `NotFound` if the channel has been
    /// torn down since the handle was issued.
    pub fn acquire(&self, handle: &ChannelHandle) -> BrokerResult<u32> {
        let mut state = self.lock()?;
        let channel = Self::live_channel(&mut state, handle)?;
        channel.refcount = channel
            .refcount
            .checked_add(1)
            .ok_or_else(|| BrokerError::InternalError(format!("refcount overflow on {}", handle.name)))?;
        Ok(channel.refcount)
    }

    /// Decrement the refcount of the channel behind `handle`.
    ///
    /// Returns the remaining count. Under [`TeardownPolicy::Immediate`] a
    /// release that reaches zero destroys the endpoint and removes the entry.
    pub fn release(&self, handle: &ChannelHandle) -> BrokerResult<u32> {
        let mut state = self.lock()?;
        let channel = Self::live_channel(&mut state, handle)?;
        if channel.refcount == 0 {
            return Err(BrokerError::InternalError(format!(
                "release without matching acquire on {}",
                handle.name
            )));
        }
        channel.refcount -= 1;
        let remaining = channel.refcount;

        if remaining == 0 && self.policy == TeardownPolicy::Immediate {
            if let Some(channel) = state.channels.remove(&handle.name) {
                Self::teardown(&handle.name, channel);
            }
        }
        Ok(remaining)
    }

    /// Resolve or create `name`, acquire it and duplicate its descriptor,
    /// all in one critical section.
    ///
    /// If the duplication fails the acquisition is rolled back and a freshly
    /// created channel is removed again.
    pub fn attach(&self, name: &ChannelName, capacity_hint: u32) -> BrokerResult<Attachment> {
        let mut state = self.lock()?;
        let (id, created) = self.resolve_locked(&mut state, name, capacity_hint)?;
        let handle = ChannelHandle {
            name: name.clone(),
            id,
        };

        let channel = Self::live_channel(&mut state, &handle)?;
        let descriptor = match channel.endpoint.duplicate() {
            Ok(fd) => fd,
            Err(e) => {
                if created && channel.refcount == 0 && self.policy == TeardownPolicy::Immediate {
                    if let Some(channel) = state.channels.remove(name) {
                        Self::teardown(name, channel);
                    }
                }
                return Err(e);
            }
        };
        channel.refcount = channel
            .refcount
            .checked_add(1)
            .ok_or_else(|| BrokerError::InternalError(format!("refcount overflow on {name}")))?;

        Ok(Attachment {
            handle,
            descriptor,
            buffer_size: channel.endpoint.capacity(),
            refcount: channel.refcount,
            created,
        })
    }

    /// Current refcount of `name`, or `None` if no such channel exists.
    pub fn refcount(&self, name: &ChannelName) -> Option<u32> {
        self.lock()
            .ok()
            .and_then(|state| state.channels.get(name).map(|c| c.refcount))
    }

    /// Whether a channel named `name` exists.
    pub fn contains(&self, name: &ChannelName) -> bool {
        self.lock()
            .map(|state| state.channels.contains_key(name))
            .unwrap_or(false)
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.lock().map(|state| state.channels.len()).unwrap_or(0)
    }

    /// Returns `true` if no channel exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time view of every channel, sorted by name.
    pub fn snapshot(&self) -> Vec<ChannelInfo> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut infos: Vec<ChannelInfo> = state
            .channels
            .iter()
            .map(|(name, c)| ChannelInfo {
                name: name.clone(),
                buffer_size: c.endpoint.capacity(),
                refcount: c.refcount,
                created_at: c.created_at,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Destroy every channel regardless of refcount.
    ///
    /// Clients keep their duplicated descriptors; only the broker's copies
    /// are closed.
    pub fn shutdown(&self) {
        let drained: Vec<(ChannelName, Channel)> = match self.state.lock() {
            Ok(mut state) => state.channels.drain().collect(),
            Err(poisoned) => poisoned.into_inner().channels.drain().collect(),
        };
        for (name, channel) in drained {
            Self::teardown(&name, channel);
        }
    }

    // ── Internal ────────────────────────────────────────────────────────────

    /// Lookup-or-insert under the held lock. Returns `(id, created)`.
    fn resolve_locked(
        &self,
        state: &mut RegistryState,
        name: &ChannelName,
        capacity_hint: u32,
    ) -> BrokerResult<(u64, bool)> {
        if let Some(channel) = state.channels.get(name) {
            return Ok((channel.id, false));
        }

        let factory = Arc::clone(self.factories.for_name(name));
        let endpoint = factory.create(capacity_hint)?;
        let id = state.next_id;
        state.next_id += 1;

        log::info!(
            "[registry] created channel \"{name}\" with size {} bytes ({})",
            endpoint.capacity(),
            factory.describe(&endpoint)
        );

        state.channels.insert(
            name.clone(),
            Channel {
                id,
                endpoint,
                factory,
                refcount: 0,
                created_at: SystemTime::now(),
            },
        );
        Ok((id, true))
    }

    fn live_channel<'a>(
        state: &'a mut RegistryState,
        handle: &ChannelHandle,
    ) -> BrokerResult<&'a mut Channel> {
        match state.channels.get_mut(&handle.name) {
            Some(channel) if channel.id == handle.id => Ok(channel),
            _ => Err(BrokerError::NotFound(handle.name.to_string())),
        }
    }

    fn teardown(name: &ChannelName, mut channel: Channel) {
        channel.factory.destroy(&mut channel.endpoint);
        log::info!("[registry] destroyed channel \"{name}\"");
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────
