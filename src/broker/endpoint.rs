//! Endpoint factories: the OS resource behind each channel.
//!
//! A channel is backed by one [`Endpoint`], an owned descriptor plus its
//! size. The registry never touches the resource directly; it asks an
//! [`EndpointFactory`] to create, destroy and describe it. Factories are
//! picked per channel scheme through [`EndpointFactories`], so a future
//! scheme can bring a different endpoint kind without touching the registry.
//!
//! The default factory, [`SharedMemoryFactory`], creates an anonymous
//! shared-memory board (`memfd_create` + `ftruncate`). Every process that
//! receives a duplicate of the descriptor can `mmap` the same pages; the
//! broker itself never maps them.

use std::ffi::CStr;
use std::fmt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use super::error::{BrokerError, BrokerResult};
use super::protocol::ChannelName;
use crate::constants::{DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};

// ─── Endpoint ──────────────────────────────────────────────────────────────

/// An OS communication resource owned by the registry.
///
/// The descriptor is closed exactly once, on [`Endpoint::close`] or drop.
pub struct Endpoint {
    fd: Option<OwnedFd>,
    capacity: u64,
    kind: &'static str,
}

impl Endpoint {
    /// Wrap an already-open descriptor.
    pub fn new(fd: OwnedFd, capacity: u64, kind: &'static str) -> Self {
        Self {
            fd: Some(fd),
            capacity,
            kind,
        }
    }

    /// Size of the resource in bytes, after any rounding by the factory.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Short label of the endpoint kind, for logs.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Returns `false` once the endpoint has been destroyed.
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Borrow the descriptor, if still open.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    /// Duplicate the descriptor for handoff.
    ///
    /// The duplicate refers to the same open file description but has its
    /// own lifetime: closing it never affects the endpoint and vice versa.
    pub fn duplicate(&self) -> BrokerResult<OwnedFd> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| BrokerError::InternalError("endpoint already destroyed".into()))?;
        fd.try_clone()
            .map_err(|e| BrokerError::ResourceExhausted(format!("dup endpoint descriptor: {e}")))
    }

    /// Close the descriptor. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        self.fd.take().is_some()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("fd", &self.fd.as_ref().map(AsRawFd::as_raw_fd))
            .field("capacity", &self.capacity)
            .field("kind", &self.kind)
            .finish()
    }
}

// ─── Factory trait ─────────────────────────────────────────────────────────

/// Creates and releases the endpoint behind a channel.
///
/// Implementations are shared across connection threads, hence
/// `Send + Sync`. `create` and `destroy` are always called with the registry
/// lock held, so they should not block on anything but the kernel.
pub trait EndpointFactory: Send + Sync + fmt::Debug {
    /// Allocate a new endpoint sized for `capacity_hint` bytes.
    ///
    /// A hint of zero asks for the factory's default size.
    fn create(&self, capacity_hint: u32) -> BrokerResult<Endpoint>;

    /// Release every OS resource held by `endpoint`.
    ///
    /// Idempotent: a second call only logs.
    fn destroy(&self, endpoint: &mut Endpoint) {
        if !endpoint.close() {
            log::warn!("[endpoint] destroy on already-closed {}", self.describe(endpoint));
        }
    }

    /// Human-readable description for logs.
    fn describe(&self, endpoint: &Endpoint) -> String {
        format!("{} endpoint ({} bytes)", endpoint.kind(), endpoint.capacity())
    }
}

// ─── Shared-memory board ───────────────────────────────────────────────────

/// `memfd`-backed shared-memory board factory.
#[derive(Debug, Clone)]
pub struct SharedMemoryFactory {
    default_size: u64,
    max_size: u64,
}

impl Default for SharedMemoryFactory {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE)
    }
}

impl SharedMemoryFactory {
    /// Factory using `default_size` for zero hints and refusing anything
    /// larger than `max_size`.
    pub fn new(default_size: u64, max_size: u64) -> Self {
        Self {
            default_size,
            max_size,
        }
    }

    /// Size that will actually be allocated for `capacity_hint`.
    pub fn board_size(&self, capacity_hint: u32) -> BrokerResult<u64> {
        let requested = if capacity_hint == 0 {
            self.default_size
        } else {
            u64::from(capacity_hint)
        };
        if requested > self.max_size {
            return Err(BrokerError::ResourceExhausted(format!(
                "requested {requested} bytes, limit is {}",
                self.max_size
            )));
        }
        let page = page_size();
        Ok(requested.div_ceil(page) * page)
    }
}

impl EndpointFactory for SharedMemoryFactory {
    fn create(&self, capacity_hint: u32) -> BrokerResult<Endpoint> {
        let size = self.board_size(capacity_hint)?;

        const BOARD_NAME: &CStr = c"smbcast-board";
        // SAFETY: BOARD_NAME is a valid NUL-terminated string; memfd_create
        // returns a fresh descriptor or -1.
        let raw = unsafe { libc::memfd_create(BOARD_NAME.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(BrokerError::ResourceExhausted(format!(
                "memfd_create: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: `raw` was just returned by memfd_create and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let len = libc::off_t::try_from(size)
            .map_err(|_| BrokerError::ResourceExhausted(format!("board size {size} overflows off_t")))?;
        // SAFETY: `fd` is a valid open memfd for the duration of the call.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } != 0 {
            return Err(BrokerError::ResourceExhausted(format!(
                "ftruncate board to {size} bytes: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Endpoint::new(fd, size, "shm-board"))
    }

    fn describe(&self, endpoint: &Endpoint) -> String {
        let fd = endpoint
            .as_fd()
            .map_or_else(|| "closed".to_owned(), |fd| fd.as_raw_fd().to_string());
        format!("shared-memory board fd={fd} size={}", endpoint.capacity())
    }
}

/// System page size, falling back to 4 KiB if `sysconf` fails.
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(page).ok().filter(|p| *p > 0).unwrap_or(4096)
}

// ─── Factory selection ─────────────────────────────────────────────────────

/// Per-scheme factory table with a default.
///
/// Selection only looks at the name's scheme prefix; the rest of the name
/// stays opaque.
#[derive(Debug, Clone)]
pub struct EndpointFactories {
    default: Arc<dyn EndpointFactory>,
    by_scheme: Vec<(Vec<u8>, Arc<dyn EndpointFactory>)>,
}

impl EndpointFactories {
    /// Table where every name uses `default`.
    pub fn new(default: Arc<dyn EndpointFactory>) -> Self {
        Self {
            default,
            by_scheme: Vec::new(),
        }
    }

    /// Route names with `scheme://` to `factory`. Replaces an earlier entry.
    pub fn register(&mut self, scheme: &str, factory: Arc<dyn EndpointFactory>) {
        let key = scheme.as_bytes().to_vec();
        self.by_scheme.retain(|(s, _)| *s != key);
        self.by_scheme.push((key, factory));
    }

    /// Factory responsible for `name`.
    pub fn for_name(&self, name: &ChannelName) -> &Arc<dyn EndpointFactory> {
        name.scheme()
            .and_then(|scheme| {
                self.by_scheme
                    .iter()
                    .find(|(s, _)| s.as_slice() == scheme)
                    .map(|(_, f)| f)
            })
            .unwrap_or(&self.default)
    }
}

impl Default for EndpointFactories {
    fn default() -> Self {
        let mut table = Self::new(Arc::new(SharedMemoryFactory::default()));
        table.register("smbcast", Arc::new(SharedMemoryFactory::default()));
        table
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────
