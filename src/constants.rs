//! Application-wide constants for the smbcast broker.
//!
//! Groups the protocol numbers, size limits and filesystem locations so the
//! codec, the server and the configuration layer agree on them.
//!
//! # Categories
//!
//! - **Protocol**: wire version and message size limits
//! - **Buffers**: shared-memory board sizing
//! - **Paths**: default socket and log locations

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// The only control protocol version the broker speaks.
pub const PROTOCOL_VERSION: u8 = 2;

/// Size of the fixed request header: version, opcode, total_len, param.
pub const REQUEST_HEADER_SIZE: usize = 8;

/// Size of the fixed response header: version, status, total_len.
pub const RESPONSE_SIZE: usize = 4;

/// Largest control message accepted from a client.
///
/// Channel names are short URIs; anything larger than this is a framing
/// error rather than a legitimate request.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Payload of the datagram that carries a handed-off descriptor.
///
/// It follows the status datagram and must fit a 4-byte receive buffer.
pub const DESCRIPTOR_MESSAGE: [u8; 1] = [0];

/// Backlog passed to `listen(2)` on the control socket.
pub const LISTEN_BACKLOG: i32 = 128;

// ============================================================================
// Buffers
// ============================================================================

/// Default board size when a request carries a zero capacity hint (4 MiB).
pub const DEFAULT_BUFFER_SIZE: u64 = 4 * 1024 * 1024;

/// Smallest permitted default board size.
///
/// A board must fit at least one maximum-sized datagram.
pub const MINIMUM_BUFFER_SIZE: u64 = u16::MAX as u64;

/// Largest board a single request may ask for (1 GiB).
pub const MAX_BUFFER_SIZE: u64 = 1024 * 1024 * 1024;

// ============================================================================
// Paths
// ============================================================================

/// Root directory under which every vlan keeps its socket and log file.
pub const MANAGER_ROOT: &str = "/spare/local/.smb_manager";

/// Socket location relative to the vlan directory.
pub const SOCKET_SUFFIX: &str = "sock/s";

/// Log file name relative to the vlan directory.
pub const LOG_FILE_NAME: &str = "smb_manager.log";

/// Suffix given to the previous run's log file on startup.
pub const LOG_BACKUP_SUFFIX: &str = ".last";

/// Maximum path length for a Unix domain socket (Linux `sun_path`).
pub const MAX_SOCK_PATH: usize = 108;

// ============================================================================
// Polling
// ============================================================================

/// How often the accept loop re-checks the shutdown flag while idle.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
