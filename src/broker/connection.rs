//! Client-side broker connection.
//!
//! Opens the control socket, sends `'W'` requests and collects the
//! descriptor that comes back with a success response.
//!
//! # Lifecycle
//!
//! ```text
//! BrokerConnection::connect(path)
//!        │
//! open_channel("smbcast://test.0", 1024) ──► [2|'W'|25|1024|name\0]
//!        ◄── [2|0|4] ──────────────────┘
//!        ◄── [0] + SCM_RIGHTS fd             (fd maps the shared board)
//!        │
//! drop ──► broker releases every channel this connection was handed
//! ```

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use socket2::{Domain, SockAddr, Socket, Type};

use super::error::Status;
use super::handoff;
use super::protocol::{ChannelName, ControlRequest, ControlResponse, Operation};
use crate::constants::{DESCRIPTOR_MESSAGE, MAX_MESSAGE_SIZE};

/// The broker answered a request with a non-success status.
#[derive(Debug, thiserror::Error)]
#[error("broker answered \"{status}\" for {name}")]
pub struct RequestRefused {
    /// Channel named in the request.
    pub name: String,
    /// Status the broker sent.
    pub status: Status,
}

/// Client connection to a running broker.
#[derive(Debug)]
pub struct BrokerConnection {
    socket: Socket,
}

impl BrokerConnection {
    /// Connect to the broker socket at `path`.
    ///
    /// Sets a 5-second read timeout so a wedged broker cannot hang the
    /// caller forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket does not exist, the connection is
    /// refused, or the timeout cannot be configured.
    pub fn connect(path: &Path) -> Result<Self> {
        let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None).context("create client socket")?;
        let addr = SockAddr::unix(path).with_context(|| format!("socket address: {}", path.display()))?;
        socket
            .connect(&addr)
            .with_context(|| format!("connect to broker socket: {}", path.display()))?;
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .context("set broker socket read timeout")?;
        Ok(Self { socket })
    }

    /// Ask for a descriptor for channel `name`, creating it with `capacity`
    /// bytes if it does not exist yet (`0` for the broker's default).
    ///
    /// # Errors
    ///
    /// [`RequestRefused`] if the broker answers with a failure status; any
    /// other error means the transport or the response itself was broken.
    pub fn open_channel(&mut self, name: &str, capacity: u32) -> Result<OwnedFd> {
        let channel = ChannelName::try_from(name).with_context(|| format!("invalid channel name {name:?}"))?;
        let request = ControlRequest::new(Operation::OpcodeW, capacity, channel);

        let (response, fd) = self.request_raw(&request.encode())?;
        match (response.status, fd) {
            (Status::Success, Some(fd)) => Ok(fd),
            (Status::Success, None) => bail!("broker reported success for {name} without a descriptor"),
            (status, _) => Err(RequestRefused {
                name: name.to_string(),
                status,
            }
            .into()),
        }
    }

    /// Send raw request bytes and return the decoded response together with
    /// the descriptor that followed it, if any.
    ///
    /// Useful for exercising the broker with deliberately malformed input.
    pub fn request_raw(&mut self, request: &[u8]) -> Result<(ControlResponse, Option<OwnedFd>)> {
        handoff::send_datagram(self.socket.as_fd(), request, None).context("send request to broker")?;

        let received = self.recv_message().context("receive response from broker")?;
        let response = ControlResponse::decode(&received.data)?;
        if !received.fds.is_empty() {
            bail!("broker attached a descriptor to the status message");
        }
        if !response.status.is_success() {
            return Ok((response, None));
        }

        let carrier = self.recv_message().context("receive descriptor from broker")?;
        if carrier.data != DESCRIPTOR_MESSAGE {
            bail!("unexpected descriptor message {:?}", carrier.data);
        }
        let mut fds = carrier.fds.into_iter();
        let fd = fds.next();
        if fds.len() > 0 {
            bail!("broker sent {} descriptors, expected at most one", fds.len() + 1);
        }
        Ok((response, fd))
    }

    fn recv_message(&self) -> Result<handoff::Received> {
        let received = handoff::recv_datagram(self.socket.as_fd(), MAX_MESSAGE_SIZE)?;
        if received.is_eof() {
            bail!("broker closed connection unexpectedly");
        }
        if received.truncated {
            bail!("broker message exceeds {MAX_MESSAGE_SIZE} bytes");
        }
        Ok(received)
    }

    /// Borrow the underlying control socket.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

/// Size in bytes of the object behind `fd`, via `fstat`.
pub fn descriptor_size(fd: BorrowedFd<'_>) -> Result<u64> {
    // SAFETY: zeroed stat is a valid out-parameter for fstat.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `fd` is open for the duration of the call.
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
        bail!("fstat descriptor: {}", std::io::Error::last_os_error());
    }
    u64::try_from(st.st_size).context("negative descriptor size")
}

// ─── Tests ─────────────────────────────────────────────────────────────────
