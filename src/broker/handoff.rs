//! Descriptor handoff over `SOCK_SEQPACKET` Unix sockets.
//!
//! One datagram carries one protocol message. A success response is two
//! datagrams: the 4-byte status first, then a one-byte
//! [`DESCRIPTOR_MESSAGE`] carrying the descriptor as
//! `SOL_SOCKET`/`SCM_RIGHTS` ancillary data. A client may read the status
//! with a plain `recv` and only then call `recvmsg` for the descriptor.
//!
//! The kernel installs a fresh descriptor in the receiving process, so the
//! receiver's copy is independent of the sender's: either side may close
//! its copy without affecting the other.
//!
//! `recvmsg` returns 0 both for an empty datagram and for a closed peer.
//! The two are told apart by polling for `POLLRDHUP`/`POLLHUP`; an empty
//! datagram immediately followed by a close reads as the close.
//!
//! Both directions are used by the server and by the client connection.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use super::protocol::ControlResponse;
use crate::constants::DESCRIPTOR_MESSAGE;

/// One received datagram.
#[derive(Debug)]
pub struct Received {
    /// Payload bytes, truncated to what was actually read.
    pub data: Vec<u8>,
    /// Descriptors that arrived as `SCM_RIGHTS` ancillary data.
    pub fds: Vec<OwnedFd>,
    /// The payload did not fit the receive buffer (`MSG_TRUNC`).
    pub truncated: bool,
    /// Ancillary data was cut short (`MSG_CTRUNC`); some descriptors were lost.
    pub control_truncated: bool,
    /// Nothing was read because the peer has closed the connection.
    pub peer_closed: bool,
}

impl Received {
    /// `true` when the peer has closed the connection.
    ///
    /// An empty datagram from a live peer is not end of stream.
    pub fn is_eof(&self) -> bool {
        self.peer_closed
    }
}

// ─── Send ──────────────────────────────────────────────────────────────────

/// Send `data` as one datagram, attaching `fd` via `SCM_RIGHTS` if given.
///
/// Uses `MSG_NOSIGNAL`: a vanished peer yields `EPIPE` instead of killing
/// the process.
pub fn send_datagram(sock: BorrowedFd<'_>, data: &[u8], fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
    let fd_size = std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // SAFETY: an all-zero msghdr is a valid empty header; fields are set below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;
        // SAFETY: msg_control points at a buffer of CMSG_SPACE(int) bytes, so
        // CMSG_FIRSTHDR is non-null and CMSG_DATA has room for one int.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
            let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
            std::ptr::write_unaligned(data_ptr, fd.as_raw_fd());
        }
    }

    loop {
        // SAFETY: `msg` and the buffers it points to outlive the call.
        let n = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            if n as usize != data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short datagram: sent {n} of {} bytes", data.len()),
                ));
            }
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Send a control response, followed by `descriptor` on success.
///
/// A success response must carry a descriptor and a failure response must
/// not; anything else is rejected before touching the socket.
pub fn send_response(
    sock: BorrowedFd<'_>,
    response: &ControlResponse,
    descriptor: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    if response.status.is_success() != descriptor.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "{} response with {} descriptor",
                response.status,
                if descriptor.is_some() { "a" } else { "no" }
            ),
        ));
    }
    send_datagram(sock, &response.encode(), None)?;
    match descriptor {
        Some(fd) => send_datagram(sock, &DESCRIPTOR_MESSAGE, Some(fd)),
        None => Ok(()),
    }
}

// ─── Receive ───────────────────────────────────────────────────────────────

/// Receive one datagram of at most `max_bytes`, collecting any descriptors.
///
/// Received descriptors are marked close-on-exec. Callers that do not
/// expect descriptors just drop [`Received::fds`], which closes them.
pub fn recv_datagram(sock: BorrowedFd<'_>, max_bytes: usize) -> io::Result<Received> {
    let mut data_buf = vec![0u8; max_bytes];
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as _) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space * 4]; // room for a few FDs

    let mut iov = libc::iovec {
        iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: data_buf.len(),
    };
    // SAFETY: an all-zero msghdr is a valid empty header; fields are set below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = loop {
        // SAFETY: `msg` and the buffers it points to outlive the call.
        let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };
    data_buf.truncate(n.min(max_bytes));

    let mut fds = Vec::new();
    // SAFETY: the kernel filled msg_control with well-formed cmsghdrs up to
    // msg_controllen; every SCM_RIGHTS payload is an array of fresh fds we now own.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let fd_count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / std::mem::size_of::<libc::c_int>();
                for i in 0..fd_count {
                    let fd: RawFd = std::ptr::read_unaligned(
                        data.add(i * std::mem::size_of::<libc::c_int>()) as *const libc::c_int,
                    );
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let truncated = msg.msg_flags & libc::MSG_TRUNC != 0;
    let peer_closed = n == 0 && fds.is_empty() && !truncated && peer_hung_up(sock)?;
    Ok(Received {
        data: data_buf,
        fds,
        truncated,
        control_truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
        peer_closed,
    })
}

/// Whether the peer of a connected socket has closed its end.
fn peer_hung_up(sock: BorrowedFd<'_>) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: sock.as_raw_fd(),
        events: libc::POLLRDHUP,
        revents: 0,
    };
    loop {
        // SAFETY: `pfd` is one valid pollfd; a zero timeout never blocks.
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ret >= 0 {
            return Ok(pfd.revents & (libc::POLLRDHUP | libc::POLLHUP) != 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::error::Status;
    use socket2::{Domain, Socket, Type};
    use std::os::unix::io::AsFd;

    fn seqpacket_pair() -> (Socket, Socket) {
        Socket::pair(Domain::UNIX, Type::SEQPACKET, None).expect("socketpair")
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds: [libc::c_int; 2] = [0; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0, "pipe: {}", std::io::Error::last_os_error());
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_all(fd: BorrowedFd<'_>, bytes: &[u8]) {
        let n = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        assert_eq!(n as usize, bytes.len());
    }

    fn read_exact(fd: BorrowedFd<'_>, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, len) };
        assert_eq!(n as usize, len);
        buf
    }

    #[test]
    fn success_response_is_status_then_one_descriptor() {
        let (broker, client) = seqpacket_pair();
        let (pipe_read, pipe_write) = pipe();

        let resp = ControlResponse::new(Status::Success);
        send_response(broker.as_fd(), &resp, Some(pipe_read.as_fd())).unwrap();

        let status = recv_datagram(client.as_fd(), 1024).unwrap();
        assert_eq!(status.data, resp.encode());
        assert!(status.fds.is_empty());

        let carrier = recv_datagram(client.as_fd(), 4).unwrap();
        assert_eq!(carrier.data, DESCRIPTOR_MESSAGE);
        assert_eq!(carrier.fds.len(), 1);
        assert!(!carrier.truncated);

        write_all(pipe_write.as_fd(), b"through SCM_RIGHTS");
        assert_eq!(read_exact(carrier.fds[0].as_fd(), 18), b"through SCM_RIGHTS");
    }

    #[test]
    fn plain_recv_of_status_leaves_descriptor_for_recvmsg() {
        let (broker, client) = seqpacket_pair();
        let (pipe_read, pipe_write) = pipe();
        send_response(broker.as_fd(), &ControlResponse::new(Status::Success), Some(pipe_read.as_fd()))
            .unwrap();

        // recv(1024) with no ancillary buffer, as simple clients do.
        let mut buf = [0u8; 1024];
        let n = unsafe { libc::recv(client.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        assert_eq!(n, 4);
        assert_eq!(buf[1], Status::Success.as_u8());

        let mut got = recv_datagram(client.as_fd(), 4).unwrap();
        let fd = got.fds.pop().expect("descriptor after the status");
        write_all(pipe_write.as_fd(), b"ok");
        assert_eq!(read_exact(fd.as_fd(), 2), b"ok");
    }

    #[test]
    fn received_descriptor_survives_sender_close() {
        let (broker, client) = seqpacket_pair();
        let (pipe_read, pipe_write) = pipe();

        send_response(broker.as_fd(), &ControlResponse::new(Status::Success), Some(pipe_read.as_fd()))
            .unwrap();
        drop(pipe_read);

        recv_datagram(client.as_fd(), 16).unwrap();
        let mut got = recv_datagram(client.as_fd(), 16).unwrap();
        let received = got.fds.pop().expect("one descriptor");
        write_all(pipe_write.as_fd(), b"independent");
        assert_eq!(read_exact(received.as_fd(), 11), b"independent");
    }

    #[test]
    fn failure_response_carries_no_descriptor() {
        let (broker, client) = seqpacket_pair();
        send_response(broker.as_fd(), &ControlResponse::new(Status::NotFound), None).unwrap();

        let got = recv_datagram(client.as_fd(), 16).unwrap();
        assert_eq!(got.data, [2, Status::NotFound.as_u8(), 4, 0]);
        assert!(got.fds.is_empty());
    }

    #[test]
    fn mismatched_status_and_descriptor_is_refused() {
        let (broker, _client) = seqpacket_pair();
        let (pipe_read, _pipe_write) = pipe();

        let err = send_response(broker.as_fd(), &ControlResponse::new(Status::Success), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = send_response(
            broker.as_fd(),
            &ControlResponse::new(Status::ResourceExhausted),
            Some(pipe_read.as_fd()),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn oversized_datagram_is_flagged_truncated() {
        let (a, b) = seqpacket_pair();
        send_datagram(a.as_fd(), &[7u8; 64], None).unwrap();

        let got = recv_datagram(b.as_fd(), 8).unwrap();
        assert!(got.truncated);
        assert_eq!(got.data.len(), 8);
    }

    #[test]
    fn peer_close_reads_as_eof() {
        let (a, b) = seqpacket_pair();
        drop(a);
        let got = recv_datagram(b.as_fd(), 16).unwrap();
        assert!(got.is_eof());
    }

    #[test]
    fn empty_datagram_from_live_peer_is_not_eof() {
        let (a, b) = seqpacket_pair();
        send_datagram(a.as_fd(), &[], None).unwrap();

        let got = recv_datagram(b.as_fd(), 16).unwrap();
        assert!(got.data.is_empty());
        assert!(!got.is_eof());
    }

    #[test]
    fn send_to_closed_peer_is_an_error_not_a_signal() {
        let (a, b) = seqpacket_pair();
        drop(b);
        assert!(send_datagram(a.as_fd(), b"x", None).is_err());
    }
}
