//! Full end-to-end pipeline tests for the channel broker.
//!
//! These run the real accept loop and session threads against a socket in a
//! temp directory, and talk to it through [`BrokerConnection`] exactly like
//! an external client would.
//!
//! # Pipeline under test
//!
//! ```text
//! BrokerConnection::open_channel(name, capacity)
//!   → seqpacket datagram to the accept loop's session thread
//!   → ControlRequest::decode → ChannelRegistry::attach
//!   → SharedMemoryFactory::create (first request only)
//!   → status datagram, then SCM_RIGHTS dup in a second datagram
//! ```

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::connection::{descriptor_size, BrokerConnection, RequestRefused};
use super::endpoint::{EndpointFactories, SharedMemoryFactory};
use super::error::Status;
use super::handoff;
use super::protocol::{encode_request, ChannelName};
use super::registry::{ChannelRegistry, TeardownPolicy};
use super::BrokerServer;
use crate::permissions::AccessPolicy;

/// A broker serving on a temp socket from a background thread.
struct TestBroker {
    socket_path: PathBuf,
    registry: Arc<ChannelRegistry>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestBroker {
    fn start(policy: AccessPolicy, teardown: TeardownPolicy) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("sock/s");

        let board = Arc::new(SharedMemoryFactory::new(65536, 1 << 20));
        let registry = Arc::new(ChannelRegistry::new(EndpointFactories::new(board), teardown));
        let server = BrokerServer::bind(&socket_path, Arc::clone(&registry), policy).expect("bind broker");
        let shutdown = server.shutdown_flag();

        let thread = std::thread::spawn(move || {
            server.serve().expect("serve");
        });

        Self {
            socket_path,
            registry,
            shutdown,
            thread: Some(thread),
            _dir: dir,
        }
    }

    fn for_current_user() -> Self {
        Self::start(own_policy(), TeardownPolicy::Immediate)
    }

    fn connect(&self) -> BrokerConnection {
        BrokerConnection::connect(&self.socket_path).expect("connect")
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread.join().expect("broker thread panicked");
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn own_policy() -> AccessPolicy {
    let uid = unsafe { libc::geteuid() };
    AccessPolicy::from_ids([uid], [])
}

fn name(s: &str) -> ChannelName {
    ChannelName::try_from(s).unwrap()
}

/// Poll `cond` every 10 ms until it holds or `timeout` elapses.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn pwrite(fd: BorrowedFd<'_>, bytes: &[u8], offset: i64) {
    let n = unsafe { libc::pwrite(fd.as_raw_fd(), bytes.as_ptr() as *const libc::c_void, bytes.len(), offset) };
    assert_eq!(n as usize, bytes.len(), "pwrite: {}", std::io::Error::last_os_error());
}

fn pread(fd: BorrowedFd<'_>, len: usize, offset: i64) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let n = unsafe { libc::pread(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, len, offset) };
    assert_eq!(n as usize, len, "pread: {}", std::io::Error::last_os_error());
    buf
}

fn refused_status(err: &anyhow::Error) -> Status {
    err.downcast_ref::<RequestRefused>()
        .map(|r| r.status)
        .unwrap_or_else(|| panic!("expected RequestRefused, got {err:#}"))
}

#[test]
fn test_two_clients_share_one_board() {
    let broker = TestBroker::for_current_user();

    let mut writer = broker.connect();
    let mut reader = broker.connect();
    let w = writer.open_channel("smbcast://test.0", 1024).expect("writer open");
    let r = reader.open_channel("smbcast://test.0", 8192).expect("reader open");

    // Page-rounded size of the first request; the second hint is ignored.
    let size = descriptor_size(w.as_fd()).unwrap();
    assert_eq!(size, descriptor_size(r.as_fd()).unwrap());
    assert!(size >= 1024);

    pwrite(w.as_fd(), b"tick", 16);
    assert_eq!(pread(r.as_fd(), 4, 16), b"tick");

    assert_eq!(broker.registry.len(), 1);
    assert_eq!(broker.registry.refcount(&name("smbcast://test.0")), Some(2));
}

#[test]
fn test_disconnect_releases_holdings() {
    let broker = TestBroker::for_current_user();
    let channel = name("smbcast://drop.me");

    let mut first = broker.connect();
    let fd = first.open_channel("smbcast://drop.me", 0).unwrap();
    first.open_channel("smbcast://drop.me", 0).unwrap();

    let mut second = broker.connect();
    second.open_channel("smbcast://drop.me", 0).unwrap();
    assert_eq!(broker.registry.refcount(&channel), Some(3));

    drop(first);
    assert!(wait_until(Duration::from_secs(2), || broker.registry.refcount(&channel) == Some(1)));

    drop(second);
    assert!(wait_until(Duration::from_secs(2), || broker.registry.is_empty()));

    // The client's copy outlives the broker's teardown.
    assert_eq!(descriptor_size(fd.as_fd()).unwrap(), 65536);
}

#[test]
fn test_session_survives_bad_requests() {
    let broker = TestBroker::for_current_user();
    let mut conn = broker.connect();

    let (resp, fd) = conn.request_raw(&[0x02, b'W', 4, 0]).unwrap();
    assert_eq!(resp.status, Status::MalformedMessage);
    assert!(fd.is_none());

    let (resp, fd) = conn.request_raw(&encode_request(2, b'X', 1024, b"smbcast://test.0\0")).unwrap();
    assert_eq!(resp.status, Status::UnsupportedOperation);
    assert!(fd.is_none());

    let (resp, fd) = conn.request_raw(&encode_request(3, b'W', 1024, b"smbcast://test.0\0")).unwrap();
    assert_eq!(resp.status, Status::MalformedMessage);
    assert!(fd.is_none());
    assert!(broker.registry.is_empty());

    // Same connection still works.
    conn.open_channel("smbcast://test.0", 1024).expect("valid request after errors");
    assert_eq!(broker.registry.len(), 1);
}

#[test]
fn test_empty_datagram_is_malformed_not_a_hangup() {
    let broker = TestBroker::for_current_user();
    let mut conn = broker.connect();

    let (resp, fd) = conn.request_raw(&[]).unwrap();
    assert_eq!(resp.status, Status::MalformedMessage);
    assert!(fd.is_none());

    conn.open_channel("smbcast://test.0", 0).expect("session still open");
}

#[test]
fn test_client_gone_before_reply_rolls_back() {
    let broker = TestBroker::for_current_user();
    let channel = name("smbcast://gone");

    let conn = broker.connect();
    handoff::send_datagram(conn.as_fd(), &encode_request(2, b'W', 0, b"smbcast://gone\0"), None).unwrap();
    drop(conn);

    // The reply fails, so the attach is undone and the channel torn down.
    assert!(wait_until(Duration::from_secs(2), || broker.registry.is_empty()));

    let mut next = broker.connect();
    next.open_channel("smbcast://gone", 0).expect("attach after vanished peer");
    assert!(wait_until(Duration::from_secs(2), || broker.registry.refcount(&channel) == Some(1)));
}

#[test]
fn test_oversized_datagram_is_malformed() {
    let broker = TestBroker::for_current_user();
    let mut conn = broker.connect();

    let mut huge = vec![b'a'; 8000];
    huge.push(0);
    let (resp, fd) = conn.request_raw(&encode_request(2, b'W', 0, &huge)).unwrap();
    assert_eq!(resp.status, Status::MalformedMessage);
    assert!(fd.is_none());
}

#[test]
fn test_capacity_over_limit_is_resource_exhausted() {
    let broker = TestBroker::for_current_user();
    let mut conn = broker.connect();

    let err = conn.open_channel("smbcast://huge", 1 << 30).unwrap_err();
    assert_eq!(refused_status(&err), Status::ResourceExhausted);
    assert!(broker.registry.is_empty());
}

#[test]
fn test_foreign_peer_is_denied() {
    let broker = TestBroker::start(AccessPolicy::from_ids([u32::MAX - 1], [u32::MAX - 1]), TeardownPolicy::Immediate);
    let mut conn = broker.connect();

    let err = conn.open_channel("smbcast://test.0", 1024).unwrap_err();
    assert_eq!(refused_status(&err), Status::PermissionDenied);
    assert!(broker.registry.is_empty());
}

#[test]
fn test_retain_policy_keeps_channel_after_disconnect() {
    let broker = TestBroker::start(own_policy(), TeardownPolicy::Retain);
    let channel = name("smbcast://sticky");

    let mut conn = broker.connect();
    conn.open_channel("smbcast://sticky", 0).unwrap();
    drop(conn);

    assert!(wait_until(Duration::from_secs(2), || broker.registry.refcount(&channel) == Some(0)));
    assert_eq!(broker.registry.len(), 1);
}

#[test]
fn test_shutdown_closes_sessions_and_socket() {
    let mut broker = TestBroker::for_current_user();
    let mut conn = broker.connect();
    conn.open_channel("smbcast://test.0", 0).unwrap();

    broker.stop();

    assert!(!broker.socket_path.exists(), "socket file should be removed");
    assert!(broker.registry.is_empty(), "sessions should release on shutdown");
    assert!(conn.request_raw(&encode_request(2, b'W', 0, b"smbcast://test.0\0")).is_err());
}

#[test]
fn test_second_broker_on_live_socket_is_refused() {
    let broker = TestBroker::for_current_user();
    let registry = Arc::new(ChannelRegistry::new(EndpointFactories::default(), TeardownPolicy::Immediate));
    let err = BrokerServer::bind(&broker.socket_path, registry, own_policy()).unwrap_err();
    assert!(err.to_string().contains("already listening"));
}
