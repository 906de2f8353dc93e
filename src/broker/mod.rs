//! Channel broker: hands out descriptors for named broadcast channels.
//!
//! # Architecture
//!
//! ```text
//! client ──connect──► control socket (SOCK_SEQPACKET)
//!        ──[ver|'W'|len|capacity|name\0]──► session thread
//!                                           │ decode
//!                                           │ registry.attach(name, capacity)
//!                                           │   └─ factory.create() on first use
//!        ◄──[ver|status|4]──────────────────┤
//!        ◄──[0] + SCM_RIGHTS fd─────────────┘ (success only)
//!
//! client disconnects → session releases every channel it was handed
//! last holder gone   → channel endpoint destroyed (immediate policy)
//! ```
//!
//! One accept thread, one thread per connection. The [`ChannelRegistry`] is
//! the only shared state and is passed around as `Arc`.
//!
//! Per-connection state machine:
//!
//! ```text
//! AWAITING_REQUEST → PROCESSING → RESPONDING → AWAITING_REQUEST
//!                                            ↘ CLOSED (peer gone / send failed)
//! ```
//!
//! Protocol errors and registry errors are answered with a status and the
//! session continues. Only transport failures close it.

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod handoff;
pub mod protocol;
pub mod registry;
pub mod session;

#[cfg(test)]
mod integration_test_full;

pub use connection::BrokerConnection;

use anyhow::{Context, Result};
use socket2::{Domain, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::BrokerConfig;
use crate::constants::{ACCEPT_POLL_INTERVAL, LISTEN_BACKLOG, MAX_MESSAGE_SIZE};
use crate::permissions::{AccessPolicy, PeerCredentials};
use endpoint::{EndpointFactories, SharedMemoryFactory};
use error::{BrokerError, Status};
use protocol::{ControlRequest, ControlResponse, Operation};
use registry::{Attachment, ChannelRegistry};
use session::ClientSession;

// ─── Request processing ────────────────────────────────────────────────────

/// Outcome of processing one request: the status to send and, on success,
/// the attachment whose descriptor goes with it.
#[derive(Debug)]
struct Reply {
    status: Status,
    attachment: Option<Attachment>,
}

impl Reply {
    fn failure(err: &BrokerError) -> Self {
        Self {
            status: err.status(),
            attachment: None,
        }
    }
}

/// PROCESSING: decode one datagram and run it against the registry.
fn process_request(registry: &ChannelRegistry, session: &ClientSession, datagram: &[u8]) -> Reply {
    let request = match ControlRequest::decode(datagram) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("[session {}] rejected request: {e}", session.id());
            return Reply::failure(&e);
        }
    };

    match request.operation {
        Operation::OpcodeW => match registry.attach(&request.name, request.param) {
            Ok(attachment) => {
                log::info!(
                    "[session {}] attached \"{}\" ({} bytes, {} holder(s){})",
                    session.id(),
                    request.name,
                    attachment.buffer_size,
                    attachment.refcount,
                    if attachment.created { ", new" } else { "" }
                );
                Reply {
                    status: Status::Success,
                    attachment: Some(attachment),
                }
            }
            Err(e) => {
                log::warn!("[session {}] attach \"{}\" failed: {e}", session.id(), request.name);
                Reply::failure(&e)
            }
        },
    }
}

// ─── Connection handler ────────────────────────────────────────────────────

/// Serve one client connection until it closes.
///
/// Whatever way the loop ends, every channel the session acquired is
/// released.
fn handle_connection(stream: Socket, session_id: u64, registry: Arc<ChannelRegistry>, policy: &AccessPolicy) {
    let peer = match PeerCredentials::of(stream.as_fd()) {
        Ok(peer) => peer,
        Err(e) => {
            log::warn!("[broker] connection {session_id}: cannot read peer credentials: {e}");
            return;
        }
    };

    if !policy.permits(&peer) {
        log::warn!("[broker] rejected connection {session_id} from {}", peer.identity());
        let denied = BrokerError::PermissionDenied {
            uid: peer.uid,
            gid: peer.gid,
        };
        // The denial answers the client's first request.
        match handoff::recv_datagram(stream.as_fd(), MAX_MESSAGE_SIZE) {
            Ok(received) if received.is_eof() => {}
            Ok(_) => {
                let response = ControlResponse::new(denied.status());
                if let Err(e) = handoff::send_response(stream.as_fd(), &response, None) {
                    log::warn!("[broker] connection {session_id}: send denial failed: {e}");
                }
            }
            Err(e) => log::warn!("[broker] connection {session_id}: receive failed: {e}"),
        }
        return;
    }
    log::info!("[broker] accepted connection {session_id} from {}", peer.identity());

    let release_registry = Arc::clone(&registry);
    let mut session = scopeguard::guard(ClientSession::new(session_id, peer), move |mut session| {
        let outstanding = session.total_outstanding();
        let released = session.release_all(&release_registry);
        log::info!(
            "[session {}] disconnected, released {released}/{outstanding} holding(s)",
            session.id()
        );
    });

    loop {
        // AWAITING_REQUEST
        let received = match handoff::recv_datagram(stream.as_fd(), MAX_MESSAGE_SIZE) {
            Ok(received) => received,
            Err(e) => {
                log::warn!("[session {session_id}] receive failed: {e}");
                break;
            }
        };
        if received.is_eof() {
            break;
        }
        if !received.fds.is_empty() {
            log::debug!(
                "[session {session_id}] closing {} unexpected descriptor(s)",
                received.fds.len()
            );
        }

        // PROCESSING
        let reply = if received.truncated {
            let err = BrokerError::MalformedMessage(format!("request exceeds {MAX_MESSAGE_SIZE} bytes"));
            log::warn!("[session {session_id}] rejected request: {err}");
            Reply::failure(&err)
        } else {
            process_request(&registry, &session, &received.data)
        };
        drop(received);

        // RESPONDING
        let response = ControlResponse {
            version: session.version(),
            status: reply.status,
        };
        let descriptor = reply.attachment.as_ref().map(|a| a.descriptor.as_fd());
        let sent = handoff::send_response(stream.as_fd(), &response, descriptor);

        match (sent, reply.attachment) {
            (Ok(()), Some(attachment)) => session.record(attachment.handle),
            (Ok(()), None) => {}
            (Err(e), attachment) => {
                log::warn!("[session {session_id}] send failed: {e}");
                if let Some(attachment) = attachment {
                    // Never reached the client, so it is not a holding.
                    if let Err(e) = registry.release(&attachment.handle) {
                        log::warn!("[session {session_id}] rollback release failed: {e}");
                    }
                }
                break;
            }
        }
    }
    // CLOSED: the scope guard releases the session's holdings.
}

// ─── Server ────────────────────────────────────────────────────────────────

/// Live connections, so shutdown can wake their blocked receives.
type ConnectionTable = Arc<Mutex<HashMap<u64, Socket>>>;

/// Bound control socket plus the state shared with connection threads.
#[derive(Debug)]
pub struct BrokerServer {
    listener: Socket,
    socket_path: PathBuf,
    registry: Arc<ChannelRegistry>,
    policy: Arc<AccessPolicy>,
    shutdown: Arc<AtomicBool>,
    next_session: AtomicU64,
}

impl BrokerServer {
    /// Bind the control socket at `socket_path`.
    ///
    /// The parent directory is created if needed and made world-accessible;
    /// access is controlled by peer credentials. A stale socket file left by
    /// a dead broker is replaced, but a live broker on the same path is an
    /// error.
    pub fn bind(socket_path: &Path, registry: Arc<ChannelRegistry>, policy: AccessPolicy) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create broker socket dir: {}", parent.display()))?;
            set_mode(parent, 0o777);
        }

        if socket_path.exists() {
            if BrokerConnection::connect(socket_path).is_ok() {
                anyhow::bail!("another broker is already listening on {}", socket_path.display());
            }
            std::fs::remove_file(socket_path)
                .with_context(|| format!("remove stale socket: {}", socket_path.display()))?;
        }

        let listener = Socket::new(Domain::UNIX, Type::SEQPACKET, None).context("create control socket")?;
        let addr = SockAddr::unix(socket_path)
            .with_context(|| format!("socket address: {}", socket_path.display()))?;
        listener
            .bind(&addr)
            .with_context(|| format!("bind broker socket: {}", socket_path.display()))?;
        listener.listen(LISTEN_BACKLOG).context("listen on broker socket")?;
        listener.set_nonblocking(true).context("set listener non-blocking")?;
        set_mode(socket_path, 0o777);

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            registry,
            policy: Arc::new(policy),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_session: AtomicU64::new(1),
        })
    }

    /// Path the server is listening on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Flag that stops [`BrokerServer::serve`] when set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Use an externally owned shutdown flag (e.g. one wired to signals).
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Accept connections until the shutdown flag is set.
    ///
    /// On shutdown, open connections are shut down, their threads joined
    /// (which releases their holdings) and the socket file removed.
    pub fn serve(&self) -> Result<()> {
        log::info!("[broker] listening on {}", self.socket_path.display());

        let connections: ConnectionTable = Arc::new(Mutex::new(HashMap::new()));
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    match self.spawn_connection(stream, id, &connections) {
                        Ok(worker) => workers.push(worker),
                        Err(e) => log::warn!("[broker] connection {id}: {e:#}"),
                    }
                    workers.retain(|w| !w.is_finished());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("[broker] accept failed: {e}");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        log::info!("[broker] shutting down ({} connection(s) open)", workers.len());
        if let Ok(table) = connections.lock() {
            for stream in table.values() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: Socket, id: u64, connections: &ConnectionTable) -> Result<JoinHandle<()>> {
        // Accepted sockets must block; the listener does not.
        stream.set_nonblocking(false).context("set connection blocking")?;
        let waker = stream.try_clone().context("clone connection socket")?;

        let registry = Arc::clone(&self.registry);
        let policy = Arc::clone(&self.policy);
        let table = Arc::clone(connections);
        track_connection(connections, id, waker, move || {
            thread::Builder::new().name(format!("session-{id}")).spawn(move || {
                handle_connection(stream, id, registry, &policy);
                if let Ok(mut table) = table.lock() {
                    table.remove(&id);
                }
            })
        })
        .context("spawn session thread")
    }
}

/// Enter `waker` in the connection table, then start the session with
/// `spawn`. The entry is removed again if the thread cannot be started.
fn track_connection(
    connections: &ConnectionTable,
    id: u64,
    waker: Socket,
    spawn: impl FnOnce() -> std::io::Result<JoinHandle<()>>,
) -> std::io::Result<JoinHandle<()>> {
    if let Ok(mut table) = connections.lock() {
        table.insert(id, waker);
    }
    let spawned = spawn();
    if spawned.is_err() {
        if let Ok(mut table) = connections.lock() {
            table.remove(&id);
        }
    }
    spawned
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        log::warn!("[broker] chmod {mode:o} {}: {e}", path.display());
    }
}

// ─── Main entry point ──────────────────────────────────────────────────────

/// Build the registry described by `config`.
pub fn registry_from_config(config: &BrokerConfig) -> Arc<ChannelRegistry> {
    let board = Arc::new(SharedMemoryFactory::new(config.default_buffer_size, config.max_buffer_size));
    let mut factories = EndpointFactories::new(board.clone());
    factories.register("smbcast", board);
    Arc::new(ChannelRegistry::new(factories, config.teardown))
}

/// Run the broker until `shutdown` is set.
///
/// Every endpoint is destroyed and the socket file removed before returning.
pub fn run(config: &BrokerConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let policy = config.access_policy()?;
    let socket_path = config.socket_path();

    log::info!(
        "[broker] starting: vlan={} socket={} permitted {policy} default_buffer={} max_buffer={} teardown={}",
        config.vlan,
        socket_path.display(),
        config.default_buffer_size,
        config.max_buffer_size,
        config.teardown
    );

    let registry = registry_from_config(config);
    let server = BrokerServer::bind(&socket_path, Arc::clone(&registry), policy)?.with_shutdown_flag(shutdown);
    server.serve()?;
    drop(server);

    let remaining = registry.len();
    registry.shutdown();
    log::info!("[broker] exiting, destroyed {remaining} channel(s)");
    Ok(())
}
