//! Peer credentials and the uid/gid allow-list.
//!
//! The control socket is world-accessible; access control happens here. A
//! connection is accepted if the peer's uid is in the uid set OR its gid is
//! in the gid set.
//!
//! Policy grammar:
//!
//! ```text
//! perms = entry *("," entry)
//! entry = "u:" (username / uid) / "g:" (groupname / gid)
//! ```

use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::unix::io::{AsRawFd, BorrowedFd};

use anyhow::{bail, Context, Result};

/// Credentials of the process on the other end of a Unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Peer process id.
    pub pid: i32,
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
}

impl PeerCredentials {
    /// Read `SO_PEERCRED` from a connected Unix socket.
    pub fn of(sock: BorrowedFd<'_>) -> std::io::Result<Self> {
        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        // SAFETY: `cred` and `len` are valid out-parameters sized for ucred.
        let ret = unsafe {
            libc::getsockopt(
                sock.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut libc::ucred as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            pid: cred.pid,
            uid: cred.uid,
            gid: cred.gid,
        })
    }
}

impl fmt::Display for PeerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={} uid={} gid={}", self.pid, self.uid, self.gid)
    }
}

impl PeerCredentials {
    /// Credentials with the user and group names resolved, for logging.
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            creds: *self,
            user: user_name(self.uid),
            group: group_name(self.gid),
        }
    }
}

/// Peer credentials plus resolved user and group names.
///
/// Displays as `process 1234, user alice (1000), group staff (50)`, with
/// `<unknown>` for ids missing from the databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Raw credentials.
    pub creds: PeerCredentials,
    /// User name for `creds.uid`, if known.
    pub user: Option<String>,
    /// Group name for `creds.gid`, if known.
    pub group: Option<String>,
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "process {}, user {} ({}), group {} ({})",
            self.creds.pid,
            self.user.as_deref().unwrap_or("<unknown>"),
            self.creds.uid,
            self.group.as_deref().unwrap_or("<unknown>"),
            self.creds.gid
        )
    }
}

/// Permitted uid and gid sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    uids: BTreeSet<u32>,
    gids: BTreeSet<u32>,
}

impl AccessPolicy {
    /// Parse a policy string such as `u:alice,u:1001,g:traders`.
    ///
    /// Names are resolved through the system user and group databases.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut policy = Self::default();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some(user) = entry.strip_prefix("u:") {
                let uid = match user.parse::<u32>() {
                    Ok(uid) => uid,
                    Err(_) => lookup_uid(user)?,
                };
                policy.uids.insert(uid);
            } else if let Some(group) = entry.strip_prefix("g:") {
                let gid = match group.parse::<u32>() {
                    Ok(gid) => gid,
                    Err(_) => lookup_gid(group)?,
                };
                policy.gids.insert(gid);
            } else {
                bail!("invalid permission entry '{entry}' (expected u:<user> or g:<group>)");
            }
        }
        if policy.uids.is_empty() && policy.gids.is_empty() {
            bail!("permission list '{spec}' names no users or groups");
        }
        Ok(policy)
    }

    /// Policy admitting exactly the given ids.
    pub fn from_ids(uids: impl IntoIterator<Item = u32>, gids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            uids: uids.into_iter().collect(),
            gids: gids.into_iter().collect(),
        }
    }

    /// Whether a peer with these credentials may use the broker.
    pub fn permits(&self, peer: &PeerCredentials) -> bool {
        self.uids.contains(&peer.uid) || self.gids.contains(&peer.gid)
    }

    /// Permitted uids.
    pub fn uids(&self) -> impl Iterator<Item = u32> + '_ {
        self.uids.iter().copied()
    }

    /// Permitted gids.
    pub fn gids(&self) -> impl Iterator<Item = u32> + '_ {
        self.gids.iter().copied()
    }
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uids: Vec<String> = self.uids.iter().map(u32::to_string).collect();
        let gids: Vec<String> = self.gids.iter().map(u32::to_string).collect();
        write!(f, "uids=[{}] gids=[{}]", uids.join(","), gids.join(","))
    }
}

// ─── User database ─────────────────────────────────────────────────────────

const LOOKUP_BUF_SIZE: usize = 16 * 1024;

fn lookup_uid(name: &str) -> Result<u32> {
    let cname = CString::new(name).with_context(|| format!("invalid user name '{name}'"))?;
    // SAFETY: zeroed passwd is a valid out-parameter for getpwnam_r.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; LOOKUP_BUF_SIZE];
    // SAFETY: every pointer is valid for the call; buf.len() is its capacity.
    let ret = unsafe { libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if ret != 0 {
        bail!("getpwnam_r({name}): {}", std::io::Error::from_raw_os_error(ret));
    }
    if result.is_null() {
        bail!("unknown user '{name}'");
    }
    Ok(pwd.pw_uid)
}

fn lookup_gid(name: &str) -> Result<u32> {
    let cname = CString::new(name).with_context(|| format!("invalid group name '{name}'"))?;
    // SAFETY: zeroed group is a valid out-parameter for getgrnam_r.
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; LOOKUP_BUF_SIZE];
    // SAFETY: every pointer is valid for the call; buf.len() is its capacity.
    let ret = unsafe { libc::getgrnam_r(cname.as_ptr(), &mut grp, buf.as_mut_ptr(), buf.len(), &mut result) };
    if ret != 0 {
        bail!("getgrnam_r({name}): {}", std::io::Error::from_raw_os_error(ret));
    }
    if result.is_null() {
        bail!("unknown group '{name}'");
    }
    Ok(grp.gr_gid)
}

/// User name for `uid` from the password database.
pub fn user_name(uid: u32) -> Option<String> {
    // SAFETY: zeroed passwd is a valid out-parameter for getpwuid_r.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; LOOKUP_BUF_SIZE];
    // SAFETY: every pointer is valid for the call; buf.len() is its capacity.
    let ret = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if ret != 0 || result.is_null() {
        return None;
    }
    // SAFETY: on success pw_name points into `buf` and is NUL-terminated.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

/// Group name for `gid` from the group database.
pub fn group_name(gid: u32) -> Option<String> {
    // SAFETY: zeroed group is a valid out-parameter for getgrgid_r.
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; LOOKUP_BUF_SIZE];
    // SAFETY: every pointer is valid for the call; buf.len() is its capacity.
    let ret = unsafe { libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result) };
    if ret != 0 || result.is_null() {
        return None;
    }
    // SAFETY: on success gr_name points into `buf` and is NUL-terminated.
    let name = unsafe { CStr::from_ptr(grp.gr_name) };
    Some(name.to_string_lossy().into_owned())
}

/// Name of the user running the broker: `$USER`, else the password entry
/// for the real uid.
pub fn current_user_name() -> Result<String> {
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return Ok(user);
        }
    }
    // SAFETY: getuid has no preconditions.
    let uid = unsafe { libc::getuid() };
    match user_name(uid) {
        Some(name) => Ok(name),
        None => bail!("no password entry for uid {uid}"),
    }
}
