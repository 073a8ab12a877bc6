//! Listener handoff between processes.
//!
//! A successor process inherits listening sockets at fds `3..3+N`, described
//! by `LISTEN_FDS` (count) and `LISTEN_FD_NAMES` (colon-separated names), the
//! same convention systemd socket activation uses. The old process then
//! closes its servers and drains while the successor already accepts.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use tokio::net::TcpListener;
use tracing::info;

use crate::error::{Error, Result};

const LISTEN_FDS: &str = "LISTEN_FDS";
const LISTEN_FD_NAMES: &str = "LISTEN_FD_NAMES";

/// First inherited descriptor; 0 to 2 are stdio.
const FIRST_INHERITED_FD: RawFd = 3;

/// Temporary descriptors are parked at or above this number before being
/// moved into `3..3+N`, so no source is clobbered by an earlier move.
const TEMP_FD_BASE: RawFd = 100;

/// Named listeners inherited from the parent process.
#[derive(Debug)]
pub struct ListenerSet {
    listeners: Vec<(String, TcpListener)>,
}

impl ListenerSet {
    /// Adopt listeners passed via `LISTEN_FDS` / `LISTEN_FD_NAMES`.
    ///
    /// Returns `Ok(None)` on a cold start (`LISTEN_FDS` absent or `0`). The
    /// variables are cleared afterwards so our own children do not re-inherit
    /// stale values. Must run inside a tokio runtime.
    pub fn from_env() -> Result<Option<Self>> {
        let count = match std::env::var(LISTEN_FDS) {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::inherit(format!("{LISTEN_FDS} is not a number: {raw:?}")))?,
            Err(_) => 0,
        };
        if count == 0 {
            return Ok(None);
        }

        let names_raw = std::env::var(LISTEN_FD_NAMES)
            .map_err(|_| Error::inherit(format!("{LISTEN_FDS} is set but {LISTEN_FD_NAMES} is missing")))?;
        let names = parse_names(count, &names_raw)?;

        let mut listeners = Vec::with_capacity(count);
        for (i, name) in names.into_iter().enumerate() {
            let fd = FIRST_INHERITED_FD + i as RawFd;
            if !validate_fd(fd) {
                return Err(Error::inherit(format!(
                    "Inherited fd {fd} (name: {name}) is not a valid socket"
                )));
            }

            // SAFETY: fstat confirmed `fd` is an open socket, and nothing else
            // in this process owns the inherited range.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            let listener = tcp_listener_from_fd(owned)?;
            let addr = listener.local_addr().ok();
            info!(fd, name = %name, addr = ?addr, "Inherited listener from parent process");
            listeners.push((name, listener));
        }

        std::env::remove_var(LISTEN_FDS);
        std::env::remove_var(LISTEN_FD_NAMES);

        Ok(Some(Self { listeners }))
    }

    /// Take a listener by name, removing it from the set.
    pub fn take(&mut self, name: &str) -> Result<TcpListener> {
        let pos = self
            .listeners
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| {
                Error::inherit(format!(
                    "Expected inherited listener '{}' but only have {:?}",
                    name,
                    self.names()
                ))
            })?;
        Ok(self.listeners.remove(pos).1)
    }

    /// Fail if the parent passed listeners nobody took.
    pub fn ensure_empty(self) -> Result<()> {
        if self.listeners.is_empty() {
            Ok(())
        } else {
            Err(Error::inherit(format!(
                "Unconsumed inherited listeners: {:?}",
                self.names()
            )))
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn names(&self) -> Vec<&str> {
        self.listeners.iter().map(|(n, _)| n.as_str()).collect()
    }
}

fn parse_names(count: usize, raw: &str) -> Result<Vec<String>> {
    let names: Vec<String> = raw.split(':').map(str::to_string).collect();
    if names.len() != count {
        return Err(Error::inherit(format!(
            "{LISTEN_FD_NAMES} has {} entries but {LISTEN_FDS} says {}",
            names.len(),
            count
        )));
    }
    Ok(names)
}

/// Whether `fd` is an open socket.
fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Turn a listening socket descriptor into a tokio listener.
pub fn tcp_listener_from_fd(fd: OwnedFd) -> io::Result<TcpListener> {
    let std_listener = std::net::TcpListener::from(fd);
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

/// Spawn `command` with `listeners` inherited at fds `3..3+N`.
///
/// The caller keeps its own descriptors; the child receives duplicates, so
/// the caller can go on serving (or start draining) independently.
pub fn spawn_with_listeners(mut command: Command, listeners: &[(&str, BorrowedFd<'_>)]) -> io::Result<Child> {
    if let Some((name, _)) = listeners.iter().find(|(name, _)| name.is_empty() || name.contains(':')) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("listener name {name:?} must be non-empty and must not contain ':'"),
        ));
    }

    // Park duplicates high up first. They carry CLOEXEC, so only the copies
    // made in the child below survive exec.
    let mut temps: Vec<OwnedFd> = Vec::with_capacity(listeners.len());
    for (name, fd) in listeners {
        let temp = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, TEMP_FD_BASE) };
        if temp < 0 {
            let err = io::Error::last_os_error();
            return Err(io::Error::new(
                err.kind(),
                format!("F_DUPFD_CLOEXEC failed for listener '{name}': {err}"),
            ));
        }
        // SAFETY: fcntl just returned this descriptor to us.
        temps.push(unsafe { OwnedFd::from_raw_fd(temp) });
    }

    let raw: Vec<RawFd> = temps.iter().map(AsRawFd::as_raw_fd).collect();
    let names: Vec<&str> = listeners.iter().map(|(name, _)| *name).collect();

    command
        .env(LISTEN_FDS, raw.len().to_string())
        .env(LISTEN_FD_NAMES, names.join(":"));

    // SAFETY: only async-signal-safe calls (dup2) run between fork and exec.
    unsafe {
        command.pre_exec(move || {
            for (i, temp) in raw.iter().enumerate() {
                // dup2 leaves CLOEXEC clear on the target.
                if libc::dup2(*temp, FIRST_INHERITED_FD + i as RawFd) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    info!(pid = child.id(), listeners = ?names, "Spawned process with inherited listeners");
    // `temps` drops here, closing the parent's parked copies.
    Ok(child)
}

/// Start a fresh copy of the running executable, with the same arguments,
/// inheriting `listeners`.
pub fn spawn_successor(listeners: &[(&str, BorrowedFd<'_>)]) -> io::Result<Child> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(&exe);
    command.args(std::env::args_os().skip(1));
    info!(exe = %exe.display(), listener_count = listeners.len(), "Starting successor process");
    spawn_with_listeners(command, listeners)
}
