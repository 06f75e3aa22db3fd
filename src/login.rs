//! Login and session bookkeeping.
//!
//! A [`Login`] aggregates everything the daemon tracks for one UID: its
//! password-database identity, the sessions attached to it, the PIDs of
//! the service manager and its helper jobs, and the per-user filesystem
//! handles. A [`Session`] is a single authenticated client connection and
//! never outlives its login.

use std::fs;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::timer::Timer;
use nix::unistd::{Pid, Uid, User};

use crate::config::{self, Config};

/// One authenticated client connection.
pub struct Session {
    /// The accepted connection; dropping the session closes it.
    pub fd: OwnedFd,
}

/// Per-UID state.
pub struct Login {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub username: String,
    pub homedir: PathBuf,
    pub shell: PathBuf,

    /// Expanded rundir path; empty when the login has none.
    pub rundir: String,
    /// This daemon created the rundir and is responsible for removing it.
    pub manage_rdir: bool,

    pub sessions: Vec<Session>,

    /// The long-lived service manager.
    pub srv_pid: Option<Pid>,
    /// The boot-wait helper.
    pub start_pid: Option<Pid>,
    /// The service manager after SIGTERM has been sent.
    pub term_pid: Option<Pid>,

    /// True from fork until the boot helper reports success.
    pub srv_wait: bool,
    /// A restart was requested while the previous instance terminates.
    pub srv_pending: bool,
    /// The ready pipe has not yet been registered in the poll set.
    pub pipe_queued: bool,
    /// One SIGTERM escalation has already been retried.
    pub kill_tried: bool,
    /// Placeholder entry; identity fields are stale until refreshed.
    pub repopulate: bool,

    /// One-shot monotonic timer; `Some` while armed.
    pub timer: Option<Timer>,

    /// Descriptor on the per-user state directory.
    pub dirfd: Option<OwnedFd>,
    /// Absolute path of that directory, kept for teardown.
    pub dir_path: Option<PathBuf>,
    /// Read side of the readiness FIFO.
    pub userpipe: Option<OwnedFd>,

    /// Bytes received from the readiness FIFO, up to the NUL terminator.
    pub srvstr: Vec<u8>,
}

impl Login {
    pub fn new(uid: libc::uid_t) -> Self {
        Self {
            uid,
            gid: 0,
            username: String::new(),
            homedir: PathBuf::new(),
            shell: PathBuf::new(),
            rundir: String::new(),
            manage_rdir: false,
            sessions: Vec::new(),
            srv_pid: None,
            start_pid: None,
            term_pid: None,
            srv_wait: true,
            srv_pending: false,
            pipe_queued: false,
            kill_tried: false,
            repopulate: false,
            timer: None,
            dirfd: None,
            dir_path: None,
            userpipe: None,
            srvstr: Vec::with_capacity(256),
        }
    }

    /// Whether a service-manager process still belongs to this login, in
    /// either its running or its terminating incarnation.
    pub fn srv_live(&self) -> bool {
        self.srv_pid.is_some() || self.term_pid.is_some()
    }

    pub fn has_session(&self, fd: RawFd) -> bool {
        self.sessions.iter().any(|s| s.fd.as_raw_fd() == fd)
    }

    /// Remove the session holding `fd`, returning it so the caller decides
    /// when the descriptor actually closes.
    pub fn take_session(&mut self, fd: RawFd) -> Option<Session> {
        let pos = self.sessions.iter().position(|s| s.fd.as_raw_fd() == fd)?;
        Some(self.sessions.remove(pos))
    }

    /// Move the service manager into its terminating state. Returns the
    /// PID to signal, if one is running.
    pub fn mark_stopping(&mut self) -> Option<Pid> {
        let pid = self.srv_pid.take();
        if pid.is_some() {
            self.term_pid = pid;
        }
        self.start_pid = None;
        self.srv_wait = true;
        pid
    }

    /// Tear down the per-user state directory and release its descriptor.
    /// The ready pipe is not touched here; it retires through the poll
    /// set so no stale entry is left behind.
    pub fn remove_sdir(&mut self) {
        if let Some(dir) = self.dir_path.take() {
            crate::scaffold::login_dir_remove(&dir);
        }
        self.dirfd = None;
    }
}

/// The table of logins the daemon currently cares about.
#[derive(Default)]
pub struct Registry {
    logins: Vec<Login>,
}

impl Registry {
    pub fn iter(&self) -> impl Iterator<Item = &Login> {
        self.logins.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Login> {
        self.logins.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.logins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logins.is_empty()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Login> {
        self.logins.get_mut(idx)
    }

    pub fn index_by_uid(&self, uid: libc::uid_t) -> Option<usize> {
        self.logins.iter().position(|l| l.uid == uid)
    }

    /// The login owning the session connection `fd`.
    pub fn index_by_conn(&self, fd: RawFd) -> Option<usize> {
        self.logins.iter().position(|l| l.has_session(fd))
    }

    /// The login whose readiness pipe is `fd`.
    pub fn index_by_pipe(&self, fd: RawFd) -> Option<usize> {
        self.logins.iter().position(|l| {
            l.userpipe.as_ref().map(|p| p.as_raw_fd()) == Some(fd)
        })
    }

    /// Find or create the login for `uid`, refreshing its identity from
    /// the password database when needed.
    ///
    /// Returns `None` (with the reason logged) when the user is unknown,
    /// the home directory is not absolute, or the rundir template does not
    /// expand; no placeholder state is left behind for a UID that never
    /// had a login.
    pub fn populate(&mut self, uid: libc::uid_t, cfg: &Config) -> Option<&mut Login> {
        let idx = self.index_by_uid(uid);
        if let Some(i) = idx {
            if !self.logins[i].repopulate {
                log::debug!("msg: using existing login {}", uid);
                return self.logins.get_mut(i);
            }
        }

        let user = match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => user,
            Ok(None) => {
                log::error!("msg: no passwd entry for {}", uid);
                return None;
            }
            Err(e) => {
                log::error!("msg: passwd lookup for {} failed ({})", uid, e);
                return None;
            }
        };
        if !user.dir.is_absolute() {
            log::error!(
                "msg: homedir of {} ({}) is not absolute ({})",
                user.name,
                uid,
                user.dir.display()
            );
            return None;
        }
        let rundir = match config::expand_rundir(&cfg.rdir_path, uid, user.gid.as_raw()) {
            Ok(r) => r,
            Err(e) => {
                log::error!("msg: failed to expand rundir for {} ({})", uid, e);
                return None;
            }
        };

        let i = match idx {
            Some(i) => {
                log::debug!("msg: repopulate login {}", uid);
                i
            }
            None => {
                log::debug!("msg: init login {}", uid);
                self.logins.push(Login::new(uid));
                self.logins.len() - 1
            }
        };
        let lgn = &mut self.logins[i];
        lgn.gid = user.gid.as_raw();
        lgn.username = user.name;
        lgn.homedir = user.dir;
        lgn.shell = user.shell;
        lgn.manage_rdir = cfg.manage_rdir && !rundir.is_empty();
        lgn.rundir = rundir;
        // A refreshed slot has no service manager behind it; the next
        // start must go through the full wait handshake.
        lgn.srv_wait = true;
        lgn.repopulate = false;
        Some(lgn)
    }
}

/// Whether the login's service manager should be kept alive once its last
/// session closes: the config can force the policy either way, otherwise a
/// regular file named after the user under `linger_dir` opts in.
pub fn check_linger(cfg: &Config, username: &str, linger_dir: &Path) -> bool {
    if cfg.linger_never {
        return false;
    }
    if cfg.linger {
        return true;
    }
    fs::symlink_metadata(linger_dir.join(username))
        .map(|m| m.file_type().is_file())
        .unwrap_or(false)
}
