//! Daemon context and event loop.
//!
//! Single-threaded `poll` over, in order: the signal self-pipe, the
//! control socket, every queued readiness pipe, then every client
//! connection. Signal handlers only append records to the pipe; all real
//! work happens here, so SIGCHLD reaping always runs before new work on a
//! child's descriptors. The descriptor list is compacted at the end of
//! each iteration and freshly queued ready pipes are inserted right after
//! the control socket so readiness is observed before client traffic.

pub mod signals;
pub mod socket;
pub mod timer;

use std::env;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{recv, send, MsgFlags};
use nix::sys::stat::{umask, Mode};
use nix::unistd::read;

use crate::config::Config;
use crate::login::{check_linger, Registry, Session};
use crate::protocol::{self, encode, MsgType};
use crate::scaffold::{self, DAEMON_SOCK, LINGER_PATH, READY_FIFO};
use crate::supervisor::StartError;
use signals::{SigRecord, SIG_RECORD_SIZE};
use timer::KILL_TIMEOUT;

/// Conditions the daemon cannot continue past. Everything else is handled
/// per connection or per login.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::Error),

    #[error("service manager for {0} refused to die")]
    Unkillable(libc::uid_t),

    #[error("alarm for login {0} with no armed timer")]
    TimerInvariant(libc::uid_t),

    #[error("sessions remain after dropping login {0}")]
    SessionsRemain(libc::uid_t),

    #[error("failed to restart service manager for {0}: {1}")]
    Respawn(libc::uid_t, StartError),

    #[error("failed to spawn boot helper for {0}: {1}")]
    BootHelper(libc::uid_t, StartError),

    #[error("readiness pipe has no owning login")]
    PipeOrphan,
}

/// All daemon state, threaded through the event loop. The only thing
/// reachable outside it is the signal-pipe write end the handlers use.
pub struct Daemon {
    pub(crate) cfg: Config,
    pub(crate) registry: Registry,

    /// Poll set: `[signal pipe, control socket, ready pipes.., conns..]`.
    /// Raw copies only; every descriptor is owned elsewhere.
    pub(crate) fds: Vec<libc::pollfd>,
    /// Ready pipes currently in the poll set.
    pub(crate) npipes: usize,
    /// Accepted connections that have not attached a session yet.
    pub(crate) conns: Vec<OwnedFd>,

    pub(crate) ctl_sock: Option<OwnedFd>,
    pub(crate) base_fd: OwnedFd,
    pub(crate) base_path: PathBuf,
    pub(crate) linger_dir: PathBuf,

    pub(crate) sig_rd: OwnedFd,
    /// Kept alive for the handlers; never read from here.
    pub(crate) sig_wr: OwnedFd,

    pub(crate) term: bool,
}

/// Set up scaffolding, signals and the control socket, then run the event
/// loop until a clean shutdown or a fatal condition.
pub fn run(mut cfg: Config) -> Result<(), FatalError> {
    if !cfg.manage_rdir && env::var_os("TURNSTILED_LINGER_ENABLE_FORCE").is_none() {
        // Lingering without rundir management leaves a rundir nobody can
        // ever remove; require an explicit opt-in for that setup.
        cfg.linger_never = true;
    }

    log::info!("turnstiled: initializing");
    let (base_fd, base_path) = scaffold::base_dir_init()?;
    umask(Mode::from_bits_truncate(0o077));

    log::debug!("turnstiled: init signal pipe");
    let (sig_rd, sig_wr) = signals::init()?;

    log::debug!("turnstiled: init control socket");
    let ctl_sock = socket::control_socket_create(Path::new(DAEMON_SOCK))?;

    let fds = vec![
        pollfd(sig_rd.as_raw_fd(), libc::POLLIN),
        pollfd(ctl_sock.as_raw_fd(), libc::POLLIN),
    ];

    let mut daemon = Daemon {
        cfg,
        registry: Registry::default(),
        fds,
        npipes: 0,
        conns: Vec::new(),
        ctl_sock: Some(ctl_sock),
        base_fd,
        base_path,
        linger_dir: PathBuf::from(LINGER_PATH),
        sig_rd,
        sig_wr,
        term: false,
    };

    log::info!("turnstiled: main loop");
    daemon.event_loop()
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Send one message word; logs on failure. Returns false when the
/// connection should be terminated, which includes having just sent `Err`.
pub(crate) fn msg_send(fd: RawFd, word: u32) -> bool {
    if let Err(e) = send(fd, &word.to_le_bytes(), MsgFlags::empty()) {
        log::error!("msg: send failed ({})", e);
        return false;
    }
    MsgType::from_word(word) != Some(MsgType::Err)
}

impl Daemon {
    fn event_loop(&mut self) -> Result<(), FatalError> {
        loop {
            log::debug!("turnstiled: poll");
            let ret = unsafe {
                libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, -1)
            };
            if ret < 0 {
                let e = Errno::last();
                if e == Errno::EINTR {
                    self.compact();
                    continue;
                }
                log::error!("poll failed ({})", e);
                return Err(FatalError::Sys(e));
            }
            if ret == 0 {
                self.compact();
                continue;
            }

            if self.fds[0].revents & libc::POLLIN != 0 {
                let mut buf = [0u8; SIG_RECORD_SIZE];
                match read(self.sig_rd.as_raw_fd(), &mut buf) {
                    Ok(n) if n == SIG_RECORD_SIZE => {
                        let rec = SigRecord::decode(&buf);
                        match rec.signo {
                            libc::SIGALRM => self.sig_handle_alrm(rec.key as libc::uid_t)?,
                            libc::SIGTERM | libc::SIGINT => {
                                self.sig_handle_term()?;
                                self.term = true;
                            }
                            libc::SIGCHLD => self.reap_children()?,
                            other => log::warn!("unexpected signal {}", other),
                        }
                    }
                    res => {
                        log::error!("signal pipe read failed ({:?})", res);
                        self.compact();
                        continue;
                    }
                }
            }

            if self.term {
                if !self.registry.iter().any(|l| l.srv_live()) {
                    log::info!("turnstiled: no managed processes left, exiting");
                    return Ok(());
                }
                // Only the signal pipe is left to service while waiting
                // for the remaining children.
                continue;
            }

            self.accept_conns();

            // npipes may shrink under us as pipes complete; iterate over
            // the boundary captured before servicing.
            let curpipes = self.npipes;
            let mut i = 2;
            while i < curpipes + 2 {
                self.handle_pipe(i)?;
                i += 1;
            }
            while i < self.fds.len() {
                self.handle_conn_event(i);
                i += 1;
            }

            self.compact();
        }
    }

    /// Drop dead entries, then register freshly queued ready pipes right
    /// after the control socket so they are polled before connections.
    fn compact(&mut self) {
        self.fds.retain(|p| p.fd != -1);
        let Daemon {
            fds,
            npipes,
            registry,
            ..
        } = self;
        for lgn in registry.iter_mut() {
            if !lgn.pipe_queued {
                continue;
            }
            let Some(pipe) = &lgn.userpipe else {
                lgn.pipe_queued = false;
                continue;
            };
            fds.insert(2, pollfd(pipe.as_raw_fd(), libc::POLLIN | libc::POLLHUP));
            lgn.pipe_queued = false;
            *npipes += 1;
        }
    }

    fn accept_conns(&mut self) {
        if self.fds[1].revents == 0 {
            return;
        }
        let Some(ctl) = &self.ctl_sock else { return };
        let ctl = ctl.as_raw_fd();
        loop {
            match socket::accept_conn(ctl) {
                Ok(Some(conn)) => {
                    let raw = conn.as_raw_fd();
                    log::debug!("conn: accepted {}", raw);
                    self.fds.push(pollfd(raw, libc::POLLIN | libc::POLLHUP));
                    self.conns.push(conn);
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("accept4 failed ({})", e);
                    break;
                }
            }
        }
    }

    /// Take a login's ready pipe out of service: close it, drop its poll
    /// entry and unlink the FIFO if the state directory still exists.
    pub(crate) fn retire_pipe(&mut self, idx: usize) {
        let mut entry = None;
        let mut fifo_path = None;
        {
            let Some(lgn) = self.registry.get_mut(idx) else {
                return;
            };
            let Some(pipe) = lgn.userpipe.take() else {
                return;
            };
            entry = Some((pipe.as_raw_fd(), lgn.pipe_queued));
            fifo_path = lgn.dir_path.as_ref().map(|d| d.join(READY_FIFO));
            lgn.pipe_queued = false;
        }
        if let Some((raw, queued)) = entry {
            // A queued pipe never made it into the poll set.
            if !queued {
                for j in 2..self.fds.len() {
                    if self.fds[j].fd == raw {
                        self.fds[j].fd = -1;
                        self.fds[j].revents = 0;
                        self.npipes -= 1;
                        break;
                    }
                }
            }
        }
        if let Some(p) = fifo_path {
            let _ = fs::remove_file(p);
        }
    }

    /// Service one readiness-pipe entry: accumulate bytes until the NUL
    /// terminator, then retire the pipe and spawn the boot helper.
    fn handle_pipe(&mut self, i: usize) -> Result<(), FatalError> {
        let revents = self.fds[i].revents;
        let fd = self.fds[i].fd;
        if revents == 0 || fd == -1 {
            return Ok(());
        }
        let Some(idx) = self.registry.index_by_pipe(fd) else {
            log::error!("pipe: no login for descriptor {}", fd);
            return Err(FatalError::PipeOrphan);
        };

        let mut done = false;
        if revents & libc::POLLIN != 0 {
            if let Some(lgn) = self.registry.get_mut(idx) {
                loop {
                    let mut b = [0u8; 1];
                    match read(fd, &mut b) {
                        Ok(1) => {
                            if b[0] == 0 {
                                done = true;
                                break;
                            }
                            lgn.srvstr.push(b[0]);
                        }
                        _ => break,
                    }
                }
            }
        }
        if !(done || revents & libc::POLLHUP != 0) {
            return Ok(());
        }

        log::debug!("pipe: close");
        self.retire_pipe(idx);

        // The service manager is up; ask it to bring the boot service up.
        let uid = self.registry.get_mut(idx).map(|l| l.uid).unwrap_or(0);
        self.srv_boot(idx)
            .map_err(|e| FatalError::BootHelper(uid, e))?;
        if let Some(lgn) = self.registry.get_mut(idx) {
            lgn.srvstr.clear();
        }
        Ok(())
    }

    fn handle_conn_event(&mut self, i: usize) {
        let revents = self.fds[i].revents;
        if revents == 0 {
            return;
        }
        let fd = self.fds[i].fd;
        if revents & libc::POLLHUP != 0 {
            self.conn_term(fd);
            self.fds[i].fd = -1;
            self.fds[i].revents = 0;
            return;
        }
        if revents & libc::POLLIN != 0 && !self.handle_read(fd) {
            log::error!("read: handler failed, terminating connection {}", fd);
            self.conn_term(fd);
            self.fds[i].fd = -1;
            self.fds[i].revents = 0;
        }
    }

    /// Read and dispatch one message. Returns false when the connection
    /// must be terminated.
    fn handle_read(&mut self, fd: RawFd) -> bool {
        let mut buf = [0u8; 4];
        let word = match recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(4) => u32::from_le_bytes(buf),
            Ok(n) => {
                log::debug!("msg: short read of {} bytes", n);
                return false;
            }
            Err(Errno::EAGAIN) => return true,
            Err(e) => {
                log::error!("msg: recv failed ({})", e);
                return false;
            }
        };
        let aux = protocol::aux(word);
        log::debug!(
            "msg: read {} ({}, {})",
            word & protocol::MSG_TYPE_MASK,
            aux,
            fd
        );
        match MsgType::from_word(word) {
            Some(MsgType::Start) => self.msg_start(fd, aux),
            Some(MsgType::ReqRlen) => self.msg_rlen(fd),
            Some(MsgType::ReqRdata) => self.msg_rdata(fd, aux),
            // Clients have no business sending server tags.
            _ => false,
        }
    }

    fn msg_start(&mut self, fd: RawFd, uid: libc::uid_t) -> bool {
        let Some(idx) = self.session_new(fd, uid) else {
            return msg_send(fd, encode(MsgType::Err, 0));
        };
        let export_dbus = self.cfg.export_dbus;
        let (srv_wait, srv_running, terminating) = match self.registry.get_mut(idx) {
            Some(lgn) => (lgn.srv_wait, lgn.srv_pid.is_some(), lgn.term_pid.is_some()),
            None => return false,
        };

        if !srv_wait {
            log::debug!("msg: done");
            return msg_send(fd, encode(MsgType::OkDone, export_dbus as u32));
        }
        if !srv_running {
            if terminating {
                log::debug!("msg: still waiting for old service manager to die");
                if let Some(lgn) = self.registry.get_mut(idx) {
                    lgn.srv_pending = true;
                }
            } else {
                log::debug!("msg: start service manager");
                if let Err(e) = self.srv_start(idx) {
                    log::error!("srv: start for {} failed ({})", uid, e);
                    return msg_send(fd, encode(MsgType::Err, 0));
                }
            }
        }
        log::debug!("msg: wait");
        msg_send(fd, encode(MsgType::OkWait, 0))
    }

    /// Authenticate and attach a session for `uid` on `fd`.
    fn session_new(&mut self, fd: RawFd, uid: libc::uid_t) -> Option<usize> {
        let peer = match socket::peer_euid(fd) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("msg: could not get peer credentials ({})", e);
                return None;
            }
        };
        if peer != 0 && peer != uid {
            log::debug!("msg: uid mismatch (peer: {}, got: {})", peer, uid);
            return None;
        }
        log::debug!("msg: welcome {}", uid);

        // The connection must still be unattached; a repeated start on the
        // same descriptor finds nothing here and is rejected.
        let pos = self.conns.iter().position(|c| c.as_raw_fd() == fd)?;
        {
            let lgn = self.registry.populate(uid, &self.cfg)?;
            if lgn.has_session(fd) {
                log::debug!("msg: already have a session for {}/{}", uid, fd);
                return None;
            }
        }
        let conn = self.conns.remove(pos);
        let idx = self.registry.index_by_uid(uid)?;
        let lgn = self.registry.get_mut(idx)?;
        log::debug!("msg: new session for {}/{}", uid, fd);
        lgn.sessions.push(Session { fd: conn });
        Some(idx)
    }

    fn msg_rlen(&mut self, fd: RawFd) -> bool {
        let Some(idx) = self.registry.index_by_conn(fd) else {
            log::debug!("msg: no login for {}", fd);
            return msg_send(fd, encode(MsgType::Err, 0));
        };
        let managed = self.cfg.manage_rdir;
        match self.registry.get_mut(idx) {
            Some(lgn) => msg_send(fd, protocol::rundir_len_reply(&lgn.rundir, managed)),
            None => false,
        }
    }

    fn msg_rdata(&mut self, fd: RawFd, r: u32) -> bool {
        let Some(idx) = self.registry.index_by_conn(fd) else {
            log::debug!("msg: no login for {}", fd);
            return msg_send(fd, encode(MsgType::Err, 0));
        };
        let Some(lgn) = self.registry.get_mut(idx) else {
            return false;
        };
        match protocol::rundir_chunk_reply(&lgn.rundir, r) {
            Some(word) => msg_send(fd, word),
            None => msg_send(fd, encode(MsgType::Err, 0)),
        }
    }

    /// Terminate a connection wherever it lives: as some login's session,
    /// or still unattached.
    fn conn_term(&mut self, conn: RawFd) {
        for idx in 0..self.registry.len() {
            if self.conn_term_login(idx, conn) {
                return;
            }
        }
        if let Some(pos) = self.conns.iter().position(|c| c.as_raw_fd() == conn) {
            self.conns.remove(pos);
        }
    }

    /// Erase the session holding `conn` from the login at `idx`; when it
    /// was the last one and linger policy says no, begin stopping the
    /// service manager. Returns whether the connection belonged here.
    fn conn_term_login(&mut self, idx: usize, conn: RawFd) -> bool {
        let mut stopping = false;
        {
            let Daemon {
                registry,
                cfg,
                linger_dir,
                ..
            } = self;
            let Some(lgn) = registry.get_mut(idx) else {
                return false;
            };
            let Some(sess) = lgn.take_session(conn) else {
                return false;
            };
            log::debug!("conn: close {} for login {}", conn, lgn.uid);
            if lgn.sessions.is_empty() && !check_linger(cfg, &lgn.username, linger_dir) {
                log::debug!("srv: stop");
                stopping = true;
                if let Some(pid) = lgn.mark_stopping() {
                    log::debug!("srv: term {}", pid);
                    let _ = kill(pid, Signal::SIGTERM);
                    if let Err(e) = lgn.arm_timer(KILL_TIMEOUT) {
                        log::warn!("timer: failed to arm kill timer ({})", e);
                    }
                } else {
                    // No live service manager; the state dir can go right
                    // away, there is no boot service left to unwind.
                    lgn.remove_sdir();
                }
            }
            drop(sess);
        }
        if stopping {
            // A boot still in flight has nobody left to notify; the ready
            // pipe leaves the poll set with the login's sessions, or its
            // hangup would spawn a boot helper against a dead instance.
            self.retire_pipe(idx);
        }
        true
    }

    /// Close every connection of a login and mark it for repopulation. A
    /// still-open ready pipe goes too, so nothing of the login remains in
    /// the poll set afterwards.
    pub(crate) fn drop_login(&mut self, idx: usize) -> Result<(), FatalError> {
        let Some(uid) = self.registry.get_mut(idx).map(|l| l.uid) else {
            return Ok(());
        };
        log::debug!("turnstiled: drop login {}", uid);

        // The ready pipe goes first so nothing downstream sees a login
        // that is half in the poll set.
        self.retire_pipe(idx);

        for j in 2..self.fds.len() {
            let fd = self.fds[j].fd;
            if fd == -1 {
                continue;
            }
            if self.conn_term_login(idx, fd) {
                self.fds[j].fd = -1;
                self.fds[j].revents = 0;
            }
        }

        let sessions_empty = {
            let Some(lgn) = self.registry.get_mut(idx) else {
                return Ok(());
            };
            lgn.srvstr.clear();
            // A restart queued behind a terminating instance dies with
            // the login; nothing is left to restart for.
            lgn.srv_pending = false;
            lgn.repopulate = true;
            lgn.sessions.is_empty()
        };

        if !sessions_empty {
            log::error!("turnstiled: sessions not empty, it should be");
            return Err(FatalError::SessionsRemain(uid));
        }
        Ok(())
    }

    /// Timer expiry for a login: either the kill-escalation deadline of a
    /// terminating service manager, or the boot timeout.
    fn sig_handle_alrm(&mut self, uid: libc::uid_t) -> Result<(), FatalError> {
        log::debug!("turnstiled: sigalrm for {}", uid);
        let Some(idx) = self.registry.index_by_uid(uid) else {
            log::error!("timer: alarm for unknown login {}", uid);
            return Err(FatalError::TimerInvariant(uid));
        };
        {
            let Some(lgn) = self.registry.get_mut(idx) else {
                return Err(FatalError::TimerInvariant(uid));
            };
            if !lgn.timer_armed() {
                log::error!("timer: handling alarm but timer not armed");
                return Err(FatalError::TimerInvariant(uid));
            }
            lgn.disarm_timer();
            if let Some(tpid) = lgn.term_pid {
                if lgn.kill_tried {
                    log::error!(
                        "turnstiled: service manager process {} refused to die",
                        tpid
                    );
                    return Err(FatalError::Unkillable(uid));
                }
                // Did not die in time; the repeated SIGTERM propagates as
                // SIGKILL through the backend's own double fork.
                let _ = kill(tpid, Signal::SIGTERM);
                lgn.kill_tried = true;
                if let Err(e) = lgn.arm_timer(KILL_TIMEOUT) {
                    log::warn!("timer: failed to re-arm kill timer ({})", e);
                }
                return Ok(());
            }
        }
        // Boot timeout: drop the login so the next attempt starts clean.
        self.drop_login(idx)
    }

    /// Graceful teardown: stop accepting, drop every login and shrink the
    /// poll set to just the signal pipe; the loop then waits for the
    /// remaining children to reap.
    fn sig_handle_term(&mut self) -> Result<(), FatalError> {
        log::debug!("turnstiled: term");
        self.ctl_sock = None;
        let mut failed = None;
        for idx in 0..self.registry.len() {
            if let Err(e) = self.drop_login(idx) {
                failed = Some(e);
            }
        }
        self.conns.clear();
        self.fds.truncate(1);
        self.npipes = 0;
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fd: RawFd) -> libc::pollfd {
        pollfd(fd, libc::POLLIN | libc::POLLHUP)
    }

    // Compaction-shaped list surgery, checked without a live daemon: no
    // `-1` survives and queued pipes land right after the control socket.
    #[test]
    fn test_fd_list_compaction_shape() {
        let mut fds = vec![entry(0), entry(1), entry(7), entry(-1), entry(9)];
        fds.retain(|p| p.fd != -1);
        let collected: Vec<RawFd> = fds.iter().map(|p| p.fd).collect();
        assert_eq!(collected, vec![0, 1, 7, 9]);

        fds.insert(2, entry(12));
        let collected: Vec<RawFd> = fds.iter().map(|p| p.fd).collect();
        assert_eq!(collected, vec![0, 1, 12, 7, 9]);

        // No duplicates after the dance.
        let mut sorted = collected.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), collected.len());
    }

    #[test]
    fn test_msg_send_flags_err_words() {
        // The word classification alone; no descriptor involved.
        assert_eq!(
            MsgType::from_word(encode(MsgType::Err, 0)),
            Some(MsgType::Err)
        );
        assert_ne!(
            MsgType::from_word(encode(MsgType::OkWait, 0)),
            Some(MsgType::Err)
        );
    }
}
