//! Child reaping.
//!
//! A SIGCHLD can mean one of three things for a login: its service manager
//! died while it was supposed to be running (restart it, unless it never
//! signaled readiness, in which case restarting would likely loop
//! forever), its boot helper finished (the login is ready, tell every
//! session), or a SIGTERM'd instance finally exited (tear the login's
//! state down and honor a pending restart).

use std::os::fd::AsRawFd;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::daemon::{msg_send, Daemon, FatalError};
use crate::protocol::{encode, MsgType};
use crate::scaffold;

enum Role {
    Srv,
    Start,
    Term,
}

impl Daemon {
    /// Drain every exited child, non-blocking, and dispatch each PID.
    pub(crate) fn reap_children(&mut self) -> Result<(), FatalError> {
        log::debug!("turnstiled: sigchld");
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else { continue };
                    self.reap_one(pid)?;
                }
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    log::error!("waitpid error: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    fn reap_one(&mut self, pid: Pid) -> Result<(), FatalError> {
        log::debug!("srv: reap {}", pid);
        let mut hit = None;
        for (i, lgn) in self.registry.iter().enumerate() {
            if lgn.srv_pid == Some(pid) {
                hit = Some((i, Role::Srv));
                break;
            }
            if lgn.start_pid == Some(pid) {
                hit = Some((i, Role::Start));
                break;
            }
            if lgn.term_pid == Some(pid) {
                hit = Some((i, Role::Term));
                break;
            }
        }
        // Not ours anymore; a helper whose login was dropped, for example.
        let Some((idx, role)) = hit else {
            return Ok(());
        };
        match role {
            Role::Srv => self.reap_srv(idx),
            Role::Start => {
                self.reap_start(idx);
                Ok(())
            }
            Role::Term => self.reap_term(idx),
        }
    }

    fn reap_srv(&mut self, idx: usize) -> Result<(), FatalError> {
        let Some(lgn) = self.registry.get_mut(idx) else {
            return Ok(());
        };
        lgn.srv_pid = None;
        lgn.start_pid = None;
        lgn.disarm_timer();
        let uid = lgn.uid;

        if lgn.srv_wait {
            // Died before readiness: drop the login so the next attempt
            // starts from scratch instead of respawning into the same
            // failure.
            log::error!("srv: service manager for {} died without notifying readiness", uid);
            if lgn.manage_rdir {
                scaffold::rundir_clear(&lgn.rundir);
                lgn.manage_rdir = false;
            }
            return self.drop_login(idx);
        }

        log::debug!("srv: respawn for {}", uid);
        self.srv_start(idx).map_err(|e| {
            log::error!("turnstiled: failed to restart service manager for {} ({})", uid, e);
            FatalError::Respawn(uid, e)
        })
    }

    fn reap_start(&mut self, idx: usize) {
        let export_dbus = self.cfg.export_dbus;
        let Some(lgn) = self.registry.get_mut(idx) else {
            return;
        };
        log::debug!("srv: ready notification for {}", lgn.uid);
        let word = encode(MsgType::OkDone, export_dbus as u32);
        for sess in &lgn.sessions {
            msg_send(sess.fd.as_raw_fd(), word);
        }
        lgn.disarm_timer();
        lgn.start_pid = None;
        lgn.srv_wait = false;
    }

    fn reap_term(&mut self, idx: usize) -> Result<(), FatalError> {
        // A ready pipe that somehow survived until now must not outlive
        // the state directory it points into.
        self.retire_pipe(idx);
        let pending = {
            let Some(lgn) = self.registry.get_mut(idx) else {
                return Ok(());
            };
            log::debug!("srv: terminated instance for {} reaped", lgn.uid);
            lgn.disarm_timer();
            lgn.remove_sdir();
            if lgn.manage_rdir {
                scaffold::rundir_clear(&lgn.rundir);
                lgn.manage_rdir = false;
            }
            if lgn.sessions.is_empty() {
                lgn.repopulate = true;
            }
            lgn.term_pid = None;
            lgn.kill_tried = false;
            lgn.srv_pending
        };
        if pending {
            let uid = self.registry.get_mut(idx).map(|l| l.uid).unwrap_or(0);
            log::debug!("srv: pending restart for {}", uid);
            self.srv_start(idx).map_err(|e| {
                log::error!("turnstiled: failed to restart service manager for {} ({})", uid, e);
                FatalError::Respawn(uid, e)
            })?;
        }
        Ok(())
    }
}
