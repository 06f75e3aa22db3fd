//! Service-manager supervision.
//!
//! Bringing a login's service manager up means scaffolding its rundir and
//! state directory, arming the boot timeout, forking, and in the child
//! dropping privileges, generating the stub service set and exec'ing the
//! backend with the readiness descriptor. The parent only ever records
//! PIDs and queues the ready pipe; everything else it learns through
//! SIGCHLD and the pipe.

pub mod reaper;

use std::ffi::CString;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::sys::stat::{umask, Mode};
use nix::unistd::{execvp, execvpe, fork, initgroups, setgid, setuid, ForkResult, Gid, Uid};

use crate::config::Config;
use crate::daemon::signals;
use crate::daemon::Daemon;
use crate::login::Login;
use crate::scaffold::{self, READY_FIFO};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("rundir setup failed: {0}")]
    Rundir(io::Error),

    #[error("login dir setup failed: {0}")]
    LoginDir(io::Error),

    #[error("ready pipe setup failed: {0}")]
    ReadyPipe(io::Error),

    #[error("timer setup failed: {0}")]
    Timer(nix::Error),

    #[error("fork failed: {0}")]
    Fork(nix::Error),
}

impl Daemon {
    /// Start the service manager for the login at `idx`.
    ///
    /// On success the login is waiting: `srv_pid` is recorded and either
    /// the ready pipe is queued for polling or, with the backend disabled,
    /// the boot helper is already running.
    pub(crate) fn srv_start(&mut self, idx: usize) -> Result<(), StartError> {
        // A previous instance may have left its ready pipe behind (death
        // during termination with a restart pending); retire it before a
        // fresh one takes its place.
        self.retire_pipe(idx);

        let close_fds = [
            self.sig_rd.as_raw_fd(),
            self.sig_wr.as_raw_fd(),
            self.base_fd.as_raw_fd(),
        ];
        let disabled = {
            let cfg = &self.cfg;
            let base_path = self.base_path.clone();
            let Some(lgn) = self.registry.get_mut(idx) else {
                log::debug!("srv: no login at {}", idx);
                return Ok(());
            };
            lgn.srv_wait = true;

            // The rundir and login dir are only created here, once any
            // previous instance has definitely terminated and released
            // them.
            if lgn.manage_rdir {
                log::debug!("srv: setup rundir for {}", lgn.uid);
                scaffold::rundir_make(&lgn.rundir, lgn.uid, lgn.gid)
                    .map_err(StartError::Rundir)?;
            }
            if !cfg.disable {
                log::debug!("srv: create login dir for {}", lgn.uid);
                let (dirfd, dir) = scaffold::login_dir_create(&base_path, lgn.uid, lgn.gid)
                    .map_err(StartError::LoginDir)?;
                log::debug!("srv: create readiness pipe");
                let pipe = match scaffold::ready_fifo_create(&dir, lgn.uid, lgn.gid) {
                    Ok(p) => p,
                    Err(e) => {
                        scaffold::login_dir_remove(&dir);
                        return Err(StartError::ReadyPipe(e));
                    }
                };
                lgn.dirfd = Some(dirfd);
                lgn.dir_path = Some(dir);
                lgn.userpipe = Some(pipe);
            }

            if cfg.login_timeout > 0 {
                lgn.arm_timer(cfg.login_timeout).map_err(StartError::Timer)?;
            } else {
                log::debug!("srv: no timeout");
            }

            log::debug!("srv: launch");
            let pid = match unsafe { fork() }.map_err(StartError::Fork)? {
                ForkResult::Child => {
                    // Nothing from the parent may leak into the backend:
                    // default signal dispositions, and only the FIFO write
                    // end survives the exec.
                    signals::reset_in_child();
                    for fd in close_fds {
                        unsafe { libc::close(fd) };
                    }
                    if let Some(p) = &lgn.userpipe {
                        unsafe { libc::close(p.as_raw_fd()) };
                    }
                    srv_child(lgn, cfg)
                }
                ForkResult::Parent { child } => child,
            };
            lgn.srv_pending = false;
            if lgn.userpipe.is_some() {
                lgn.srv_pid = Some(pid);
                lgn.pipe_queued = true;
                false
            } else {
                // Disabled backend: the child has already exited and there
                // is nothing to supervise; readiness comes from the boot
                // helper alone.
                true
            }
        };
        if disabled {
            // No readiness pipe to wait on; proceed as though the backend
            // booted instantly.
            self.srv_boot(idx)?;
        }
        Ok(())
    }

    /// Spawn the boot helper: a short-lived process that asks the now-live
    /// service manager to start its `boot` service.
    pub(crate) fn srv_boot(&mut self, idx: usize) -> Result<(), StartError> {
        let disabled = self.cfg.disable;
        let backend = self.cfg.backend.clone();
        let base_path = self.base_path.clone();
        let Some(lgn) = self.registry.get_mut(idx) else {
            log::debug!("srv: no login at {}", idx);
            return Ok(());
        };
        log::debug!("srv: boot wait for {}", lgn.uid);

        let csock = boot_socket_path(lgn, &base_path);
        match unsafe { fork() }.map_err(StartError::Fork)? {
            ForkResult::Child => {
                signals::reset_in_child();
                if disabled {
                    unsafe { libc::_exit(0) };
                }
                if Uid::current().is_root() {
                    if setgid(Gid::from_raw(lgn.gid)).is_err()
                        || setuid(Uid::from_raw(lgn.uid)).is_err()
                    {
                        unsafe { libc::_exit(1) };
                    }
                }
                let _ = exec_boot_helper(&backend, &csock);
                unsafe { libc::_exit(1) };
            }
            ForkResult::Parent { child } => {
                lgn.start_pid = Some(child);
                Ok(())
            }
        }
    }
}

/// The control socket the boot helper talks to: whatever the service
/// manager announced over the ready pipe, else the conventional location
/// under the rundir, else under the login state directory.
fn boot_socket_path(lgn: &Login, base_path: &Path) -> String {
    if !lgn.srvstr.is_empty() {
        return String::from_utf8_lossy(&lgn.srvstr).into_owned();
    }
    if !lgn.rundir.is_empty() {
        return format!("{}/dinitctl", lgn.rundir);
    }
    format!("{}/{}/dinitctl", base_path.display(), lgn.uid)
}

fn exec_boot_helper(backend: &str, csock: &str) -> nix::Result<std::convert::Infallible> {
    let ctl = format!("{}ctl", backend);
    let argv = vec![
        cstring(&ctl),
        cstring("--socket-path"),
        cstring(csock),
        cstring("start"),
        cstring("boot"),
    ];
    execvp(&cstring(&ctl), &argv)
}

/// Forked-child half of the bring-up: drop privileges, generate the stub
/// services, open the FIFO write end and exec the backend. Never returns.
fn srv_child(lgn: &Login, cfg: &Config) -> ! {
    if cfg.disable {
        unsafe { libc::_exit(0) };
    }
    if let Err(e) = srv_child_exec(lgn, cfg) {
        eprintln!("srv: child setup failed: {}", e);
    }
    unsafe { libc::_exit(1) };
}

fn srv_child_exec(lgn: &Login, cfg: &Config) -> io::Result<()> {
    if Uid::current().is_root() {
        let name = CString::new(lgn.username.as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        setgid(Gid::from_raw(lgn.gid))?;
        initgroups(&name, Gid::from_raw(lgn.gid))?;
        setuid(Uid::from_raw(lgn.uid))?;
    }

    let dir = lgn
        .dir_path
        .as_deref()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;

    // Per-invocation scratch directory, created after the privilege drop
    // so it is unambiguously the user's.
    let tdir = dir.join(format!("dinit.{}", std::process::id()));
    DirBuilder::new().mode(0o700).create(&tdir)?;
    write_service_stubs(&tdir, &lgn.homedir, &cfg.boot_path, &cfg.sys_boot_path)?;

    // Best effort; a broken home directory degrades the boot set, not the
    // login.
    if let Err(e) = make_home_boot_dir(&lgn.homedir, &cfg.boot_path) {
        log::debug!("srv: could not create boot dir under home ({})", e);
    }

    // The write end must survive the exec; everything else is cloexec.
    let fifo = dir.join(READY_FIFO);
    let ready_fd = open_inheritable(&fifo)?;

    let (argv, envp) = build_exec(lgn, cfg, ready_fd, &tdir);
    umask(Mode::from_bits_truncate(0o022));
    let prog = cstring(&cfg.backend);
    execvpe(&prog, &argv, &envp)?;
    unreachable!()
}

/// Write the two stub services binding the generic backend to this user's
/// service set: `boot` waits on the per-user directory under the home,
/// `system` on the system-wide one.
pub fn write_service_stubs(
    tdir: &Path,
    homedir: &Path,
    boot_path: &str,
    sys_boot_path: &str,
) -> io::Result<()> {
    let mut boot = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(tdir.join("boot"))?;
    writeln!(boot, "type = internal")?;
    writeln!(boot, "depends-on = system")?;
    writeln!(boot, "waits-for.d = {}/{}", homedir.display(), boot_path)?;

    let mut system = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(tdir.join("system"))?;
    writeln!(system, "type = internal")?;
    writeln!(system, "waits-for.d = {}", sys_boot_path)?;
    Ok(())
}

/// Create `<home>/<boot_path>`, making missing components 0755.
fn make_home_boot_dir(homedir: &Path, boot_path: &str) -> io::Result<()> {
    if !fs::metadata(homedir)?.is_dir() {
        return Err(io::ErrorKind::NotADirectory.into());
    }
    let mut cur = homedir.to_path_buf();
    for comp in Path::new(boot_path).components() {
        cur.push(comp);
        match DirBuilder::new().mode(0o755).create(&cur) {
            Ok(()) => fs::set_permissions(&cur, fs::Permissions::from_mode(0o755))?,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn open_inheritable(path: &Path) -> io::Result<RawFd> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Assemble the backend's argv and environment.
///
/// Service directories are searched in order: the generated scratch dir
/// first, then each configured path, with relative entries resolved under
/// the home directory.
pub fn build_exec(
    lgn: &Login,
    cfg: &Config,
    ready_fd: RawFd,
    tdir: &Path,
) -> (Vec<CString>, Vec<CString>) {
    let mut argv = vec![
        cstring(&cfg.backend),
        cstring("--user"),
        cstring("--ready-fd"),
        cstring(&ready_fd.to_string()),
        cstring("--services-dir"),
        cstring_path(tdir),
    ];
    for sp in &cfg.srv_paths {
        argv.push(cstring("--services-dir"));
        if sp.starts_with('/') {
            argv.push(cstring(sp));
        } else {
            argv.push(cstring_path(&lgn.homedir.join(sp)));
        }
    }

    let mut envp = vec![
        cstring(&format!("HOME={}", lgn.homedir.display())),
        cstring(&format!("UID={}", lgn.uid)),
        cstring(&format!("GID={}", lgn.gid)),
        cstring("PATH=/usr/local/bin:/usr/bin:/bin"),
    ];
    if !lgn.rundir.is_empty() {
        envp.push(cstring(&format!("XDG_RUNTIME_DIR={}", lgn.rundir)));
    }
    (argv, envp)
}

fn cstring(s: &str) -> CString {
    CString::new(s.as_bytes()).unwrap_or_default()
}

fn cstring_path(p: &Path) -> CString {
    CString::new(p.as_os_str().as_bytes()).unwrap_or_default()
}
