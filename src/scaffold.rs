//! Filesystem scaffolding under the runtime base.
//!
//! The daemon keeps all per-user state below `<RUN_BASE>/<SOCK_DIR>`: one
//! 0700 directory per UID holding the readiness FIFO and the generated
//! service scratch directory. Runtime directories (`/run/user/<uid>`) are
//! created here too when the daemon manages them. Modes are set explicitly
//! after creation so the strict daemon umask never leaks into them.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::{lchown, DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

/// Runtime base; must exist before the daemon starts.
pub const RUN_BASE: &str = "/run";

/// Daemon state directory under the runtime base.
pub const SOCK_DIR: &str = "turnstiled";

/// Control socket path.
pub const DAEMON_SOCK: &str = "/run/turnstiled/control.sock";

/// Directory of per-user linger marker files.
pub const LINGER_PATH: &str = "/var/lib/turnstiled/linger";

/// Name of the readiness FIFO inside a login directory.
pub const READY_FIFO: &str = "ready";

fn open_dirfd(path: &Path) -> io::Result<OwnedFd> {
    let f = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_NOFOLLOW)
        .open(path)?;
    Ok(OwnedFd::from(f))
}

fn make_dir(path: &Path, mode: u32) -> io::Result<()> {
    match DirBuilder::new().mode(mode).create(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Create the daemon state directory under an existing runtime base and
/// return a descriptor on it plus its path.
///
/// The base must already exist; a missing `/run` means the system is not
/// set up for us and is a startup error, not something to create.
pub fn base_dir_init() -> io::Result<(OwnedFd, PathBuf)> {
    let base = Path::new(RUN_BASE);
    if !fs::metadata(base)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotADirectory,
            format!("{} is not a directory", RUN_BASE),
        ));
    }
    let state = base.join(SOCK_DIR);
    make_dir(&state, 0o755)?;
    let fd = open_dirfd(&state)?;
    Ok((fd, state))
}

/// Create the per-user state directory, owned by the user, mode 0700.
pub fn login_dir_create(
    base: &Path,
    uid: libc::uid_t,
    gid: libc::gid_t,
) -> io::Result<(OwnedFd, PathBuf)> {
    let dir = base.join(uid.to_string());
    make_dir(&dir, 0o700)?;
    lchown(&dir, Some(uid), Some(gid))?;
    let fd = open_dirfd(&dir)?;
    Ok((fd, dir))
}

/// Create the readiness FIFO inside a login directory and open its read
/// side non-blocking. The FIFO is owned by the user so the service manager
/// can open the write side after dropping privileges.
pub fn ready_fifo_create(
    dir: &Path,
    uid: libc::uid_t,
    gid: libc::gid_t,
) -> io::Result<OwnedFd> {
    let path = dir.join(READY_FIFO);
    let _ = fs::remove_file(&path);
    mkfifo(&path, Mode::from_bits_truncate(0o700)).map_err(io::Error::from)?;
    if let Err(e) = lchown(&path, Some(uid), Some(gid)) {
        let _ = fs::remove_file(&path);
        return Err(e);
    }
    let f = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path)?;
    Ok(OwnedFd::from(f))
}

/// Remove a login directory: FIFO first, then the remaining contents, then
/// the directory itself.
pub fn login_dir_remove(dir: &Path) {
    let _ = fs::remove_file(dir.join(READY_FIFO));
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("srv: failed to remove {} ({})", dir.display(), e);
        }
    }
}

/// Create a login's runtime directory from its expanded path: missing
/// parents are 0755, the directory itself 0700 and owned by the user.
pub fn rundir_make(rundir: &str, uid: libc::uid_t, gid: libc::gid_t) -> io::Result<()> {
    let path = Path::new(rundir);
    if !path.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("rundir {} is not absolute", rundir),
        ));
    }
    if let Some(parent) = path.parent() {
        let mut cur = PathBuf::from("/");
        for comp in parent.components().skip(1) {
            cur.push(comp);
            match DirBuilder::new().mode(0o755).create(&cur) {
                Ok(()) => fs::set_permissions(&cur, fs::Permissions::from_mode(0o755))?,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
    }
    make_dir(path, 0o700)?;
    lchown(path, Some(uid), Some(gid))?;
    Ok(())
}

/// Remove a managed runtime directory and everything in it.
pub fn rundir_clear(rundir: &str) {
    log::debug!("srv: clear rundir {}", rundir);
    if let Err(e) = fs::remove_dir_all(rundir) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("srv: failed to clear rundir {} ({})", rundir, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_test_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = PathBuf::from(format!(
            "/tmp/turnstiled-scaffold-test-{}-{}",
            std::process::id(),
            id
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn own_ids() -> (libc::uid_t, libc::gid_t) {
        (
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    #[test]
    fn test_login_dir_modes() {
        let base = unique_test_dir();
        let (uid, gid) = own_ids();
        let (fd, dir) = login_dir_create(&base, uid, gid).unwrap();
        assert_eq!(dir, base.join(uid.to_string()));
        let meta = fs::metadata(&dir).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o7777, 0o700);
        drop(fd);

        // Creating again over an existing directory succeeds.
        let (_fd, dir2) = login_dir_create(&base, uid, gid).unwrap();
        assert_eq!(dir, dir2);
    }

    #[test]
    fn test_ready_fifo() {
        let base = unique_test_dir();
        let (uid, gid) = own_ids();
        let (_fd, dir) = login_dir_create(&base, uid, gid).unwrap();
        let pipe = ready_fifo_create(&dir, uid, gid).unwrap();
        let meta = fs::metadata(dir.join(READY_FIFO)).unwrap();
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.permissions().mode() & 0o7777, 0o700);
        drop(pipe);

        // Recreation replaces a stale FIFO.
        let _pipe = ready_fifo_create(&dir, uid, gid).unwrap();
    }

    #[test]
    fn test_login_dir_remove() {
        let base = unique_test_dir();
        let (uid, gid) = own_ids();
        let (_fd, dir) = login_dir_create(&base, uid, gid).unwrap();
        let _pipe = ready_fifo_create(&dir, uid, gid).unwrap();
        fs::create_dir(dir.join("dinit.1234")).unwrap();
        fs::write(dir.join("dinit.1234").join("boot"), "type = internal\n").unwrap();

        login_dir_remove(&dir);
        assert!(!dir.exists());
        // Removing a gone directory is harmless.
        login_dir_remove(&dir);
    }

    #[test]
    fn test_rundir_make_and_clear() {
        let base = unique_test_dir();
        let (uid, gid) = own_ids();
        let rundir = base.join("rt").join("user").join(uid.to_string());
        let rundir_s = rundir.to_str().unwrap();

        rundir_make(rundir_s, uid, gid).unwrap();
        let meta = fs::metadata(&rundir).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o700);
        let parent = fs::metadata(rundir.parent().unwrap()).unwrap();
        assert_eq!(parent.permissions().mode() & 0o7777, 0o755);

        rundir_clear(rundir_s);
        assert!(!rundir.exists());
    }

    #[test]
    fn test_rundir_must_be_absolute() {
        let (uid, gid) = own_ids();
        assert!(rundir_make("relative/run", uid, gid).is_err());
    }
}
