//! Control socket.
//!
//! A SEQPACKET socket at a fixed path under the runtime base, world
//! connectable; authentication happens per message by comparing the peer's
//! effective UID (`SO_PEERCRED`) against the UID a session claims. The
//! socket file is recreated on startup so a stale one never blocks binding.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, getsockopt, listen, socket, sockopt, AddressFamily, Backlog, SockFlag,
    SockType, UnixAddr,
};

/// Any local user may connect; credentials are checked per session.
pub const CSOCK_MODE: u32 = 0o666;

/// Create, bind and listen on the control socket.
pub fn control_socket_create(path: &Path) -> io::Result<OwnedFd> {
    let sock = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io::Error::from)?;
    log::debug!(
        "socket: created {} for {}",
        sock.as_raw_fd(),
        path.display()
    );

    let addr = UnixAddr::new(path).map_err(io::Error::from)?;
    let _ = fs::remove_file(path);
    bind(sock.as_raw_fd(), &addr).map_err(io::Error::from)?;
    log::debug!("socket: bound {}", path.display());

    let finish = (|| {
        fs::set_permissions(path, fs::Permissions::from_mode(CSOCK_MODE))?;
        listen(&sock, Backlog::MAXCONN).map_err(io::Error::from)
    })();
    if let Err(e) = finish {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    log::debug!("socket: listening");
    Ok(sock)
}

/// Accept one pending connection, non-blocking and close-on-exec.
/// `Ok(None)` means the backlog is drained.
pub fn accept_conn(sock: RawFd) -> nix::Result<Option<OwnedFd>> {
    match accept4(sock, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
        Ok(fd) => Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) })),
        Err(Errno::EAGAIN) => Ok(None),
        Err(e) => Err(e),
    }
}

/// The peer's effective UID at connect time.
pub fn peer_euid(fd: RawFd) -> nix::Result<libc::uid_t> {
    let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
    let creds = getsockopt(&bfd, sockopt::PeerCredentials)?;
    Ok(creds.uid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{connect, recv, send, MsgFlags};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_sock_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        PathBuf::from(format!(
            "/tmp/turnstiled-sock-test-{}-{}.sock",
            std::process::id(),
            id
        ))
    }

    fn client_connect(path: &Path) -> OwnedFd {
        let sock = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .unwrap();
        let addr = UnixAddr::new(path).unwrap();
        connect(sock.as_raw_fd(), &addr).unwrap();
        sock
    }

    #[test]
    fn test_accept_and_peer_euid() {
        let path = unique_sock_path();
        let srv = control_socket_create(&path).unwrap();

        // Nothing pending yet.
        assert!(accept_conn(srv.as_raw_fd()).unwrap().is_none());

        let client = client_connect(&path);
        let conn = accept_conn(srv.as_raw_fd()).unwrap().unwrap();
        assert_eq!(
            peer_euid(conn.as_raw_fd()).unwrap(),
            nix::unistd::geteuid().as_raw()
        );

        drop(client);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_seqpacket_word_exchange() {
        let path = unique_sock_path();
        let srv = control_socket_create(&path).unwrap();
        let client = client_connect(&path);
        let conn = accept_conn(srv.as_raw_fd()).unwrap().unwrap();

        let word = crate::protocol::encode(crate::protocol::MsgType::Start, 1000);
        send(client.as_raw_fd(), &word.to_le_bytes(), MsgFlags::empty()).unwrap();

        let mut buf = [0u8; 4];
        let n = recv(conn.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(n, 4);
        assert_eq!(u32::from_le_bytes(buf), word);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_rebind_over_stale_socket() {
        let path = unique_sock_path();
        let first = control_socket_create(&path).unwrap();
        drop(first);
        // The socket file is still on disk; creation must replace it.
        let _second = control_socket_create(&path).unwrap();
        let _ = fs::remove_file(&path);
    }
}
