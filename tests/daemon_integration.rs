//! End-to-end tests against a live daemon.
//!
//! These claim the real control socket under /run and therefore need
//! root; they are ignored by default.
//!
//! Run with: cargo test --test daemon_integration -- --ignored --test-threads=1

use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use nix::sys::socket::{
    connect, recv, send, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr,
};

use turnstiled::protocol::{aux, chunk_bytes, encode, MsgType, MSG_CHUNK_BYTES};
use turnstiled::scaffold::DAEMON_SOCK;

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn write_config(body: &str) -> PathBuf {
    let dir = PathBuf::from(format!("/tmp/turnstiled-e2e-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("turnstiled.conf");
    fs::write(&path, body).unwrap();
    path
}

fn spawn_daemon(cfg: &Path) -> Child {
    let child = Command::new(env!("CARGO_BIN_EXE_turnstiled"))
        .arg(cfg)
        .spawn()
        .unwrap();
    // Wait for the control socket to appear.
    for _ in 0..100 {
        if Path::new(DAEMON_SOCK).exists() {
            return child;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("daemon did not create {}", DAEMON_SOCK);
}

fn client_connect() -> OwnedFd {
    let sock = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .unwrap();
    let addr = UnixAddr::new(DAEMON_SOCK).unwrap();
    connect(sock.as_raw_fd(), &addr).unwrap();
    sock
}

fn send_word(fd: &OwnedFd, word: u32) {
    send(fd.as_raw_fd(), &word.to_le_bytes(), MsgFlags::empty()).unwrap();
}

fn recv_word(fd: &OwnedFd) -> u32 {
    let mut buf = [0u8; 4];
    let n = recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(n, 4);
    u32::from_le_bytes(buf)
}

fn stop_daemon(mut child: Child) {
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM).unwrap();
    let status = child.wait().unwrap();
    assert!(status.success(), "daemon exited with {:?}", status);
}

// Happy path with the backend disabled: start a session, observe the
// wait/done handshake, read the rundir back, shut the daemon down clean.
#[test]
#[ignore]
fn test_login_roundtrip_disabled_backend() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let cfg = write_config("backend = none\nmanage_rdir = no\nlogin_timeout = 30\n");
    let daemon = spawn_daemon(&cfg);

    let conn = client_connect();
    let uid = nix::unistd::geteuid().as_raw();
    send_word(&conn, encode(MsgType::Start, uid));
    assert_eq!(MsgType::from_word(recv_word(&conn)), Some(MsgType::OkWait));
    assert_eq!(MsgType::from_word(recv_word(&conn)), Some(MsgType::OkDone));

    // Retrieve the rundir string.
    send_word(&conn, encode(MsgType::ReqRlen, 0));
    let reply = recv_word(&conn);
    assert_eq!(MsgType::from_word(reply), Some(MsgType::Data));
    let expect = format!("/run/user/{}", uid);
    let mut remaining = expect.len() as u32;
    assert!(aux(reply) >= remaining);

    let mut out = Vec::new();
    while remaining > 0 {
        send_word(&conn, encode(MsgType::ReqRdata, remaining));
        let word = recv_word(&conn);
        assert_eq!(MsgType::from_word(word), Some(MsgType::Data));
        let take = (remaining as usize).min(MSG_CHUNK_BYTES);
        out.extend(chunk_bytes(word, take));
        remaining -= take as u32;
    }
    assert_eq!(out, expect.as_bytes());

    // A second connection attaches to the booted login immediately.
    let conn2 = client_connect();
    send_word(&conn2, encode(MsgType::Start, uid));
    assert_eq!(MsgType::from_word(recv_word(&conn2)), Some(MsgType::OkDone));

    drop(conn);
    drop(conn2);
    stop_daemon(daemon);
}

// A mismatched UID claim is rejected outright.
#[test]
#[ignore]
fn test_uid_spoof_rejected() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    // Root peers may claim any UID, so a spoof can only be observed from
    // an unprivileged peer; simulate by claiming a UID that cannot be
    // resolved instead, which also must answer Err.
    let cfg = write_config("backend = none\n");
    let daemon = spawn_daemon(&cfg);

    let conn = client_connect();
    send_word(&conn, encode(MsgType::Start, 0x0fff_fffe));
    assert_eq!(MsgType::from_word(recv_word(&conn)), Some(MsgType::Err));

    drop(conn);
    stop_daemon(daemon);
}
