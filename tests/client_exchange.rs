//! Protocol exchange over a real SEQPACKET pair.
//!
//! Drives the message words a PAM client would send through an actual
//! socket, with the daemon side of the rundir transfer simulated by the
//! same helpers the daemon uses. No privileges required.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{
    recv, send, socketpair, AddressFamily, MsgFlags, SockFlag, SockType,
};

use turnstiled::protocol::{
    self, aux, chunk_bytes, encode, rundir_chunk_reply, rundir_len_reply, MsgType,
    DIRLEN_MAX, MSG_CHUNK_BYTES,
};

fn pair() -> (OwnedFd, OwnedFd) {
    socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .unwrap()
}

fn send_word(fd: &OwnedFd, word: u32) {
    let n = send(fd.as_raw_fd(), &word.to_le_bytes(), MsgFlags::empty()).unwrap();
    assert_eq!(n, 4);
}

fn recv_word(fd: &OwnedFd) -> u32 {
    let mut buf = [0u8; 4];
    let n = recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(n, 4);
    u32::from_le_bytes(buf)
}

// Each message word travels as exactly one datagram in either direction.
#[test]
fn test_word_per_datagram() {
    let (client, server) = pair();
    send_word(&client, encode(MsgType::Start, 1000));
    let word = recv_word(&server);
    assert_eq!(MsgType::from_word(word), Some(MsgType::Start));
    assert_eq!(aux(word), 1000);

    send_word(&server, encode(MsgType::OkWait, 0));
    assert_eq!(
        MsgType::from_word(recv_word(&client)),
        Some(MsgType::OkWait)
    );
}

// Full rundir retrieval as the client performs it: length request, then
// chunk requests with a decremented remainder until nothing is left.
#[test]
fn test_rundir_retrieval_flow() {
    let rundir = "/run/user/1000";
    let (client, server) = pair();

    // Client asks for the length; daemon reports it with the managed-dir
    // allocation margin.
    send_word(&client, encode(MsgType::ReqRlen, 0));
    let _ = recv_word(&server);
    send_word(&server, rundir_len_reply(rundir, true));
    let reply = recv_word(&client);
    assert_eq!(MsgType::from_word(reply), Some(MsgType::Data));
    let alloc = aux(reply);
    assert_eq!(alloc, rundir.len() as u32 + DIRLEN_MAX);

    // The string itself is its real length; the margin is only for the
    // client's buffer sizing.
    let mut remaining = rundir.len() as u32;
    let mut out = Vec::new();
    while remaining > 0 {
        send_word(&client, encode(MsgType::ReqRdata, remaining));
        let req = recv_word(&server);
        assert_eq!(MsgType::from_word(req), Some(MsgType::ReqRdata));
        let reply = rundir_chunk_reply(rundir, aux(req)).unwrap();
        send_word(&server, reply);

        let word = recv_word(&client);
        assert_eq!(MsgType::from_word(word), Some(MsgType::Data));
        let take = (remaining as usize).min(MSG_CHUNK_BYTES);
        out.extend(chunk_bytes(word, take));
        remaining -= take as u32;
    }
    assert_eq!(out, rundir.as_bytes());
}

// Out-of-range remainders are answered with Err, exactly at the bounds.
#[test]
fn test_rundir_request_bounds() {
    let rundir = "/run/user/1000";
    let len = rundir.len() as u32;
    for bad in [0, len + 1] {
        let reply = match rundir_chunk_reply(rundir, bad) {
            Some(word) => word,
            None => encode(MsgType::Err, 0),
        };
        assert_eq!(MsgType::from_word(reply), Some(MsgType::Err));
    }
    assert!(rundir_chunk_reply(rundir, len).is_some());
    assert!(rundir_chunk_reply(rundir, 1).is_some());
}

// An empty rundir reports length zero and the client asks for nothing.
#[test]
fn test_empty_rundir_flow() {
    let word = rundir_len_reply("", false);
    assert_eq!(MsgType::from_word(word), Some(MsgType::Data));
    assert_eq!(protocol::aux(word), 0);
}
