//! Signal self-pipe.
//!
//! Async signal delivery is converted into pollable bytes: each handler
//! writes one fixed-size [`SigRecord`] to a pipe whose read end sits at
//! index 0 of the poll set, so signals are observed in order relative to
//! I/O and all real work happens synchronously in the event loop.
//!
//! The write end is the single process-global this daemon has. Handlers
//! cannot reach the daemon context, and an atomic raw descriptor is the
//! only state they need.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;

/// Size of one record on the signal pipe; well under `PIPE_BUF`, so
/// handler writes never interleave.
pub const SIG_RECORD_SIZE: usize = 16;

/// One signal observation: the signal number plus, for SIGALRM, the UID of
/// the login whose timer fired (delivered through the timer's sigevent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigRecord {
    pub signo: i32,
    pub key: u64,
}

impl SigRecord {
    pub fn decode(buf: &[u8; SIG_RECORD_SIZE]) -> SigRecord {
        let signo = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let key = u64::from_ne_bytes(buf[8..16].try_into().unwrap());
        SigRecord { signo, key }
    }

    fn encode(&self) -> [u8; SIG_RECORD_SIZE] {
        let mut buf = [0u8; SIG_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.signo.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.key.to_ne_bytes());
        buf
    }
}

/// Write end of the self-pipe, for use inside signal handlers only.
static SIGPIPE_WR: AtomicI32 = AtomicI32::new(-1);

fn push_record(signo: i32, key: u64) {
    let fd = SIGPIPE_WR.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let buf = SigRecord { signo, key }.encode();
    // Only async-signal-safe calls from here on.
    unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len());
    }
}

extern "C" fn sig_handler(signo: libc::c_int) {
    push_record(signo, 0);
}

extern "C" fn alrm_handler(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let key = if info.is_null() {
        0
    } else {
        unsafe { (*info).si_value().sival_ptr as usize as u64 }
    };
    push_record(signo, key);
}

/// Create the self-pipe and install the SIGCHLD/SIGTERM/SIGINT handlers
/// plus the SA_SIGINFO SIGALRM handler. Returns (read end, write end);
/// both are close-on-exec and the write end must stay alive for the
/// daemon's lifetime.
pub fn init() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (rd, wr) = pipe2(OFlag::O_CLOEXEC)?;
    SIGPIPE_WR.store(wr.as_raw_fd(), Ordering::SeqCst);

    let sa = SigAction::new(
        SigHandler::Handler(sig_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let ta = SigAction::new(
        SigHandler::SigAction(alrm_handler),
        SaFlags::SA_RESTART | SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGCHLD, &sa)?;
        sigaction(Signal::SIGTERM, &sa)?;
        sigaction(Signal::SIGINT, &sa)?;
        sigaction(Signal::SIGALRM, &ta)?;
    }
    Ok((rd, wr))
}

/// Restore default dispositions in a forked child, before it execs or
/// does anything else that could receive a signal meant for the daemon.
pub fn reset_in_child() {
    let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::SA_RESTART, SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGCHLD, &dfl);
        let _ = sigaction(Signal::SIGALRM, &dfl);
        let _ = sigaction(Signal::SIGTERM, &dfl);
        let _ = sigaction(Signal::SIGINT, &dfl);
    }
}
