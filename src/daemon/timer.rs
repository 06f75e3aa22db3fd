//! Per-login timers.
//!
//! Each login owns at most one one-shot CLOCK_MONOTONIC timer. It serves
//! two purposes at different times: the login-boot timeout armed when the
//! service manager is forked, and the kill-escalation timeout armed when
//! SIGTERM is sent to a terminating instance. Expiry delivers SIGALRM with
//! the login's UID as the sigevent value; the event loop routes it back to
//! the registry through the signal pipe.

use nix::sys::signal::{SigEvent, SigevNotify, Signal};
use nix::sys::time::TimeSpec;
use nix::sys::timer::{Expiration, Timer, TimerSetTimeFlags};
use nix::time::ClockId;

use crate::login::Login;

/// Seconds granted to a SIGTERM'd service manager before escalation.
pub const KILL_TIMEOUT: u64 = 60;

impl Login {
    /// Arm the login's timer for `secs` seconds.
    ///
    /// The timer must not already be armed; a leftover one is discarded
    /// with a warning rather than left ticking against a stale state.
    pub fn arm_timer(&mut self, secs: u64) -> nix::Result<()> {
        if self.timer.take().is_some() {
            log::debug!("timer: replacing armed timer for {}", self.uid);
        }
        let sev = SigEvent::new(SigevNotify::SigevSignal {
            signal: Signal::SIGALRM,
            si_value: self.uid as libc::intptr_t,
        });
        let mut timer = Timer::new(ClockId::CLOCK_MONOTONIC, sev)?;
        timer.set(
            Expiration::OneShot(TimeSpec::new(secs as i64, 0)),
            TimerSetTimeFlags::empty(),
        )?;
        log::debug!("timer: armed {}s for {}", secs, self.uid);
        self.timer = Some(timer);
        Ok(())
    }

    /// Disarm and delete the timer; a no-op when none is armed.
    pub fn disarm_timer(&mut self) {
        if self.timer.take().is_some() {
            log::debug!("timer: disarm for {}", self.uid);
        }
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_disarm() {
        // SIGALRM stays blocked from delivery here because the expiry is
        // far away; the timer is deleted long before it can fire.
        let mut lgn = Login::new(1000);
        assert!(!lgn.timer_armed());
        lgn.arm_timer(3600).unwrap();
        assert!(lgn.timer_armed());
        lgn.disarm_timer();
        assert!(!lgn.timer_armed());
        // Disarming again is a no-op.
        lgn.disarm_timer();
    }

    #[test]
    fn test_rearm_replaces() {
        let mut lgn = Login::new(1000);
        lgn.arm_timer(3600).unwrap();
        lgn.arm_timer(7200).unwrap();
        assert!(lgn.timer_armed());
        lgn.disarm_timer();
    }
}
