// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer sleep state and eventfd wake primitive.
//!
//! Every ring consumer (worker or app thread) owns a [`WakeState`]: an
//! AWAKE/ASLEEP flag word paired with an eventfd. Producers flush ring
//! updates, then signal the eventfd only when the flag reads ASLEEP;
//! consumers run the double-check idle protocol (drain, flag ASLEEP,
//! re-scan, block) so no wakeup is ever lost.
//!
//! Workers register the eventfd with their poll instance; app threads
//! block on it directly with `poll(2)`, optionally with a timer
//! timeout.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const AWAKE: u32 = 0;
const ASLEEP: u32 = 1;

/// Outcome of a blocking wait on an eventfd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The eventfd was signalled.
    Signalled,
    /// The timeout elapsed first.
    Timeout,
}

// =======================================================================
// EventFd
// =======================================================================

/// Non-blocking close-on-exec eventfd.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd is invoked with valid flags and no shared state.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Raw descriptor, for registration with a poll instance.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Add 1 to the eventfd counter, waking any waiter.
    pub fn signal(&self) {
        let payload = 1u64.to_ne_bytes();
        loop {
            // SAFETY: payload references a stack buffer with the 8-byte
            // eventfd payload.
            let ret = unsafe { libc::write(self.fd, payload.as_ptr().cast(), payload.len()) };
            if ret >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                // Counter saturated: the waiter is already pending wake.
                io::ErrorKind::WouldBlock => return,
                _ => {
                    log::debug!("eventfd write failed: {}", err);
                    return;
                }
            }
        }
    }

    /// Reset the counter after a wake.
    pub fn drain(&self) {
        let mut payload = [0u8; 8];
        loop {
            // SAFETY: payload is a stack buffer sized to the eventfd
            // read requirement (8 bytes).
            let ret = unsafe { libc::read(self.fd, payload.as_mut_ptr().cast(), payload.len()) };
            if ret >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return,
                _ => {
                    log::debug!("eventfd read failed: {}", err);
                    return;
                }
            }
        }
    }

    /// Block until signalled or until `timeout` elapses (`None` blocks
    /// indefinitely). Drains the counter on wake.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
        let timeout_ms: libc::c_int = match timeout {
            Some(d) => d.as_millis().try_into().unwrap_or(i32::MAX),
            None => -1,
        };

        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };

        loop {
            // SAFETY: poll_target points to our stack-allocated pollfd.
            let poll_target = std::ptr::addr_of_mut!(pollfd);
            let res = unsafe { libc::poll(poll_target, 1, timeout_ms) };
            if res == 0 {
                return Ok(WaitOutcome::Timeout);
            }
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            self.drain();
            return Ok(WaitOutcome::Signalled);
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        // SAFETY: fd was obtained via libc::eventfd and is closed once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

// =======================================================================
// SleepState / WakeState
// =======================================================================

/// AWAKE/ASLEEP flag word for one consumer.
#[derive(Debug)]
pub struct SleepState {
    state: AtomicU32,
}

impl SleepState {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(AWAKE),
        }
    }

    /// Consumer: announce intent to sleep. The caller must re-scan its
    /// rings *after* this call before actually blocking. The trailing
    /// fence keeps the re-scan loads from moving ahead of the flag
    /// store; together with the fence in [`is_asleep`] it closes the
    /// lost-wakeup window.
    pub fn fall_asleep(&self) {
        self.state.store(ASLEEP, Ordering::SeqCst);
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    /// Consumer: back to running.
    pub fn wake_up(&self) {
        self.state.store(AWAKE, Ordering::SeqCst);
    }

    /// Producer: does this consumer need an eventfd signal?
    ///
    /// The leading fence orders this load after the producer's cursor
    /// publication: a producer observing AWAKE here is guaranteed that
    /// the consumer's post-flag re-scan will see the published cursor.
    pub fn is_asleep(&self) -> bool {
        std::sync::atomic::fence(Ordering::SeqCst);
        self.state.load(Ordering::SeqCst) == ASLEEP
    }
}

impl Default for SleepState {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep flag + wake descriptor for one consumer thread. Shared with
/// every producer that publishes into this consumer's rings.
#[derive(Debug)]
pub struct WakeState {
    pub sleep: SleepState,
    pub eventfd: EventFd,
}

impl WakeState {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sleep: SleepState::new(),
            eventfd: EventFd::new()?,
        })
    }

    /// Producer side: signal the consumer only if it is (or is about to
    /// be) blocked. Called after publishing ring cursors.
    pub fn wake_if_asleep(&self) {
        if self.sleep.is_asleep() {
            self.eventfd.signal();
        }
    }
}
