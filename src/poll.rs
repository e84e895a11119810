//! `poll(2)`-based readiness backend.
//!
//! The reactor rebuilds the descriptor set on every pass, so the
//! poller keeps no persistent registrations: [`Poller::begin_pass`]
//! clears the set, [`Poller::watch`] adds one descriptor, and
//! [`Poller::wait`] blocks until readiness, a wakeup, or the timeout.
//!
//! The wake-up mechanism is an `eventfd` that other threads write to
//! through the shared [`Waker`], interrupting a blocking `poll()` so
//! queued broadcast messages get drained promptly.

use crate::sys::{sys_close, sys_eventfd};

use libc::{POLLERR, POLLHUP, POLLIN, POLLOUT, pollfd};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Reserved token used internally for the wake-up descriptor.
///
/// The connection slab never produces this value, so it cannot
/// collide with a real connection token.
const WAKE_TOKEN: usize = usize::MAX;

/// Readiness interests for one descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

/// One readiness event produced by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub(crate) token: usize,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// Handle used to interrupt a blocking [`Poller::wait`] call.
///
/// Cloning the `Arc<Waker>` and calling [`wake`](Waker::wake) from
/// another thread is the only cross-thread entry point of the crate.
pub(crate) struct Waker(RawFd);

impl Waker {
    /// Wakes the poller by writing to the internal eventfd.
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.0, &buf as *const _ as *const _, 8);
        }
    }

    /// Drains the eventfd counter after a wakeup.
    fn drain(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(self.0, &mut buf as *mut _ as *mut _, 8);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        sys_close(self.0);
    }
}

/// Per-pass descriptor set over `poll(2)`.
///
/// Slot zero always holds the wake eventfd; connection descriptors
/// are appended behind it each pass.
pub(crate) struct Poller {
    /// Descriptor set submitted to `poll(2)`.
    fds: Vec<pollfd>,

    /// Connection token for each slot in `fds`.
    tokens: Vec<usize>,

    /// Waker wrapping the internal eventfd.
    waker: Arc<Waker>,
}

impl Poller {
    /// Creates a poller and its wake eventfd.
    pub(crate) fn new() -> io::Result<Self> {
        let eventfd = sys_eventfd()?;

        Ok(Self {
            fds: Vec::with_capacity(64),
            tokens: Vec::with_capacity(64),
            waker: Arc::new(Waker(eventfd)),
        })
    }

    /// Returns the shared waker.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Resets the descriptor set for a new reactor pass.
    pub(crate) fn begin_pass(&mut self) {
        self.fds.clear();
        self.tokens.clear();

        self.fds.push(pollfd {
            fd: self.waker.0,
            events: POLLIN,
            revents: 0,
        });
        self.tokens.push(WAKE_TOKEN);
    }

    /// Adds a descriptor to the current pass with the given interests.
    ///
    /// A descriptor with no interest is still watched for errors.
    pub(crate) fn watch(&mut self, fd: RawFd, token: usize, interest: Interest) {
        let mut events = 0;

        if interest.read {
            events |= POLLIN;
        }
        if interest.write {
            events |= POLLOUT;
        }

        self.fds.push(pollfd {
            fd,
            events,
            revents: 0,
        });
        self.tokens.push(token);
    }

    /// Blocks until readiness, a wakeup, or the timeout expires.
    ///
    /// Fills `events` with the ready descriptors and returns `true`
    /// if the waker fired during this wait.
    pub(crate) fn wait(
        &mut self,
        events: &mut Vec<PollEvent>,
        timeout: Duration,
    ) -> io::Result<bool> {
        events.clear();

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as _, timeout_ms) };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        let mut woke = false;

        for (pfd, &token) in self.fds.iter().zip(self.tokens.iter()) {
            if pfd.revents == 0 {
                continue;
            }

            if token == WAKE_TOKEN {
                self.waker.drain();
                woke = true;
                continue;
            }

            // Errors and hangups surface through the read path, where
            // a zero-length read or SO_ERROR check classifies them.
            let readable = pfd.revents & (POLLIN | POLLERR | POLLHUP) != 0;
            let writable = pfd.revents & (POLLOUT | POLLERR) != 0;

            events.push(PollEvent {
                token,
                readable,
                writable,
            });
        }

        Ok(woke)
    }
}
