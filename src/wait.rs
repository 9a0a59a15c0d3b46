//! Notification modes for the SPSC primitives.
//!
//! A [`WaitMode`] decides how a producer wakes a waiting consumer and how a
//! consumer waits for data. The mode is a compile-time choice: each queue or
//! buffer is parameterized by one of the marker types below, so the hot path
//! carries only the machinery its mode needs.
//!
//! | Mode | producer `signal` | consumer `wait` |
//! |------|-------------------|-----------------|
//! | [`WaitFree`] | release-store only | none (caller guarantees availability) |
//! | [`Spin`] | release-store only | busy-spin on the predicate |
//! | [`Condvar`] | lock, publish, unlock, notify | test predicate, then block on the condvar |
//! | [`SpinCondvar`] | as `Condvar` | spin up to `SPINS` times, then block |
//! | [`TimedCondvar`] | signal every `EVERY`-th call | loop on a timed wait until ready |
//! | [`EventFd`] | release-store, then write 1 to an eventfd | none (caller polls the fd) |
//!
//! The release-store is always performed, even by the modes that take a
//! mutex: emptiness checks and the spinning paths observe the published
//! cursor without holding the lock.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use parking_lot::Mutex;
use rustix::event::{EventfdFlags, eventfd};
use rustix::io::Errno;

/// How a producer/consumer pair synchronizes around published data.
///
/// `signal` runs on the producer thread and receives the release-publish as
/// a closure, so modes that need to publish under a mutex can. `wait` runs
/// on the consumer thread and blocks (or spins, or asserts) until `ready`
/// holds.
pub trait WaitMode: Send + Sync + Sized + 'static {
    /// Whether `wait` may suspend the consumer. Non-blocking modes take the
    /// checked fast path in the buffer's read loop.
    const BLOCKING: bool;

    /// Producer-side batching: only every `NOTIFY_EVERY`-th notification
    /// wakes the consumer; the rest publish without signaling.
    const NOTIFY_EVERY: u32 = 1;

    /// Creates the mode's state. Only [`EventFd`] can fail.
    fn new() -> Result<Self, Errno>;

    /// Runs the release-publish and wakes the consumer as the mode dictates.
    fn signal(&self, publish: impl FnOnce());

    /// Blocks until `ready()` returns true.
    fn wait(&self, ready: impl Fn() -> bool);
}

/// No waiting at all. The consumer must know data is available before it
/// reads, e.g. by checking emptiness per datum or by external agreement.
/// Reads that would outrun the producer panic instead of racing.
#[derive(Debug, Default)]
pub struct WaitFree;

impl WaitMode for WaitFree {
    const BLOCKING: bool = false;

    fn new() -> Result<Self, Errno> {
        Ok(Self)
    }

    #[inline]
    fn signal(&self, publish: impl FnOnce()) {
        publish();
    }

    #[inline]
    fn wait(&self, ready: impl Fn() -> bool) {
        assert!(ready(), "data not available in wait-free mode");
    }
}

/// Busy-spin until data arrives. Lowest latency, burns a core.
#[derive(Debug, Default)]
pub struct Spin;

impl WaitMode for Spin {
    const BLOCKING: bool = true;

    fn new() -> Result<Self, Errno> {
        Ok(Self)
    }

    #[inline]
    fn signal(&self, publish: impl FnOnce()) {
        publish();
    }

    #[inline]
    fn wait(&self, ready: impl Fn() -> bool) {
        while !ready() {
            std::hint::spin_loop();
        }
    }
}

/// Block on a condition variable.
///
/// The producer publishes while holding the mutex and signals after
/// releasing it; the consumer re-tests the predicate under the mutex before
/// sleeping, so no wakeup can be lost.
#[derive(Debug, Default)]
pub struct Condvar {
    mtx: Mutex<()>,
    cv: parking_lot::Condvar,
}

impl WaitMode for Condvar {
    const BLOCKING: bool = true;

    fn new() -> Result<Self, Errno> {
        Ok(Self::default())
    }

    fn signal(&self, publish: impl FnOnce()) {
        let guard = self.mtx.lock();
        publish();
        drop(guard);
        self.cv.notify_one();
    }

    fn wait(&self, ready: impl Fn() -> bool) {
        if ready() {
            return;
        }
        let mut guard = self.mtx.lock();
        while !ready() {
            self.cv.wait(&mut guard);
        }
    }
}

/// Spin up to `SPINS` iterations, then fall back to a condition variable.
/// Trades a bounded amount of CPU for condvar latency when the producer is
/// bursty.
#[derive(Debug, Default)]
pub struct SpinCondvar<const SPINS: u32> {
    mtx: Mutex<()>,
    cv: parking_lot::Condvar,
}

impl<const SPINS: u32> WaitMode for SpinCondvar<SPINS> {
    const BLOCKING: bool = true;

    fn new() -> Result<Self, Errno> {
        Ok(Self::default())
    }

    fn signal(&self, publish: impl FnOnce()) {
        let guard = self.mtx.lock();
        publish();
        drop(guard);
        self.cv.notify_one();
    }

    fn wait(&self, ready: impl Fn() -> bool) {
        for _ in 0..SPINS {
            if ready() {
                return;
            }
            std::hint::spin_loop();
        }
        let mut guard = self.mtx.lock();
        while !ready() {
            self.cv.wait(&mut guard);
        }
    }
}

/// Condition variable with producer-side batching and a consumer-side
/// timeout.
///
/// The producer signals only every `EVERY`-th notification (the others are a
/// plain release-store). The consumer wakes at least every `TIMEOUT_US`
/// microseconds to re-test the predicate, which bounds the latency a
/// swallowed notification can cost. `TIMEOUT_US == 0` waits untimed, giving
/// the purely batched variant.
#[derive(Debug, Default)]
pub struct TimedCondvar<const EVERY: u32, const TIMEOUT_US: u64> {
    mtx: Mutex<()>,
    cv: parking_lot::Condvar,
}

/// Batched condition variable: every `EVERY`-th notification signals, the
/// consumer waits untimed.
pub type BatchedCondvar<const EVERY: u32> = TimedCondvar<EVERY, 0>;

impl<const EVERY: u32, const TIMEOUT_US: u64> WaitMode for TimedCondvar<EVERY, TIMEOUT_US> {
    const BLOCKING: bool = true;
    const NOTIFY_EVERY: u32 = EVERY;

    fn new() -> Result<Self, Errno> {
        Ok(Self::default())
    }

    fn signal(&self, publish: impl FnOnce()) {
        let guard = self.mtx.lock();
        publish();
        drop(guard);
        self.cv.notify_one();
    }

    fn wait(&self, ready: impl Fn() -> bool) {
        while !ready() {
            let mut guard = self.mtx.lock();
            if ready() {
                return;
            }
            if TIMEOUT_US == 0 {
                self.cv.wait(&mut guard);
            } else {
                let _ = self
                    .cv
                    .wait_for(&mut guard, Duration::from_micros(TIMEOUT_US));
            }
        }
    }
}

/// Publish, then write 1 to an eventfd the caller can poll.
///
/// The fd is non-blocking; each notification adds 1 to its counter and the
/// caller is responsible for draining it. Write errors on the fd are
/// ignored: the notification is best-effort, the release-store is not.
/// Reads behave as in [`WaitFree`] - poll the fd first, then consume.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// The eventfd to hand to `poll`/`epoll`.
    #[must_use]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl WaitMode for EventFd {
    const BLOCKING: bool = false;

    fn new() -> Result<Self, Errno> {
        let fd = eventfd(0, EventfdFlags::NONBLOCK)?;
        Ok(Self { fd })
    }

    #[inline]
    fn signal(&self, publish: impl FnOnce()) {
        publish();
        let _ = rustix::io::write(&self.fd, &1u64.to_ne_bytes());
    }

    #[inline]
    fn wait(&self, ready: impl Fn() -> bool) {
        assert!(ready(), "data not available; drain the eventfd before reading");
    }
}
