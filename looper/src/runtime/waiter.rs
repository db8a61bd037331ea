// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EINTR epoll kqueue eventfd

//! OS-level sleep-with-timeout that is wakeable and fd-readiness-aware.
//!
//! Backed by [`mio::Poll`] (epoll on Linux, kqueue on macOS) plus a
//! [`mio::Waker`] for cross-thread wakeups, hiding the platform differences
//! behind three operations: [`wait_once`], [`wake`], and the fd watch-set
//! updates. Exactly one thread - the queue's owner - ever sleeps in
//! [`wait_once`]; any thread may call [`wake`] or reprogram the watch set,
//! which is why the [`mio::Registry`] is cloned out of the `Poll` at
//! construction time (a `Waker` is bound to the `Poll` it was created from,
//! so the two are created together).
//!
//! [`wait_once`]: Waiter::wait_once
//! [`wake`]: Waiter::wake

use std::{io, os::fd::RawFd, sync::Mutex, time::Duration};

use bitflags::bitflags;
use mio::{Events, Interest, Poll, Registry, Token, Waker, unix::SourceFd};
use smallvec::SmallVec;

use crate::runtime::runtime_errors::{FdWatchError, PrepareError};

/// Token reserved for the wake handle. Watched fds use `Token(fd + 1)` so
/// fd 0 never collides with this.
const WAKE_TOKEN: Token = Token(0);

bitflags! {
    /// Readiness classes for a watched file descriptor.
    ///
    /// `ERROR` is implicitly ORed into every non-zero watch mask: error
    /// readiness is always delivered, whether or not a listener asked for
    /// it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdEvents: u8 {
        /// The fd has data to read (or a peer hung up).
        const INPUT = 1 << 0;
        /// The fd is writable without blocking.
        const OUTPUT = 1 << 1;
        /// The fd is in an error state.
        const ERROR = 1 << 2;
    }
}

/// One fd that became ready during a [`Waiter::wait_once`] call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FdReadiness {
    pub fd: RawFd,
    pub events: FdEvents,
}

pub(crate) type ReadinessBatch = SmallVec<[FdReadiness; 4]>;

/// Poller state touched only by the owning thread while it waits. The mutex
/// exists to make [`Waiter`] `Sync`, not to arbitrate contention.
struct PollState {
    poll: Poll,
    events: Events,
}

/// The sleep/wake primitive underneath a message queue.
pub(crate) struct Waiter {
    state: Mutex<PollState>,
    registry: Registry,
    waker: Waker,
}

impl Waiter {
    pub(crate) fn new() -> Result<Waiter, PrepareError> {
        let poll = Poll::new().map_err(PrepareError::PollCreation)?;
        let waker =
            Waker::new(poll.registry(), WAKE_TOKEN).map_err(PrepareError::WakerCreation)?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(PrepareError::RegistryClone)?;
        Ok(Waiter {
            state: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(64),
            }),
            registry,
            waker,
        })
    }

    /// Sleeps until the timeout elapses, [`wake`](Self::wake) is called, or
    /// a watched fd becomes ready. `None` sleeps indefinitely; a zero
    /// timeout polls without blocking. Returns the fds that became ready
    /// (possibly none - a wakeup or timeout produces an empty batch).
    pub(crate) fn wait_once(&self, timeout: Option<Duration>) -> ReadinessBatch {
        let mut guard = self.state.lock().expect("waiter poll mutex poisoned");
        let PollState { poll, events } = &mut *guard;
        let mut batch = ReadinessBatch::new();
        match poll.poll(events, timeout) {
            Ok(()) => {
                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    let Ok(fd) = RawFd::try_from(event.token().0 - 1) else {
                        continue;
                    };
                    let mut mask = FdEvents::empty();
                    if event.is_readable() {
                        mask |= FdEvents::INPUT;
                    }
                    if event.is_writable() {
                        mask |= FdEvents::OUTPUT;
                    }
                    if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                        mask |= FdEvents::ERROR;
                    }
                    if !mask.is_empty() {
                        batch.push(FdReadiness { fd, events: mask });
                    }
                }
            }
            // EINTR: a signal interrupted the sleep. Treat as a spurious
            // wakeup; the caller re-derives its timeout and waits again.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::error!(?err, "message queue poller failed");
            }
        }
        batch
    }

    /// Interrupts a concurrent or future [`wait_once`](Self::wait_once).
    /// Idempotent and safe from any thread.
    pub(crate) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            tracing::warn!(?err, "failed to wake message queue");
        }
    }

    /// Adds or updates `fd` in the kernel watch set.
    pub(crate) fn watch_fd(
        &self,
        fd: RawFd,
        events: FdEvents,
        already_watched: bool,
    ) -> Result<(), FdWatchError> {
        let interest = interest_for(events);
        let mut source = SourceFd(&fd);
        let result = if already_watched {
            self.registry.reregister(&mut source, token_for(fd), interest)
        } else {
            self.registry.register(&mut source, token_for(fd), interest)
        };
        result.map_err(|err| FdWatchError::Registration { fd, source: err })
    }

    /// Drops `fd` from the kernel watch set. Failures are logged, not
    /// surfaced: the fd may already be closed.
    pub(crate) fn unwatch_fd(&self, fd: RawFd) {
        let mut source = SourceFd(&fd);
        if let Err(err) = self.registry.deregister(&mut source) {
            tracing::warn!(fd, ?err, "failed to remove fd from the watch set");
        }
    }
}

fn token_for(fd: RawFd) -> Token {
    debug_assert!(fd >= 0, "watched fds must be valid descriptors");
    Token(usize::try_from(fd).unwrap_or_default() + 1)
}

/// Maps a watch mask to poller interest. Error readiness is reported
/// unconditionally by the kernel, so an error-only mask still registers
/// read interest to keep the fd in the watch set.
fn interest_for(events: FdEvents) -> Interest {
    match (
        events.contains(FdEvents::INPUT),
        events.contains(FdEvents::OUTPUT),
    ) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}
