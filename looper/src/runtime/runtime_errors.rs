// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words maxfiles epoll kqueue

//! Caller-visible error types for the message-loop runtime.
//!
//! These cover the *transient* failure modes of the runtime - outcomes a
//! correct program must handle, like posting to a queue that has quit.
//! Programmer mistakes (enqueueing an in-use message, double-preparing a
//! thread, removing an unknown barrier token) are panics, not errors; they
//! are documented under `# Panics` on the operations that detect them.

use std::{io, os::fd::RawFd};

/// Errors from [`Looper::prepare()`] and [`LooperThread::spawn()`].
///
/// Each variant represents a distinct OS-resource failure with a dedicated
/// [diagnostic code] and actionable help text.
///
/// [`Looper::prepare()`]: crate::runtime::looper::Looper::prepare
/// [`LooperThread::spawn()`]: crate::runtime::looper_thread::LooperThread::spawn
/// [diagnostic code]: miette::Diagnostic::code
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum PrepareError {
    /// The OS poller (epoll / kqueue) could not be created.
    #[error("Failed to create the OS poller backing the message queue")]
    #[diagnostic(
        code(r3bl_looper::prepare::poll_creation),
        help(
            "Check OS resource limits - \
             use `ulimit -n` for file descriptors"
        )
    )]
    PollCreation(#[source] io::Error),

    /// The cross-thread wake handle could not be created.
    #[error("Failed to create the wake handle for the message queue")]
    #[diagnostic(
        code(r3bl_looper::prepare::waker_creation),
        help(
            "Check OS resource limits - \
             use `ulimit -n` for file descriptors"
        )
    )]
    WakerCreation(#[source] io::Error),

    /// The poller registry could not be cloned for cross-thread fd updates.
    #[error("Failed to clone the poller registry for cross-thread fd updates")]
    #[diagnostic(code(r3bl_looper::prepare::registry_clone))]
    RegistryClone(#[source] io::Error),
}

/// Error from every enqueue-shaped operation (`post*`, `send*`).
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum SendError {
    /// The target queue is quitting; the message was dropped and recycled.
    #[error("message queue is quitting; the message was dropped")]
    #[diagnostic(
        code(r3bl_looper::send::quitting),
        help(
            "quit() / quit_safely() was called on the target looper. \
             No further work can be enqueued on it."
        )
    )]
    Quitting,
}

/// Error from [`Handler::run_synchronously()`].
///
/// [`Handler::run_synchronously()`]: crate::runtime::handler::Handler::run_synchronously
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RunSyncError {
    /// The deadline elapsed before the posted task signalled completion.
    #[error("timed out waiting for the posted task to complete")]
    #[diagnostic(
        code(r3bl_looper::run_sync::timeout),
        help(
            "The task is still queued and may run later. \
             Remove it with Handler::remove_callbacks() if that is unwanted."
        )
    )]
    Timeout,

    /// The task could not be enqueued at all.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Send(#[from] SendError),
}

/// Error from [`MessageQueue::set_fd_listener()`].
///
/// [`MessageQueue::set_fd_listener()`]: crate::runtime::message_queue::MessageQueue::set_fd_listener
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum FdWatchError {
    /// The kernel watch set could not be updated for this descriptor.
    #[error("failed to update the kernel watch set for fd {fd}")]
    #[diagnostic(
        code(r3bl_looper::fd_watch::registration),
        help("The fd must be valid, open, and pollable (pipes, sockets, ttys)")
    )]
    Registration {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

/// Errors from [`LooperThread::spawn()`].
///
/// [`LooperThread::spawn()`]: crate::runtime::looper_thread::LooperThread::spawn
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum SpawnError {
    /// [`std::thread::Builder::spawn()`] failed.
    #[error("Failed to spawn the looper thread")]
    #[diagnostic(
        code(r3bl_looper::spawn::thread_spawn),
        help(
            "The system may have reached its thread limit - \
             check `ulimit -u` for the per-user limit"
        )
    )]
    ThreadSpawn(#[source] io::Error),

    /// The worker thread exited before reporting its looper back.
    #[error("Looper thread exited before completing the startup handshake")]
    #[diagnostic(code(r3bl_looper::spawn::handshake))]
    Handshake,

    /// The worker thread failed to prepare its looper.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Prepare(#[from] PrepareError),
}
