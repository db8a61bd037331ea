// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue

//! # r3bl_looper
//!
//! Per-thread cooperative message-loop runtime: a single-threaded scheduler
//! that delivers timestamped messages and callbacks to handlers bound to a
//! specific thread, while multiplexing fd readiness and thread-goes-idle
//! hooks on the same wait.
//!
//! The pieces, bottom up:
//!
//! - [`Message`] / the global message pool - poolable work records with a
//!   tagged payload (user code + args, or an inline callback).
//! - [`MessageQueue`] - a time-ordered list with sync [barriers] that can
//!   withhold synchronous work, [idle handlers] that fire when the queue
//!   drains, and [fd listeners] multiplexed into the same kernel wait
//!   (epoll on Linux, kqueue on macOS, via `mio`).
//! - [`Looper`] - binds a queue to a thread ([`Looper::prepare`]) and
//!   drives it ([`Looper::run`]), with slow-dispatch surveillance and a
//!   dispatch logging hook.
//! - [`Handler`] - the thread-affine endpoint with `post*` / `send*` /
//!   `remove*` / `has*` operations, callable from any thread.
//! - [`LooperThread`] - a worker thread that owns a loop end to end.
//! - [`LruCache`] - a size-accounted LRU store with miss-fill and removal
//!   hooks, reusable wherever bounded caching is needed.
//!
//! ## Quick start
//!
//! ```no_run
//! use r3bl_looper::{LooperThread, task};
//!
//! let worker = LooperThread::spawn("worker").unwrap();
//! let handler = worker.new_handler();
//! handler.post(task(|| println!("hello from the worker thread"))).unwrap();
//! worker.quit_safely_and_join();
//! ```
//!
//! ## Concurrency model
//!
//! Scheduling is single-threaded and cooperative *per queue*: every handler
//! body and idle handler runs on the queue's owning thread, strictly one at
//! a time. The queue itself is shared - producers enqueue and cancel from
//! any thread; the owning thread is the only consumer. When nothing is
//! deliverable, the owner sleeps in the kernel with a precise timeout and
//! is woken by cross-thread enqueues that make work deliverable, by fd
//! readiness, or by quit.
//!
//! [barriers]: MessageQueue::post_sync_barrier
//! [fd listeners]: MessageQueue::set_fd_listener
//! [idle handlers]: MessageQueue::add_idle_handler

#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

// Attach sources.
pub mod common;
pub mod runtime;

// Re-export.
pub use common::*;
pub use runtime::*;
