// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-thread driver for a [`MessageQueue`].
//!
//! A thread becomes a message-loop thread by calling [`Looper::prepare`]
//! once, creating handlers bound to the returned looper, and then calling
//! [`Looper::run`], which blocks dispatching messages until the queue quits.
//! The looper handle itself is cheaply cloneable and freely shared across
//! threads; only [`run`] is thread-affine.
//!
//! ```no_run
//! use r3bl_looper::{Handler, Looper, task};
//!
//! let looper = Looper::prepare(true).unwrap();
//! let handler = Handler::new(&looper);
//! handler.post(task(|| println!("runs on this thread"))).unwrap();
//! handler.post(task(|| {
//!     Looper::my_looper().unwrap().quit_safely();
//! })).unwrap();
//! looper.run();
//! ```
//!
//! [`run`]: Looper::run

use std::{cell::RefCell,
          fmt,
          sync::{Arc, Mutex,
                 atomic::{AtomicU64, Ordering}},
          thread,
          thread::ThreadId};

use crate::{common::clock::uptime_millis,
            runtime::{message::Message,
                      message_queue::MessageQueue,
                      runtime_errors::PrepareError}};

/// Sink for the dispatch logging hook. Receives one line before and one
/// line after every dispatched message.
pub type MessagePrinter = Arc<dyn Fn(&str) + Send + Sync>;

thread_local! {
    static CURRENT_LOOPER: RefCell<Option<Looper>> = const { RefCell::new(None) };
}

struct LooperInner {
    queue: Arc<MessageQueue>,
    thread_id: ThreadId,
    thread_name: String,
    /// 0 disables the corresponding warning.
    slow_dispatch_threshold_ms: AtomicU64,
    slow_delivery_threshold_ms: AtomicU64,
    printer: Mutex<Option<MessagePrinter>>,
}

/// Handle to a thread's message loop. Clone freely; all clones drive the
/// same queue.
#[derive(Clone)]
pub struct Looper {
    inner: Arc<LooperInner>,
}

impl Looper {
    /// Binds a fresh [`MessageQueue`] to the calling thread and returns its
    /// looper. `quit_allowed = false` produces a queue (for an application's
    /// main thread) on which [`quit`](Self::quit) is a usage error.
    ///
    /// # Errors
    ///
    /// Returns [`PrepareError`] if the OS poller resources cannot be
    /// created.
    ///
    /// # Panics
    ///
    /// Panics if this thread already prepared a looper.
    pub fn prepare(quit_allowed: bool) -> Result<Looper, PrepareError> {
        CURRENT_LOOPER.with(|current| {
            let mut slot = current.borrow_mut();
            assert!(
                slot.is_none(),
                "Only one looper may be created per thread; Looper::prepare() was already called"
            );
            let queue = Arc::new(MessageQueue::new(quit_allowed)?);
            let current_thread = thread::current();
            let looper = Looper {
                inner: Arc::new(LooperInner {
                    queue,
                    thread_id: current_thread.id(),
                    thread_name: current_thread.name().unwrap_or("<unnamed>").to_string(),
                    slow_dispatch_threshold_ms: AtomicU64::new(0),
                    slow_delivery_threshold_ms: AtomicU64::new(0),
                    printer: Mutex::new(None),
                }),
            };
            *slot = Some(looper.clone());
            Ok(looper)
        })
    }

    /// The looper prepared by the calling thread, if any.
    #[must_use]
    pub fn my_looper() -> Option<Looper> {
        CURRENT_LOOPER.with(|current| current.borrow().clone())
    }

    /// The queue of the calling thread's looper, if any.
    #[must_use]
    pub fn my_queue() -> Option<Arc<MessageQueue>> {
        Self::my_looper().map(|looper| Arc::clone(looper.queue()))
    }

    /// The queue driven by this looper.
    #[must_use]
    pub fn queue(&self) -> &Arc<MessageQueue> { &self.inner.queue }

    /// True when called on the thread that prepared this looper.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Name of the owning thread, for diagnostics.
    #[must_use]
    pub fn thread_name(&self) -> &str { &self.inner.thread_name }

    /// Dispatches messages until the queue quits and drains.
    ///
    /// Failures raised by a handler body propagate out of this call
    /// unchanged; the runtime does not swallow them.
    ///
    /// # Panics
    ///
    /// Panics if called on a thread other than the one that prepared this
    /// looper.
    pub fn run(&self) {
        assert!(
            self.is_current_thread(),
            "Looper::run() must be called on the thread that prepared this looper"
        );
        loop {
            let Some(mut msg) = self.inner.queue.next() else {
                tracing::debug!(
                    thread = %self.inner.thread_name,
                    "message loop drained; exiting"
                );
                return;
            };
            self.dispatch_message(&mut msg);
            Message::recycle_unchecked(msg);
        }
    }

    fn dispatch_message(&self, msg: &mut Message) {
        let Some(target) = msg.target.clone() else {
            // next() never returns barriers; a missing target here is
            // corruption, not misuse.
            panic!("dispatched message has no target handler")
        };

        let printer = self
            .inner
            .printer
            .lock()
            .expect("looper printer mutex poisoned")
            .clone();
        if let Some(printer) = &printer {
            printer(&format!(
                ">>>>> dispatching to {} {:?}",
                target.name(),
                msg.payload
            ));
        }

        let expected = msg.when();
        let dispatch_start = uptime_millis();
        target.dispatch(msg);
        let dispatch_end = uptime_millis();

        if let Some(printer) = &printer {
            printer(&format!("<<<<< finished {:?}", msg.payload));
        }

        let delivery_threshold = self.inner.slow_delivery_threshold_ms.load(Ordering::Relaxed);
        let delivery_latency = dispatch_start.saturating_sub(expected);
        if delivery_threshold > 0 && delivery_latency > delivery_threshold {
            tracing::warn!(
                thread = %self.inner.thread_name,
                latency_ms = delivery_latency,
                target = target.name(),
                "slow message delivery"
            );
        }
        let dispatch_threshold = self.inner.slow_dispatch_threshold_ms.load(Ordering::Relaxed);
        let dispatch_duration = dispatch_end.saturating_sub(dispatch_start);
        if dispatch_threshold > 0 && dispatch_duration > dispatch_threshold {
            tracing::warn!(
                thread = %self.inner.thread_name,
                duration_ms = dispatch_duration,
                target = target.name(),
                "slow message dispatch"
            );
        }
    }

    /// Ends the loop immediately, discarding every queued message.
    ///
    /// # Panics
    ///
    /// Panics on a looper prepared with `quit_allowed = false`.
    pub fn quit(&self) { self.inner.queue.quit(false); }

    /// Ends the loop once all messages already due have been delivered.
    /// Messages scheduled in the future are discarded.
    ///
    /// # Panics
    ///
    /// Panics on a looper prepared with `quit_allowed = false`.
    pub fn quit_safely(&self) { self.inner.queue.quit(true); }

    /// Configures slow-dispatch surveillance. A dispatch that takes longer
    /// than `dispatch_ms`, or starts more than `delivery_ms` after the
    /// message's delivery time, emits a warning. 0 disables the respective
    /// check.
    pub fn set_slow_log_thresholds(&self, dispatch_ms: u64, delivery_ms: u64) {
        self.inner
            .slow_dispatch_threshold_ms
            .store(dispatch_ms, Ordering::Relaxed);
        self.inner
            .slow_delivery_threshold_ms
            .store(delivery_ms, Ordering::Relaxed);
    }

    /// Installs (or with `None` removes) the dispatch logging hook.
    pub fn set_message_logging(&self, printer: Option<MessagePrinter>) {
        *self
            .inner
            .printer
            .lock()
            .expect("looper printer mutex poisoned") = printer;
    }

    /// Debug snapshot of this looper and its queue.
    #[must_use]
    pub fn dump(&self) -> String {
        format!(
            "looper on thread '{}'\n{}",
            self.inner.thread_name,
            self.inner.queue.dump()
        )
    }

    pub(crate) fn is_same(&self, other: &Looper) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("thread_name", &self.inner.thread_name)
            .field("thread_id", &self.inner.thread_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;

    // Each #[test] runs on its own thread, so prepare() sees a fresh
    // thread-local slot.
    #[test]
    fn test_prepare_installs_current_looper() {
        assert!(Looper::my_looper().is_none());
        let looper = Looper::prepare(true).unwrap();
        let current = Looper::my_looper().unwrap();
        assert!(looper.is_same(&current));
        assert!(looper.is_current_thread());
        assert!(Looper::my_queue().is_some());
    }

    #[test]
    #[should_panic(expected = "Only one looper may be created per thread")]
    fn test_double_prepare_panics() {
        let _first = Looper::prepare(true).unwrap();
        let _second = Looper::prepare(true);
    }

    #[test]
    #[should_panic(expected = "not allowed to quit")]
    fn test_quit_on_main_style_looper_panics() {
        let looper = Looper::prepare(false).unwrap();
        looper.quit();
    }

    #[test]
    fn test_run_on_wrong_thread_panics() {
        let looper = Looper::prepare(true).unwrap();
        let handle = std::thread::spawn(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| looper.run()));
            assert!(result.is_err());
        });
        handle.join().unwrap();
    }
}
