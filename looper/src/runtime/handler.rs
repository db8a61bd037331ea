// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Thread-affine endpoint that enqueues work into a bound [`MessageQueue`]
//! and receives it back on the owning thread.
//!
//! A handler binds to one looper at construction and never rebinds. Every
//! `post*` / `send*` / `remove*` / `has*` operation is non-blocking and safe
//! from any thread; the dispatch side ([`dispatch`]) only ever runs on the
//! looper's thread, one message at a time.
//!
//! Dispatch precedence for an incoming message:
//!
//! 1. An inline [`MessagePayload::Callback`] runs and nothing else is
//!    consulted.
//! 2. Otherwise an installed [interceptor] may claim the message.
//! 3. Otherwise the [`HandleMessage`] hook (if any) receives it.
//!
//! [`MessagePayload::Callback`]: crate::runtime::message::MessagePayload::Callback
//! [`dispatch`]: Handler::dispatch
//! [interceptor]: HandlerBuilder::interceptor

use std::{fmt,
          sync::{Arc, Condvar, Mutex,
                 atomic::{AtomicU64, Ordering}},
          time::{Duration, Instant}};

use crate::runtime::{looper::Looper,
                     message::{Message, MessagePayload, Obj, Task},
                     message_queue::MessageQueue,
                     runtime_errors::{RunSyncError, SendError}};

use crate::common::clock::uptime_millis;

/// Receives message-form payloads that no interceptor claimed.
pub trait HandleMessage: Send + Sync {
    fn handle_message(&self, msg: &mut Message);
}

/// Whether an interceptor consumed a message or passed it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterceptResult {
    #[default]
    NotHandled,
    Handled,
}

/// Hook that sees every message-form payload before the [`HandleMessage`]
/// hook does.
pub type MessageInterceptor = Arc<dyn Fn(&mut Message) -> InterceptResult + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

struct HandlerInner {
    looper: Looper,
    name: String,
    handle: Option<Arc<dyn HandleMessage>>,
    interceptor: Option<MessageInterceptor>,
    /// When set, every outgoing message is stamped asynchronous so it
    /// bypasses sync barriers.
    asynchronous: bool,
}

/// Endpoint for posting work to a looper thread. Clone freely; clones share
/// identity for `remove` / `has` matching.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerInner>,
}

impl Handler {
    /// A plain handler bound to `looper`, with no message hook.
    #[must_use]
    pub fn new(looper: &Looper) -> Handler { Self::builder(looper).build() }

    /// A handler bound to the calling thread's looper.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has not called [`Looper::prepare`].
    #[must_use]
    pub fn current() -> Handler {
        let looper = Looper::my_looper().expect(
            "Can't create a handler on a thread that has not called Looper::prepare()",
        );
        Self::new(&looper)
    }

    /// Starts building a handler with a name, message hook, interceptor, or
    /// the asynchronous flag.
    #[must_use]
    pub fn builder(looper: &Looper) -> HandlerBuilder {
        HandlerBuilder {
            looper: looper.clone(),
            name: None,
            handle: None,
            interceptor: None,
            asynchronous: false,
        }
    }

    /// The looper this handler is bound to.
    #[must_use]
    pub fn looper(&self) -> &Looper { &self.inner.looper }

    /// The queue this handler enqueues into.
    #[must_use]
    pub fn queue(&self) -> &Arc<MessageQueue> { self.inner.looper.queue() }

    /// Diagnostic name, used in dumps and dispatch logging.
    #[must_use]
    pub fn name(&self) -> &str { &self.inner.name }

    /// True when both handles refer to the same handler.
    #[must_use]
    pub fn is_same(&self, other: &Handler) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    // ── Posting callbacks ──────────────────────────────────────────────────

    /// Enqueues `callback` for delivery now.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the queue has quit.
    pub fn post(&self, callback: Task) -> Result<(), SendError> {
        self.post_delayed(callback, Duration::ZERO)
    }

    /// Enqueues `callback` for delivery `delay` from now.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the queue has quit.
    pub fn post_delayed(&self, callback: Task, delay: Duration) -> Result<(), SendError> {
        self.post_at_time(callback, delayed_uptime(delay))
    }

    /// Enqueues `callback` for delivery at an absolute uptime, in the
    /// monotonic milliseconds of [`uptime_millis`].
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the queue has quit.
    pub fn post_at_time(&self, callback: Task, uptime_ms: u64) -> Result<(), SendError> {
        self.enqueue(Message::obtain_callback(callback), uptime_ms)
    }

    /// Enqueues `callback` ahead of every time-scheduled message, for
    /// critical interrupts only. Front posts are delivered in the order they
    /// were posted, but deliberately break FIFO with everything else.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the queue has quit.
    pub fn post_at_front(&self, callback: Task) -> Result<(), SendError> {
        self.enqueue(Message::obtain_callback(callback), 0)
    }

    // ── Sending messages ───────────────────────────────────────────────────

    /// Stamps `msg` with this handler as target and enqueues it for delivery
    /// now.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the queue has quit.
    pub fn send(&self, msg: Box<Message>) -> Result<(), SendError> {
        self.send_delayed(msg, Duration::ZERO)
    }

    /// Like [`send`](Self::send), delayed by `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the queue has quit.
    pub fn send_delayed(&self, msg: Box<Message>, delay: Duration) -> Result<(), SendError> {
        self.send_at_time(msg, delayed_uptime(delay))
    }

    /// Like [`send`](Self::send), at an absolute uptime in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the queue has quit.
    pub fn send_at_time(&self, msg: Box<Message>, uptime_ms: u64) -> Result<(), SendError> {
        self.enqueue(msg, uptime_ms)
    }

    /// Like [`post_at_front`](Self::post_at_front), for message-form work.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the queue has quit.
    pub fn send_at_front(&self, msg: Box<Message>) -> Result<(), SendError> {
        self.enqueue(msg, 0)
    }

    /// Sends a bare user code.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the queue has quit.
    pub fn send_empty(&self, what: i32) -> Result<(), SendError> {
        self.send(Message::obtain_code(what))
    }

    fn enqueue(&self, mut msg: Box<Message>, when: u64) -> Result<(), SendError> {
        msg.target = Some(self.clone());
        if self.inner.asynchronous {
            msg.set_asynchronous(true);
        }
        self.queue().enqueue_message(msg, when)
    }

    // ── Removal and query ──────────────────────────────────────────────────

    /// Removes every pending message-form entry with code `what` (matching
    /// `obj` identity when given).
    pub fn remove_messages(&self, what: i32, obj: Option<&Obj>) {
        self.queue().remove_messages(self, what, obj);
    }

    /// Removes every pending post of exactly this `callback` (matching
    /// `obj` identity when given).
    pub fn remove_callbacks(&self, callback: &Task, obj: Option<&Obj>) {
        self.queue().remove_callbacks(self, callback, obj);
    }

    /// Removes everything pending for this handler (matching `obj` identity
    /// when given).
    pub fn remove_callbacks_and_messages(&self, obj: Option<&Obj>) {
        self.queue().remove_all_for(self, obj);
    }

    /// True if a message-form entry with code `what` is pending.
    #[must_use]
    pub fn has_messages(&self, what: i32, obj: Option<&Obj>) -> bool {
        self.queue().has_messages(self, what, obj)
    }

    /// True if a post of exactly this `callback` is pending.
    #[must_use]
    pub fn has_callbacks(&self, callback: &Task) -> bool {
        self.queue().has_callbacks(self, callback)
    }

    // ── Dispatch ───────────────────────────────────────────────────────────

    /// Delivers one message on the looper thread. Called by
    /// [`Looper::run`] only.
    ///
    /// [`Looper::run`]: crate::runtime::looper::Looper::run
    pub(crate) fn dispatch(&self, msg: &mut Message) {
        if let MessagePayload::Callback(callback) = &msg.payload {
            let callback = callback.clone();
            callback();
            return;
        }
        if let Some(interceptor) = &self.inner.interceptor {
            if interceptor(msg) == InterceptResult::Handled {
                return;
            }
        }
        if let Some(handle) = &self.inner.handle {
            handle.handle_message(msg);
        }
    }

    // ── Synchronous execution ──────────────────────────────────────────────

    /// Runs `callback` on the looper thread and blocks the caller until it
    /// completes or `timeout` elapses. When already on the looper thread the
    /// callback runs inline.
    ///
    /// This primitive is deadlock-prone by construction: if the looper
    /// thread is itself blocked on the calling thread (directly or through
    /// any lock), neither side can make progress. Prefer posting a message
    /// and replying through a second handler; reserve this for bootstrap
    /// sequencing.
    ///
    /// # Errors
    ///
    /// [`RunSyncError::Timeout`] if the deadline elapsed - the posted work
    /// *remains queued* and may still run later. [`RunSyncError::Send`] if
    /// the queue has quit.
    pub fn run_synchronously(&self, callback: Task, timeout: Duration) -> Result<(), RunSyncError> {
        if self.inner.looper.is_current_thread() {
            callback();
            return Ok(());
        }

        let done: Arc<DoneSignal> = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&done);
        self.post(Arc::new(move || {
            callback();
            signal_completion(&signal);
        }))?;

        if await_completion(&done, timeout) {
            Ok(())
        } else {
            Err(RunSyncError::Timeout)
        }
    }
}

type DoneSignal = (Mutex<bool>, Condvar);

fn signal_completion(done: &DoneSignal) {
    let (flag, condvar) = done;
    *flag.lock().expect("run_synchronously mutex poisoned") = true;
    condvar.notify_all();
}

fn await_completion(done: &DoneSignal, timeout: Duration) -> bool {
    let (flag, condvar) = done;
    let deadline = Instant::now() + timeout;
    let mut completed = flag.lock().expect("run_synchronously mutex poisoned");
    while !*completed {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        completed = condvar
            .wait_timeout(completed, remaining)
            .expect("run_synchronously mutex poisoned")
            .0;
    }
    true
}

fn delayed_uptime(delay: Duration) -> u64 {
    uptime_millis().saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.inner.name)
            .field("asynchronous", &self.inner.asynchronous)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Handler`]. See [`Handler::builder`].
pub struct HandlerBuilder {
    looper: Looper,
    name: Option<String>,
    handle: Option<Arc<dyn HandleMessage>>,
    interceptor: Option<MessageInterceptor>,
    asynchronous: bool,
}

impl HandlerBuilder {
    /// Diagnostic name used in dumps and dispatch logging.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Installs the [`HandleMessage`] hook for message-form payloads.
    #[must_use]
    pub fn handle_message(mut self, handle: Arc<dyn HandleMessage>) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Installs an interceptor consulted before the [`HandleMessage`] hook.
    #[must_use]
    pub fn interceptor(mut self, interceptor: MessageInterceptor) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Stamps every outgoing message asynchronous, so this handler's work
    /// bypasses sync barriers.
    #[must_use]
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    /// Builds the handler.
    #[must_use]
    pub fn build(self) -> Handler {
        let name = self.name.unwrap_or_else(|| {
            format!("handler-{}", NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
        });
        Handler {
            inner: Arc::new(HandlerInner {
                looper: self.looper,
                name,
                handle: self.handle,
                interceptor: self.interceptor,
                asynchronous: self.asynchronous,
            }),
        }
    }
}

impl fmt::Debug for HandlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBuilder")
            .field("name", &self.name)
            .field("asynchronous", &self.asynchronous)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::message::{MessagePayload, task};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_current_requires_prepared_looper() {
        // This test thread never calls Looper::prepare().
        let result = std::panic::catch_unwind(Handler::current);
        assert!(result.is_err());
    }

    #[test]
    fn test_async_handler_stamps_messages() {
        let looper = Looper::prepare(true).unwrap();
        let handler = Handler::builder(&looper).asynchronous(true).build();
        handler.send_empty(5).unwrap();
        assert!(handler.has_messages(5, None));

        // Inspect the queued message directly.
        let msg = looper.queue().next().unwrap();
        assert!(msg.is_asynchronous());
        assert_eq!(msg.what(), Some(5));
        Message::recycle_unchecked(msg);
    }

    #[test]
    fn test_dispatch_precedence_callback_first() {
        let looper = Looper::prepare(true).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        struct CountingHook(Arc<AtomicUsize>);
        impl HandleMessage for CountingHook {
            fn handle_message(&self, _msg: &mut Message) {
                self.0.fetch_add(100, Ordering::Relaxed);
            }
        }

        let handler = Handler::builder(&looper)
            .handle_message(Arc::new(CountingHook(Arc::clone(&hits))))
            .build();

        // A callback payload short-circuits the hook.
        let cb_hits = Arc::clone(&hits);
        let mut msg = Message::obtain_callback(task(move || {
            cb_hits.fetch_add(1, Ordering::Relaxed);
        }));
        handler.dispatch(&mut msg);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        msg.recycle();

        // A message-form payload reaches the hook.
        let mut msg = Message::obtain_code(7);
        handler.dispatch(&mut msg);
        assert_eq!(hits.load(Ordering::Relaxed), 101);
        msg.recycle();
    }

    #[test]
    fn test_interceptor_can_claim_messages() {
        let looper = Looper::prepare(true).unwrap();
        let hook_hits = Arc::new(AtomicUsize::new(0));

        struct CountingHook(Arc<AtomicUsize>);
        impl HandleMessage for CountingHook {
            fn handle_message(&self, _msg: &mut Message) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let handler = Handler::builder(&looper)
            .handle_message(Arc::new(CountingHook(Arc::clone(&hook_hits))))
            .interceptor(Arc::new(|msg: &mut Message| {
                if msg.what() == Some(1) {
                    InterceptResult::Handled
                } else {
                    InterceptResult::NotHandled
                }
            }))
            .build();

        let mut claimed = Message::obtain_code(1);
        handler.dispatch(&mut claimed);
        claimed.recycle();
        assert_eq!(hook_hits.load(Ordering::Relaxed), 0);

        let mut passed = Message::obtain_code(2);
        handler.dispatch(&mut passed);
        passed.recycle();
        assert_eq!(hook_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_remove_callbacks_by_identity() {
        let looper = Looper::prepare(true).unwrap();
        let handler = Handler::new(&looper);

        let kept: Task = task(|| {});
        let removed: Task = task(|| {});
        handler.post_delayed(kept.clone(), Duration::from_secs(60)).unwrap();
        handler.post_delayed(removed.clone(), Duration::from_secs(60)).unwrap();

        assert!(handler.has_callbacks(&kept));
        assert!(handler.has_callbacks(&removed));

        handler.remove_callbacks(&removed, None);
        assert!(handler.has_callbacks(&kept));
        assert!(!handler.has_callbacks(&removed));

        handler.remove_callbacks_and_messages(None);
        assert!(!handler.has_callbacks(&kept));
    }

    #[test]
    fn test_payload_visible_to_hook() {
        let looper = Looper::prepare(true).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct Recorder(Arc<Mutex<Vec<(i32, i64, i64)>>>);
        impl HandleMessage for Recorder {
            fn handle_message(&self, msg: &mut Message) {
                if let MessagePayload::Code { what, arg1, arg2 } = msg.payload {
                    self.0.lock().unwrap().push((what, arg1, arg2));
                }
            }
        }

        let handler = Handler::builder(&looper)
            .handle_message(Arc::new(Recorder(Arc::clone(&seen))))
            .build();
        let mut msg = Message::obtain_with(3, 10, 20);
        handler.dispatch(&mut msg);
        msg.recycle();
        assert_eq!(seen.lock().unwrap().as_slice(), &[(3, 10, 20)]);
    }
}
