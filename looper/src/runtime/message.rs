// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Poolable, timestamped work item delivered by a [`MessageQueue`].
//!
//! A [`Message`] is a value record owned by exactly one of: the global pool,
//! the caller that obtained it, the queue it is enqueued on, or the in-flight
//! dispatch path. The `IN_USE` flag enforces that single-owner discipline at
//! runtime: it is set on enqueue and cleared only when the record returns to
//! the pool. Pool and queue both thread records through the intrusive `next`
//! link, so no allocation happens on any ownership transition.
//!
//! [`MessageQueue`]: crate::runtime::message_queue::MessageQueue

use std::{any::Any, fmt, sync::Arc};

use bitflags::bitflags;

use crate::runtime::{handler::Handler, message_pool, runtime_errors::SendError};

/// A callback payload. `Arc` so the same task can be posted repeatedly and
/// matched by identity in `remove` / `has` queries.
pub type Task = Arc<dyn Fn() + Send + Sync + 'static>;

/// The opaque object slot. Matched by pointer identity, never by value.
pub type Obj = Arc<dyn Any + Send + Sync + 'static>;

/// Convenience for wrapping a closure as a [`Task`].
pub fn task(f: impl Fn() + Send + Sync + 'static) -> Task { Arc::new(f) }

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u8 {
        /// Set on enqueue, cleared when the record returns to the pool.
        const IN_USE = 1 << 0;
        /// Bypasses sync barriers during extraction.
        const ASYNCHRONOUS = 1 << 1;
    }
}

/// What a message carries: either a code routed to the target handler's
/// [`HandleMessage`] hook, or an inline callback that runs instead of it.
///
/// [`HandleMessage`]: crate::runtime::handler::HandleMessage
#[derive(Clone)]
pub enum MessagePayload {
    /// User code plus two integer slots, interpreted by the target handler.
    Code { what: i32, arg1: i64, arg2: i64 },
    /// Inline callback; dispatch invokes it and never consults the handler.
    Callback(Task),
}

impl MessagePayload {
    pub(crate) fn blank() -> Self {
        MessagePayload::Code {
            what: 0,
            arg1: 0,
            arg2: 0,
        }
    }
}

impl fmt::Debug for MessagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagePayload::Code { what, arg1, arg2 } => {
                write!(f, "what={what} arg1={arg1} arg2={arg2}")
            }
            MessagePayload::Callback(_) => write!(f, "callback"),
        }
    }
}

/// A timestamped work item bound for a [`Handler`].
///
/// Obtain records through [`Message::obtain`] and its variants rather than
/// constructing them directly - the process-global pool recycles records to
/// avoid allocation churn on hot dispatch paths.
///
/// [`Handler`]: crate::runtime::handler::Handler
pub struct Message {
    /// Code-plus-args or inline callback. See [`MessagePayload`].
    pub payload: MessagePayload,
    /// Opaque object slot, matched by pointer identity in queries.
    pub obj: Option<Obj>,
    /// Optional back-pointer to a handler that replies should go to.
    pub reply_to: Option<Handler>,
    /// Delivery time in monotonic milliseconds ([`uptime_millis`]).
    ///
    /// [`uptime_millis`]: crate::common::clock::uptime_millis
    pub(crate) when: u64,
    pub(crate) flags: MessageFlags,
    /// `None` marks a sync barrier.
    pub(crate) target: Option<Handler>,
    /// Intrusive link used by both the pool free list and the queue.
    pub(crate) next: Option<Box<Message>>,
}

impl Message {
    pub(crate) fn new_blank() -> Self {
        Message {
            payload: MessagePayload::blank(),
            obj: None,
            reply_to: None,
            when: 0,
            flags: MessageFlags::empty(),
            target: None,
            next: None,
        }
    }

    /// Returns a zero-initialized record from the global pool, allocating a
    /// fresh one if the pool is empty.
    #[must_use]
    pub fn obtain() -> Box<Message> { message_pool::obtain() }

    /// Returns a pooled record carrying just a user code.
    #[must_use]
    pub fn obtain_code(what: i32) -> Box<Message> { Self::obtain_with(what, 0, 0) }

    /// Returns a pooled record carrying a user code and both integer slots.
    #[must_use]
    pub fn obtain_with(what: i32, arg1: i64, arg2: i64) -> Box<Message> {
        let mut msg = message_pool::obtain();
        msg.payload = MessagePayload::Code { what, arg1, arg2 };
        msg
    }

    /// Returns a pooled record carrying an inline callback.
    #[must_use]
    pub fn obtain_callback(callback: Task) -> Box<Message> {
        let mut msg = message_pool::obtain();
        msg.payload = MessagePayload::Callback(callback);
        msg
    }

    /// Returns this record to the global pool.
    ///
    /// # Panics
    ///
    /// Panics if the message is in use (enqueued or mid-dispatch). Only the
    /// internal post-dispatch path may recycle an in-use record.
    pub fn recycle(self: Box<Self>) {
        assert!(
            !self.is_in_use(),
            "Message may not be recycled while it is enqueued or being dispatched"
        );
        message_pool::recycle(self);
    }

    /// Post-dispatch recycling path: clears `IN_USE` and returns the record
    /// to the pool.
    pub(crate) fn recycle_unchecked(mut msg: Box<Message>) {
        msg.flags.remove(MessageFlags::IN_USE);
        message_pool::recycle(msg);
    }

    /// Enqueues this message on the queue of the handler stamped by a prior
    /// `send*` / `post*` call, for immediate delivery.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Quitting`] if the target queue has quit.
    ///
    /// # Panics
    ///
    /// Panics if no target handler is set.
    pub fn send_to_target(mut self: Box<Self>) -> Result<(), SendError> {
        let Some(handler) = self.target.take() else {
            panic!("Message has no target handler; use Handler::send() instead")
        };
        handler.send(self)
    }

    /// The user code, when the payload is message-form. `None` for callback
    /// payloads.
    #[must_use]
    pub fn what(&self) -> Option<i32> {
        match self.payload {
            MessagePayload::Code { what, .. } => Some(what),
            MessagePayload::Callback(_) => None,
        }
    }

    /// Delivery time in monotonic milliseconds.
    #[must_use]
    pub fn when(&self) -> u64 { self.when }

    /// True once enqueued, until the record returns to the pool.
    #[must_use]
    pub fn is_in_use(&self) -> bool { self.flags.contains(MessageFlags::IN_USE) }

    /// True if this message bypasses sync barriers.
    #[must_use]
    pub fn is_asynchronous(&self) -> bool { self.flags.contains(MessageFlags::ASYNCHRONOUS) }

    /// Marks this message as barrier-bypassing. Must be called before the
    /// message is enqueued.
    pub fn set_asynchronous(&mut self, asynchronous: bool) {
        self.flags.set(MessageFlags::ASYNCHRONOUS, asynchronous);
    }

    /// The handler this message is bound for. `None` for barriers.
    #[must_use]
    pub fn target(&self) -> Option<&Handler> { self.target.as_ref() }

    pub(crate) fn mark_in_use(&mut self) { self.flags.insert(MessageFlags::IN_USE); }

    /// A sync barrier is a sentinel entry with no target.
    pub(crate) fn is_barrier(&self) -> bool { self.target.is_none() }

    /// Barrier token, carried in `arg1` of a targetless record.
    pub(crate) fn barrier_token(&self) -> Option<i64> {
        match self.payload {
            MessagePayload::Code { arg1, .. } if self.is_barrier() => Some(arg1),
            _ => None,
        }
    }

    /// Resets every field before the record re-enters the pool free list.
    pub(crate) fn clear_for_pool(&mut self) {
        self.payload = MessagePayload::blank();
        self.obj = None;
        self.reply_to = None;
        self.when = 0;
        self.flags = MessageFlags::empty();
        self.target = None;
        self.next = None;
    }

    /// One-line rendering for queue dumps, with `when` relative to `now`.
    pub(crate) fn describe(&self, now: u64) -> String {
        let relative = if self.when >= now {
            format!("+{} ms", self.when - now)
        } else {
            format!("-{} ms", now - self.when)
        };
        match (&self.target, self.barrier_token()) {
            (None, Some(token)) => format!("{{ when={relative} barrier token={token} }}"),
            (Some(target), _) => format!(
                "{{ when={relative} target={} {:?} obj={} }}",
                target.name(),
                self.payload,
                self.obj.is_some()
            ),
            (None, None) => format!("{{ when={relative} <detached> }}"),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload", &self.payload)
            .field("when", &self.when)
            .field("flags", &self.flags)
            .field("target", &self.target.as_ref().map(Handler::name))
            .field("obj", &self.obj.is_some())
            .finish_non_exhaustive()
    }
}
