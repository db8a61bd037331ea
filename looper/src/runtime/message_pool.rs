// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Process-global bounded free list of [`Message`] records.
//!
//! The pool keeps up to [`MAX_POOL_SIZE`] cleared records chained through
//! their intrusive `next` links. [`obtain`] pops from the free list and only
//! allocates when it is empty; [`recycle`] clears every field and pushes the
//! record back, dropping it instead when the pool is full. The pool has its
//! own mutex, separate from any queue lock, and is always the innermost lock
//! taken.

use std::sync::Mutex;

use crate::runtime::message::Message;

/// Upper bound on pooled records. Excess recycles fall through to the
/// allocator.
pub const MAX_POOL_SIZE: usize = 50;

struct PoolState {
    free: Option<Box<Message>>,
    len: usize,
}

static POOL: Mutex<PoolState> = Mutex::new(PoolState { free: None, len: 0 });

/// Pops a cleared record from the free list, or allocates a fresh one.
pub(crate) fn obtain() -> Box<Message> {
    {
        let mut pool = POOL.lock().expect("message pool mutex poisoned");
        if let Some(mut msg) = pool.free.take() {
            pool.free = msg.next.take();
            pool.len -= 1;
            return msg;
        }
    }
    Box::new(Message::new_blank())
}

/// Clears every field, then pushes the record onto the free list if there is
/// room. Callers are responsible for the in-use check; see
/// [`Message::recycle`].
pub(crate) fn recycle(mut msg: Box<Message>) {
    msg.clear_for_pool();
    let mut pool = POOL.lock().expect("message pool mutex poisoned");
    if pool.len < MAX_POOL_SIZE {
        msg.next = pool.free.take();
        pool.free = Some(msg);
        pool.len += 1;
    }
}
