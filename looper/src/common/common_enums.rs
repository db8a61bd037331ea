// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

/// Whether a repeatedly-invoked callback should remain registered.
///
/// Returned by [`IdleHandler::on_idle`] to decide whether the handler stays
/// on the queue's idle list for the next idle transition.
///
/// [`IdleHandler::on_idle`]: crate::runtime::message_queue::IdleHandler::on_idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Continuation {
    #[default]
    Continue,
    Stop,
}
