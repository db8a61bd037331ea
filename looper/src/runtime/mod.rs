// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// Attach sources.
pub mod handler;
pub mod looper;
pub mod looper_thread;
pub mod message;
pub mod message_pool;
pub mod message_queue;
pub mod runtime_errors;
pub mod waiter;

// Re-export.
pub use handler::*;
pub use looper::*;
pub use looper_thread::*;
pub use message::*;
pub use message_pool::*;
pub use message_queue::*;
pub use runtime_errors::*;
pub use waiter::*;
