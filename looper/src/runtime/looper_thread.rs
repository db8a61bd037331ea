// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Worker thread that owns a message loop.
//!
//! [`LooperThread::spawn`] starts a named thread, prepares a looper on it,
//! hands the looper back through a startup handshake, and runs the loop
//! until the looper quits. This is the building block for short-lived
//! workers that service a serialized command stream: create handlers against
//! [`looper()`], post work from any thread, and the worker executes it
//! strictly one message at a time.
//!
//! ```no_run
//! use r3bl_looper::{LooperThread, task};
//!
//! let worker = LooperThread::spawn("worker").unwrap();
//! let handler = worker.new_handler();
//! handler.post(task(|| println!("runs on the worker thread"))).unwrap();
//! worker.quit_safely_and_join();
//! ```
//!
//! [`looper()`]: LooperThread::looper

use std::{sync::mpsc, thread, thread::JoinHandle};

use crate::runtime::{handler::Handler,
                     looper::Looper,
                     runtime_errors::SpawnError};

/// A thread running a message loop. Dropping the handle quits the loop
/// safely and joins the thread.
#[derive(Debug)]
pub struct LooperThread {
    looper: Looper,
    join_handle: Option<JoinHandle<()>>,
}

impl LooperThread {
    /// Spawns a named thread, prepares a looper on it, and starts its loop.
    ///
    /// Returns once the new thread's looper is ready for handlers.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the thread cannot be spawned or its looper
    /// cannot be prepared.
    pub fn spawn(name: &str) -> Result<LooperThread, SpawnError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let join_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match Looper::prepare(true) {
                Ok(looper) => {
                    if ready_tx.send(Ok(looper.clone())).is_err() {
                        return;
                    }
                    looper.run();
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .map_err(SpawnError::ThreadSpawn)?;

        let looper = ready_rx.recv().map_err(|_| SpawnError::Handshake)??;
        Ok(LooperThread {
            looper,
            join_handle: Some(join_handle),
        })
    }

    /// The looper running on the spawned thread.
    #[must_use]
    pub fn looper(&self) -> &Looper { &self.looper }

    /// A fresh plain handler bound to the spawned thread's looper.
    #[must_use]
    pub fn new_handler(&self) -> Handler { Handler::new(&self.looper) }

    /// Quits the loop once all already-due messages have been delivered,
    /// then joins the thread.
    pub fn quit_safely_and_join(mut self) {
        self.looper.quit_safely();
        self.join();
    }

    /// Quits the loop immediately, discarding pending messages, then joins
    /// the thread.
    pub fn quit_and_join(mut self) {
        self.looper.quit();
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            // The worker may have panicked out of a handler body; joining
            // still reclaims the thread.
            let _ = handle.join();
        }
    }
}

impl Drop for LooperThread {
    fn drop(&mut self) {
        if self.join_handle.is_some() {
            self.looper.quit_safely();
            self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::message::task;
    use std::sync::{Arc,
                    atomic::{AtomicUsize, Ordering}};

    #[test]
    fn test_spawn_runs_posted_work_on_worker_thread() {
        let worker = LooperThread::spawn("looper-thread-test").unwrap();
        let handler = worker.new_handler();

        let (tx, rx) = mpsc::channel();
        handler
            .post(task(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            }))
            .unwrap();

        let observed = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(observed.as_deref(), Some("looper-thread-test"));
        worker.quit_safely_and_join();
    }

    #[test]
    fn test_quit_safely_drains_due_work() {
        let worker = LooperThread::spawn("looper-thread-drain").unwrap();
        let handler = worker.new_handler();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let count = Arc::clone(&count);
            handler
                .post(task(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }
        worker.quit_safely_and_join();
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_drop_joins_the_worker() {
        let worker = LooperThread::spawn("looper-thread-drop").unwrap();
        let handler = worker.new_handler();
        drop(worker);
        // The loop has quit: further posts are rejected.
        assert!(handler.post(task(|| {})).is_err());
    }
}
