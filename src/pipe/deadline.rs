//! Resettable I/O deadline
//!
//! The pipe needs the semantics of a socket deadline: a single instant
//! that applies to whatever operation is currently blocked, and that can
//! be moved (or set to the past) while an operation is in flight. A
//! `watch` channel provides exactly that: the blocked side re-arms its
//! timer whenever the deadline changes.

use std::future::Future;
use std::io;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Shared handle that sets the deadline.
pub(crate) struct Deadline {
    tx: watch::Sender<Option<Instant>>,
}

impl Deadline {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Move the deadline. `None` disarms it; an instant in the past fires
    /// any blocked operation immediately.
    pub(crate) fn set(&self, at: Option<Instant>) {
        self.tx.send_replace(at);
    }

    pub(crate) fn watch(&self) -> DeadlineWatch {
        DeadlineWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Per-task view of a [`Deadline`], used to bound individual I/O ops.
pub(crate) struct DeadlineWatch {
    rx: watch::Receiver<Option<Instant>>,
}

impl DeadlineWatch {
    /// Resolves once the deadline expires. Pends while the deadline is
    /// unarmed, tracking every change made through the sender.
    async fn expired(&mut self) {
        loop {
            let at = *self.rx.borrow_and_update();
            match at {
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => return,
                        changed = self.rx.changed() => {
                            if changed.is_err() {
                                // sender gone: the last deadline stands
                                sleep_until(at).await;
                                return;
                            }
                        }
                    }
                }
                None => {
                    if self.rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    /// Run an I/O operation, failing with `TimedOut` if the deadline
    /// expires first.
    pub(crate) async fn guard<T, F>(&mut self, op: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        tokio::pin!(op);
        tokio::select! {
            res = &mut op => res,
            _ = self.expired() => Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")),
        }
    }
}
