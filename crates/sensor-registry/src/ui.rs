//! UI-affinity execution context.
//!
//! Displayed values and enable flags may only change inside a [`UiJob`]. The job
//! receives a [`UiContext`] token which only this module can create, so every write
//! path that touches displayed state has to go through a dispatcher.

use std::sync::mpsc;
use tracing::warn;

/// Proof that the current code runs on the designated UI context.
pub struct UiContext {
    _private: (),
}

pub type UiJob = Box<dyn FnOnce(&UiContext) + Send + 'static>;

pub trait UiDispatcher: Send + Sync {
    fn dispatch(&self, job: UiJob);
}

/// Runs jobs immediately on the calling thread. Used by the CLI and tests where the
/// caller is the only context.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl UiDispatcher for InlineDispatcher {
    fn dispatch(&self, job: UiJob) {
        job(&UiContext { _private: () });
    }
}

/// Queues jobs for a UI loop that drains them via [`UiQueue::run_pending`].
pub struct QueuedDispatcher {
    tx: mpsc::Sender<UiJob>,
}

impl UiDispatcher for QueuedDispatcher {
    fn dispatch(&self, job: UiJob) {
        if self.tx.send(job).is_err() {
            warn!("ui queue closed, dropping job");
        }
    }
}

pub struct UiQueue {
    rx: mpsc::Receiver<UiJob>,
}

impl UiQueue {
    /// Run every job queued so far; returns how many ran.
    pub fn run_pending(&self) -> usize {
        let ctx = UiContext { _private: () };
        let mut n = 0;
        while let Ok(job) = self.rx.try_recv() {
            job(&ctx);
            n += 1;
        }
        n
    }

    /// Block until the next job arrives and run it. Returns false once all
    /// dispatchers are gone.
    pub fn run_next(&self) -> bool {
        match self.rx.recv() {
            Ok(job) => {
                job(&UiContext { _private: () });
                true
            }
            Err(_) => false,
        }
    }
}

pub fn ui_queue() -> (QueuedDispatcher, UiQueue) {
    let (tx, rx) = mpsc::channel();
    (QueuedDispatcher { tx }, UiQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn queued_jobs_wait_for_the_ui_loop() {
        let (dispatcher, queue) = ui_queue();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            dispatcher.dispatch(Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_pending(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        drop(dispatcher);
        assert!(!queue.run_next());
    }

    #[test]
    fn inline_runs_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        InlineDispatcher.dispatch(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
