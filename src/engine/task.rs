//! Background tasks for long-running operations.
//!
//! KDF work and token round-trips block for human-scale durations (a
//! touch can take seconds), so vault creation and password changes are
//! also offered as worker-thread tasks. Progress events flow back over a
//! channel; cancellation is cooperative and only takes effect at the
//! checkpoints between KDF and token steps, never mid-primitive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub step: u32,
    pub total: u32,
    pub label: String,
}

/// Outcome of a background task.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(Result<T>),
    Cancelled,
}

pub struct TaskHandle<T> {
    progress: Receiver<ProgressEvent>,
    cancel: Arc<AtomicBool>,
    join: JoinHandle<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    /// Request cooperative cancellation. Takes effect at the worker's
    /// next checkpoint.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Progress events, in order. The channel closes when the worker
    /// finishes.
    pub fn progress(&self) -> &Receiver<ProgressEvent> {
        &self.progress
    }

    /// Wait for the worker and collect its outcome.
    pub fn join(self) -> TaskOutcome<T> {
        match self.join.join() {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::Completed(Err(crate::error::VaultError::Busy)),
        }
    }
}

/// Worker-side context: progress reporting plus cancellation checkpoints.
pub struct TaskContext {
    tx: Sender<ProgressEvent>,
    cancel: Arc<AtomicBool>,
    total: u32,
}

/// Signal that the worker observed a cancellation request.
pub struct CancelledMarker;

impl TaskContext {
    pub fn report(&self, step: u32, label: &str) {
        let _ = self.tx.send(ProgressEvent {
            step,
            total: self.total,
            label: label.to_string(),
        });
    }

    /// Cancellation checkpoint. Call between KDF and token round trips.
    pub fn checkpoint(&self) -> std::result::Result<(), CancelledMarker> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(CancelledMarker)
        } else {
            Ok(())
        }
    }
}

/// Spawn a worker thread running `work` with a progress channel of
/// `total` steps.
pub fn spawn<T, F>(total: u32, work: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&TaskContext) -> std::result::Result<Result<T>, CancelledMarker> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::unbounded();
    let cancel = Arc::new(AtomicBool::new(false));
    let ctx = TaskContext {
        tx,
        cancel: cancel.clone(),
        total,
    };
    let join = std::thread::spawn(move || match work(&ctx) {
        Ok(result) => TaskOutcome::Completed(result),
        Err(CancelledMarker) => TaskOutcome::Cancelled,
    });
    TaskHandle {
        progress: rx,
        cancel,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_events_arrive_in_order() {
        let handle = spawn(3, |ctx| {
            ctx.report(1, "first");
            ctx.report(2, "second");
            ctx.report(3, "third");
            Ok(Ok(42u32))
        });

        match handle.join() {
            TaskOutcome::Completed(Ok(v)) => assert_eq!(v, 42),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn cancellation_lands_at_checkpoint() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = spawn(2, move |ctx| {
            ctx.report(1, "working");
            // Wait for the test to request cancellation.
            let _ = gate_rx.recv();
            ctx.checkpoint()?;
            Ok(Ok(()))
        });

        handle.cancel();
        gate_tx.send(()).unwrap();
        assert!(matches!(handle.join(), TaskOutcome::Cancelled));
    }

    #[test]
    fn progress_channel_closes_on_completion() {
        let handle = spawn(1, |ctx| {
            ctx.report(1, "only step");
            Ok(Ok(()))
        });
        let events: Vec<_> = handle.progress().iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label, "only step");
        assert!(matches!(handle.join(), TaskOutcome::Completed(Ok(()))));
    }
}
