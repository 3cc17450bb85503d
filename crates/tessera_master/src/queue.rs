//! Operation queue and the control loop that drains it.
//!
//! Two queues feed the loop: a ready channel and a delayed heap ordered by
//! not-before time. Delayed items are only popped once the root region
//! location is known, because everything that waits is catalog-dependent.
//! The loop runs one operation at a time; blocked work is put back, failed
//! work is retried after a filesystem reachability check, and anything
//! fatal drains the master. Failing to put an operation back on the queue
//! is itself fatal: silently losing an operation is never acceptable.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::{MasterError, Result};
use crate::ops::Operation;
use crate::MasterState;

/// Outcome of one `process()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Done,
    /// A catalog or server precondition is not yet satisfied; re-queue.
    Blocked,
}

pub struct QueuedOperation {
    pub op: Operation,
    pub not_before: Option<Instant>,
}

/// Handle for enqueueing work into the control loop.
#[derive(Clone)]
pub struct OpSender {
    tx: mpsc::UnboundedSender<QueuedOperation>,
}

impl OpSender {
    pub fn channel() -> (OpSender, mpsc::UnboundedReceiver<QueuedOperation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OpSender { tx }, rx)
    }

    pub fn enqueue(&self, op: Operation) -> Result<()> {
        self.send(QueuedOperation {
            op,
            not_before: None,
        })
    }

    pub fn enqueue_after(&self, op: Operation, delay: Duration) -> Result<()> {
        self.send(QueuedOperation {
            op,
            not_before: Some(Instant::now() + delay),
        })
    }

    fn send(&self, item: QueuedOperation) -> Result<()> {
        self.tx
            .send(item)
            .map_err(|_| MasterError::MasterNotRunning)
    }
}

struct DelayedEntry {
    due: Instant,
    seq: u64,
    op: Operation,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Time-gated retries, ordered by not-before deadline.
#[derive(Default)]
pub struct DelayedQueue {
    heap: BinaryHeap<DelayedEntry>,
    seq: u64,
}

impl DelayedQueue {
    pub fn push(&mut self, op: Operation, due: Instant) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(DelayedEntry { due, seq, op });
    }

    pub fn pop_due(&mut self, now: Instant) -> Option<Operation> {
        if self.heap.peek()?.due <= now {
            return self.heap.pop().map(|entry| entry.op);
        }
        None
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.due)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

enum Next {
    Op(Operation),
    Idle,
    Stopped,
}

/// Drain the operation queues until shutdown. One dedicated task; every
/// operation executes here and nowhere else.
pub async fn run_control_loop(
    state: Arc<MasterState>,
    mut rx: mpsc::UnboundedReceiver<QueuedOperation>,
) {
    let mut delayed = DelayedQueue::default();

    while !state.closed() {
        if state.shutdown_requested() && state.server_manager.live_server_count() == 0 {
            tracing::info!("shutdown requested and no storage servers remain");
            break;
        }

        let mut op = match next_operation(&state, &mut rx, &mut delayed).await {
            Next::Op(op) => op,
            Next::Idle => continue,
            Next::Stopped => break,
        };
        if state.closed() {
            break;
        }

        let label = op.to_string();
        tracing::debug!(op = %label, "processing operation");
        match op.process(&state).await {
            Ok(OpStatus::Done) => {
                op.finish(Ok(()));
            }
            Ok(OpStatus::Blocked) => {
                // The precondition this operation needs may only be
                // satisfied by work still in the queue; if nothing else is
                // queued, nap before putting it back to avoid a busy spin.
                if rx.is_empty() && delayed.is_empty() {
                    tokio::time::sleep(state.config.wake_interval).await;
                }
                tracing::debug!(op = %label, "operation blocked; requeueing");
                if requeue(&state, op).is_err() {
                    break;
                }
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(op = %label, error = %err, "fatal error in control loop");
                op.finish(Err(err));
                break;
            }
            Err(err) => {
                if !state.check_filesystem() {
                    tracing::error!(
                        op = %label,
                        error = %err,
                        "filesystem unreachable; shutting down"
                    );
                    op.finish(Err(MasterError::Fatal(
                        "filesystem unreachable".to_string(),
                    )));
                    break;
                }
                tracing::warn!(op = %label, error = %err, "operation failed");
                if let Some(op) = op.note_failure(err) {
                    if requeue(&state, op).is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.start_shutdown();
    // Shutdown is a drain, not an abort: whatever was queued is dropped so
    // nothing new starts, and dropped waiters observe the master as closed.
    delayed.clear();
    while rx.try_recv().is_ok() {}
    tracing::info!("control loop exited");
}

fn requeue(state: &MasterState, op: Operation) -> std::result::Result<(), ()> {
    if let Err(err) = state.enqueue_op(op) {
        tracing::error!(error = %err, "failed to requeue operation; stopping control loop");
        return Err(());
    }
    Ok(())
}

async fn next_operation(
    state: &MasterState,
    rx: &mut mpsc::UnboundedReceiver<QueuedOperation>,
    delayed: &mut DelayedQueue,
) -> Next {
    let now = Instant::now();
    // Delayed, catalog-dependent work only runs once the root is known.
    let root_known = state.region_manager.root_location().is_some();
    if root_known {
        if let Some(op) = delayed.pop_due(now) {
            return Next::Op(op);
        }
    }

    let mut wait = state.config.wake_interval;
    if root_known {
        if let Some(due) = delayed.next_due() {
            wait = wait.min(due.saturating_duration_since(now));
        }
    }
    match tokio::time::timeout(wait, rx.recv()).await {
        Ok(Some(item)) => match item.not_before {
            Some(due) if due > Instant::now() => {
                delayed.push(item.op, due);
                Next::Idle
            }
            _ => Next::Op(item.op),
        },
        Ok(None) => Next::Stopped,
        Err(_) => Next::Idle,
    }
}
