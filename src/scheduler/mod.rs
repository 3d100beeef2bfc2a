//! Job scheduling: the dual priority queues and the pairing loop.
//!
//! The loop pops a pending job first; a cancelled job is delivered straight
//! back to the client without consuming a worker. Only when a live job needs
//! dispatching is a worker popped, with shut sessions discarded on the way.

pub mod job;
pub mod queue;

pub use job::{ExecStatus, Execution, Job, JobPriority, ScheduledJob};
pub use queue::{JobQueue, WorkerQueue};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::node::Dispatcher;
use crate::protocol::message::{Message, MessageKind};
use crate::session::SessionId;

/// Long-lived pairing loop. Sleeps on the scheduler notify whenever no
/// (job, worker) pair is available; every queue push wakes it.
pub async fn dispatch_loop(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        if !dispatch_once(&dispatcher).await {
            tokio::select! {
                _ = dispatcher.sched_notify.notified() => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }
}

/// One scheduling iteration under the dispatcher lock. Returns true if it
/// made progress (dispatched or delivered a job).
pub async fn dispatch_once(dispatcher: &Dispatcher) -> bool {
    let mut state = dispatcher.state.lock().await;
    if state.job_pq.is_empty() || state.worker_pq.is_empty() {
        return false;
    }
    let Some(mut scheduled) = state.job_pq.pop() else {
        return false;
    };

    // Cancelled jobs are delivered immediately; no worker is consumed.
    if state.cancelled.remove(&scheduled.job.id) || scheduled.job.status() == ExecStatus::Cancelled
    {
        scheduled.job.latest_exec_mut().status = ExecStatus::Cancelled;
        tracing::info!(job_id = %scheduled.job.id, "Job cancelled before dispatch");
        scheduled.deliver();
        return true;
    }

    // Pop workers until a live one turns up; shut sessions leave the
    // registry here.
    let session = loop {
        let Some(candidate) = state.worker_pq.pop() else {
            break None;
        };
        let shut = match state.workers.get(&candidate) {
            Some(w) => w.shut,
            // Already removed on disconnect; its queue entry is stale.
            None => continue,
        };
        if !shut {
            break Some(candidate);
        }
        state.workers.remove(&candidate);
        tracing::debug!(session = %candidate, "Dropped shut worker");
    };
    let Some(session) = session else {
        // Every queued worker was shut. The job goes back unchanged.
        let priority = scheduled.job.priority;
        state.job_pq.push(scheduled, priority);
        return false;
    };

    send_to_worker(dispatcher, &mut state, session, scheduled);
    true
}

fn send_to_worker(
    dispatcher: &Dispatcher,
    state: &mut crate::node::State,
    session: SessionId,
    mut scheduled: ScheduledJob,
) {
    if !state.workers.contains_key(&session) {
        let priority = scheduled.job.priority;
        state.job_pq.push(scheduled, priority);
        return;
    }
    let Some(worker) = state.workers.get_mut(&session) else {
        return;
    };
    {
        let exec = scheduled.job.latest_exec_mut();
        exec.by = worker.pubkey.clone();
        exec.status = ExecStatus::Running;
    }
    let frame = Message::signed(
        MessageKind::Job,
        scheduled.job.serialize(),
        &dispatcher.keypair,
    )
    .encode();
    let job_id = scheduled.job.id;
    let delivered = worker.handle.send(frame);
    worker.assigned = Some(scheduled);
    if delivered {
        tracing::info!(%session, %job_id, "Dispatched job");
    } else {
        // The connection is gone; the disconnect handler requeues at High.
        tracing::warn!(%session, %job_id, "Job send failed, awaiting disconnect requeue");
    }
}
