//! Worker-facing protocol.
//!
//! Session lifecycle: connect → HELLO (handshake, capacity check) → idle/busy
//! cycles of JOB and RESULT → SHUT or disconnect. A worker that disconnects
//! mid-job costs the job exactly one retry at High priority.

use crate::error::{DispatchError, Result};
use crate::node::{Dispatcher, WorkerInfo};
use crate::protocol::message::{Message, MessageKind};
use crate::scheduler::job::{Execution, JobPriority};
use crate::session::{SessionHandle, SessionId};

impl Dispatcher {
    /// Handle one frame from the worker websocket. An error return means
    /// the connection must be closed.
    pub async fn handle_worker_frame(
        &self,
        session: SessionId,
        handle: &SessionHandle,
        frame: &[u8],
    ) -> Result<()> {
        let msg = match Message::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%session, error = %e, "Malformed worker frame");
                handle.send(Message::unsigned(MessageKind::Invalid, Vec::new()).encode());
                return Ok(());
            }
        };
        match msg.kind {
            MessageKind::Hello => self.worker_hello(session, handle, msg).await,
            MessageKind::Result => {
                self.worker_result(session, msg).await;
                Ok(())
            }
            MessageKind::Shut => {
                self.worker_shut(session).await;
                Ok(())
            }
            other => {
                tracing::debug!(%session, kind = %other, "Unexpected worker message");
                handle.send(Message::unsigned(MessageKind::Invalid, Vec::new()).encode());
                Ok(())
            }
        }
    }

    async fn worker_hello(
        &self,
        session: SessionId,
        handle: &SessionHandle,
        msg: Message,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.workers.contains_key(&session) {
            handle.send(Message::unsigned(MessageKind::Invalid, Vec::new()).encode());
            return Ok(());
        }
        if state.workers.len() >= self.config.max_workers {
            tracing::warn!(%session, "Worker rejected, capacity reached");
            handle.send(Message::unsigned(MessageKind::ConnFull, Vec::new()).encode());
            return Err(DispatchError::CapacityExceeded);
        }
        let worker_pub = hex::encode(&msg.payload);
        state.workers.insert(
            session,
            WorkerInfo {
                pubkey: msg.payload,
                assigned: None,
                shut: false,
                handle: handle.clone(),
            },
        );
        state.worker_pq.push(session, 0);
        handle.send(
            Message::unsigned(MessageKind::Hello, self.keypair.public_bytes()).encode(),
        );
        drop(state);

        tracing::info!(%session, worker_pub = %worker_pub, "Worker connected");
        let directory = self.directory.clone();
        tokio::spawn(async move {
            if let Err(e) = directory.connect_worker().await {
                tracing::warn!(error = %e, "Directory connect_worker failed");
            }
        });
        self.sched_notify.notify_one();
        Ok(())
    }

    async fn worker_result(&self, session: SessionId, msg: Message) {
        let mut state = self.state.lock().await;
        let Some(worker) = state.workers.get_mut(&session) else {
            tracing::debug!(%session, "Result from unknown worker");
            return;
        };
        let Some(mut scheduled) = worker.assigned.take() else {
            tracing::debug!(%session, "Result from idle worker");
            return;
        };
        let worker_pub = worker.pubkey.clone();
        let shut = worker.shut;

        let exec: Option<Execution> = if msg.verify(&worker_pub) {
            match serde_json::from_slice(&msg.payload) {
                Ok(exec) => Some(exec),
                Err(e) => {
                    tracing::warn!(%session, error = %e, "Undecodable execution payload");
                    None
                }
            }
        } else {
            tracing::warn!(%session, "Result signature check failed");
            None
        };

        match exec {
            Some(exec) => {
                tracing::info!(%session, job_id = %scheduled.job.id, "Received result");
                scheduled.job.set_exec(exec);
                let completed = scheduled.job.clone();
                scheduled.deliver();
                self.commit_add(&mut state, completed);
            }
            None => {
                // One retry on another worker, at the front of the queue.
                state.job_pq.push(scheduled, JobPriority::High);
            }
        }

        if !shut {
            state.worker_pq.push(session, 0);
        }
        drop(state);
        self.sched_notify.notify_one();
    }

    async fn worker_shut(&self, session: SessionId) {
        let mut state = self.state.lock().await;
        let Some(worker) = state.workers.get_mut(&session) else {
            return;
        };
        worker.shut = true;
        let ack = Message::signed(MessageKind::ShutAck, Vec::new(), &self.keypair);
        worker.handle.send(ack.encode());
        drop(state);

        tracing::info!(%session, "Worker shutting down");
        let directory = self.directory.clone();
        tokio::spawn(async move {
            if let Err(e) = directory.disconnect_worker().await {
                tracing::warn!(error = %e, "Directory disconnect_worker failed");
            }
        });
    }

    /// Socket closed. A busy worker's job is retried at High priority; the
    /// session leaves the registry for good.
    pub async fn handle_worker_disconnect(&self, session: SessionId) {
        let mut state = self.state.lock().await;
        let Some(worker) = state.workers.remove(&session) else {
            return;
        };
        tracing::info!(%session, "Worker disconnected");
        if let Some(scheduled) = worker.assigned {
            tracing::warn!(%session, job_id = %scheduled.job.id, "Requeueing job from dead worker");
            state.job_pq.push(scheduled, JobPriority::High);
            drop(state);
            self.sched_notify.notify_one();
        }
    }
}
