use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::crypto::sha256;

/// Scheduling priority of a job. Higher priorities are dispatched first;
/// jobs of equal priority go out in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Medium => write!(f, "medium"),
            JobPriority::High => write!(f, "high"),
        }
    }
}

/// Status of a single execution. The latest execution's status dictates
/// whether the job as a whole is cancelled, in flight, or done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Queued,
    Running,
    Cancelled,
    Done,
}

/// One run of a job on a worker.
///
/// `err` and `result` are opaque byte payloads; interpreting them is the
/// client's business. Once sealed, the hash commits to every other field and
/// the record must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub timestamp: i64,
    pub duration_ns: i64,
    pub err: Vec<u8>,
    pub result: Vec<u8>,
    /// Pubkey of the worker that ran this execution.
    pub by: Vec<u8>,
    pub status: ExecStatus,
    pub hash: Vec<u8>,
}

impl Execution {
    pub fn queued() -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            duration_ns: 0,
            err: Vec::new(),
            result: Vec::new(),
            by: Vec::new(),
            status: ExecStatus::Queued,
            hash: Vec::new(),
        }
    }

    /// Seal the execution: `hash = SHA256(timestamp ‖ duration ‖ err ‖ result ‖ by)`
    /// with the two integers rendered as base-10 ASCII.
    pub fn seal(&mut self) {
        let mut headers = Vec::new();
        headers.extend_from_slice(self.timestamp.to_string().as_bytes());
        headers.extend_from_slice(self.duration_ns.to_string().as_bytes());
        headers.extend_from_slice(&self.err);
        headers.extend_from_slice(&self.result);
        headers.extend_from_slice(&self.by);
        self.hash = sha256(&headers);
    }

    /// Recompute the hash and compare against the stored one.
    pub fn verify_hash(&self) -> bool {
        let mut copy = self.clone();
        copy.seal();
        copy.hash == self.hash
    }
}

/// A unit of work submitted by a client.
///
/// The task payload is opaque to the dispatcher; workers know how to run it.
/// At most one execution is in flight at any time, and every attempt is kept
/// in `executions` in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task: Vec<u8>,
    pub priority: JobPriority,
    pub executions: Vec<Execution>,
}

impl Job {
    pub fn new(task: Vec<u8>, priority: JobPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            priority,
            executions: vec![Execution::queued()],
        }
    }

    pub fn latest_exec(&self) -> &Execution {
        self.executions.last().expect("job always has an execution")
    }

    pub fn latest_exec_mut(&mut self) -> &mut Execution {
        self.executions
            .last_mut()
            .expect("job always has an execution")
    }

    /// Replace the in-flight execution with the record returned by a worker.
    pub fn set_exec(&mut self, exec: Execution) {
        *self.latest_exec_mut() = exec;
    }

    pub fn add_exec(&mut self, exec: Execution) {
        self.executions.push(exec);
    }

    pub fn status(&self) -> ExecStatus {
        self.latest_exec().status
    }

    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("job serializes")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A job travelling through the scheduler, paired with the sender half of
/// the client's result channel. Moved by value between the job queue, the
/// worker slot it gets assigned to, and final delivery.
#[derive(Debug)]
pub struct ScheduledJob {
    pub job: Job,
    pub result_tx: oneshot::Sender<Job>,
}

impl ScheduledJob {
    pub fn new(job: Job) -> (Self, oneshot::Receiver<Job>) {
        let (result_tx, result_rx) = oneshot::channel();
        (Self { job, result_tx }, result_rx)
    }

    /// Deliver the terminal job value to the client. A dropped receiver just
    /// means nobody is waiting anymore.
    pub fn deliver(self) {
        let id = self.job.id;
        if self.result_tx.send(self.job).is_err() {
            tracing::debug!(job_id = %id, "Result receiver dropped before delivery");
        }
    }
}
