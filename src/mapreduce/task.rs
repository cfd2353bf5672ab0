//! Task bookkeeping for one map/reduce job.
use serde::Deserialize;
use serde::Serialize;

use crate::dht::did::NodeRef;
use crate::utils::get_epoch_ms;

/// Opaque per-submission token.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Map,
    Reduce,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Phase::Map => write!(f, "map"),
            Phase::Reduce => write!(f, "reduce"),
        }
    }
}

/// Monotonic except for the Failed -> Pending retry edge. Done is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// Coordinator-side record of one task, one per input chunk or one per
/// distinct intermediate key.
#[derive(Clone, Debug)]
pub struct TaskDescriptor {
    pub job: JobId,
    pub phase: Phase,
    pub index: usize,
    /// DHT key the assignee reads its input from.
    pub input_key: String,
    pub assignee: Option<NodeRef>,
    pub state: TaskState,
    pub attempts: u32,
    /// Epoch-ms deadline of the in-flight attempt.
    pub deadline_ms: u128,
}

impl TaskDescriptor {
    pub fn new(job: JobId, phase: Phase, index: usize, input_key: String) -> Self {
        Self {
            job,
            phase,
            index,
            input_key,
            assignee: None,
            state: TaskState::Pending,
            attempts: 0,
            deadline_ms: 0,
        }
    }

    /// Mark dispatched to `worker` with a fresh deadline.
    pub fn dispatch(&mut self, worker: NodeRef, timeout_ms: u64) {
        self.assignee = Some(worker);
        self.state = TaskState::InFlight;
        self.attempts += 1;
        self.deadline_ms = get_epoch_ms() + timeout_ms as u128;
    }

    /// Return to the pending pool for redispatch.
    pub fn requeue(&mut self) {
        self.assignee = None;
        self.state = TaskState::Pending;
        self.deadline_ms = 0;
    }

    pub fn expired(&self, now_ms: u128) -> bool {
        self.state == TaskState::InFlight && now_ms > self.deadline_ms
    }
}

/// What a worker is told to run. Travels in `runMap` / `runReduce` calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub job: JobId,
    pub phase: Phase,
    pub index: usize,
    /// Chunk key for map tasks, intermediate prefix for reduce tasks.
    pub input_key: String,
    /// DHT key holding the serialized kernel handle.
    pub kernel_key: String,
    /// Where completion is reported.
    pub coordinator: NodeRef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TaskOutcome {
    Completed {
        /// Bytes this attempt wrote into the DHT, for the job memory cap.
        bytes_written: u64,
    },
    Failed {
        reason: String,
    },
}

/// Worker -> coordinator completion report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskReport {
    pub job: JobId,
    pub phase: Phase,
    pub index: usize,
    pub worker: NodeRef,
    pub outcome: TaskOutcome,
}

/// Where a job stands, as answered to `status()` calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Mapping,
    Reducing,
    Done,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub phase: JobPhase,
    pub tasks_total: usize,
    pub tasks_done: usize,
    pub tasks_failed: usize,
}
