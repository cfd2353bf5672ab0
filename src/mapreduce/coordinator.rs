//! Per-job coordination: chunk the input, dispatch tasks, hold the barrier
//! between phases, retry around dead workers, collect the results.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use bytes::Bytes;

use super::keys;
use super::JobOptions;
use crate::consts::NODE_NAME_PREFIX;
use crate::dht::did::NodeRef;
use crate::dht::service::DhtService;
use crate::dht::successor::SuccessorReader;
use crate::directory::Directory;
use crate::error::Error;
use crate::error::Result;
use crate::mapreduce::task::JobId;
use crate::mapreduce::task::JobPhase;
use crate::mapreduce::task::Phase;
use crate::mapreduce::task::StatusReport;
use crate::mapreduce::task::TaskAssignment;
use crate::mapreduce::task::TaskDescriptor;
use crate::mapreduce::task::TaskOutcome;
use crate::mapreduce::task::TaskReport;
use crate::mapreduce::task::TaskState;
use crate::rpc::from_wire;
use crate::rpc::to_wire;
use crate::rpc::Request;
use crate::rpc::Response;
use crate::utils::get_epoch_ms;

/// Mutable job record. One lock guards it; every state transition happens
/// under the lock, peer RPCs never do.
struct JobState {
    phase: JobPhase,
    map_tasks: Vec<TaskDescriptor>,
    reduce_tasks: Vec<TaskDescriptor>,
    /// Membership snapshot used for assignment, refreshed per sweep.
    workers: Vec<NodeRef>,
    rr_cursor: usize,
    bytes_written: u64,
    failure: Option<String>,
}

impl JobState {
    fn tasks_mut(&mut self, phase: Phase) -> &mut Vec<TaskDescriptor> {
        match phase {
            Phase::Map => &mut self.map_tasks,
            Phase::Reduce => &mut self.reduce_tasks,
        }
    }
}

/// One submitted job, owned by its coordinator node (the node the client
/// entered through). A coordinator crash loses the job; clients resubmit.
pub struct JobController {
    pub id: JobId,
    kernel: String,
    options: JobOptions,
    me: NodeRef,
    dht: Arc<DhtService>,
    directory: Arc<dyn Directory>,
    state: Mutex<JobState>,
    /// Woken by task reports so the dispatch loop reacts before the next
    /// sweep tick.
    wake: tokio::sync::Notify,
    /// Broadcasts phase changes to `await_results` callers.
    phase_tx: tokio::sync::watch::Sender<JobPhase>,
    results: Mutex<Option<HashMap<Bytes, Bytes>>>,
}

impl JobController {
    pub fn new(
        id: JobId,
        kernel: &str,
        options: JobOptions,
        me: NodeRef,
        dht: Arc<DhtService>,
        directory: Arc<dyn Directory>,
    ) -> Arc<Self> {
        let (phase_tx, _) = tokio::sync::watch::channel(JobPhase::Mapping);
        Arc::new(Self {
            id,
            kernel: kernel.to_string(),
            options,
            me,
            dht,
            directory,
            state: Mutex::new(JobState {
                phase: JobPhase::Mapping,
                map_tasks: vec![],
                reduce_tasks: vec![],
                workers: vec![],
                rr_cursor: 0,
                bytes_written: 0,
                failure: None,
            }),
            wake: tokio::sync::Notify::new(),
            phase_tx,
            results: Mutex::new(None),
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<JobState>> {
        self.state.lock().map_err(|_| Error::RingSyncLockError)
    }

    /// Drive the whole lifecycle. Spawned once per submission.
    pub async fn run(self: Arc<Self>, input: Vec<(Bytes, Bytes)>) {
        if let Err(e) = self.run_inner(input).await {
            let reason = e.to_string();
            tracing::error!("job {} failed: {}", self.id, reason);
            if let Ok(mut state) = self.lock_state() {
                state.failure.get_or_insert(reason);
                state.phase = JobPhase::Failed;
            }
            self.phase_tx.send_replace(JobPhase::Failed);
        }
    }

    async fn run_inner(&self, input: Vec<(Bytes, Bytes)>) -> Result<()> {
        self.ingest(input).await?;
        tracing::info!("job {}: map phase", self.id);
        self.run_phase(Phase::Map).await?;

        // barrier: reduce tasks only exist once every map task is Done
        self.plan_reduce().await?;
        {
            let mut state = self.lock_state()?;
            state.phase = JobPhase::Reducing;
        }
        self.phase_tx.send_replace(JobPhase::Reducing);
        tracing::info!("job {}: reduce phase", self.id);
        self.run_phase(Phase::Reduce).await?;

        self.finalize().await?;
        self.phase_tx.send_replace(JobPhase::Done);
        tracing::info!("job {}: done", self.id);
        Ok(())
    }

    /// Stage kernel handles and input chunks into the DHT and build the map
    /// task table.
    async fn ingest(&self, input: Vec<(Bytes, Bytes)>) -> Result<()> {
        let kernel = Bytes::from(self.kernel.clone());
        self.dht.put(&keys::map_fn(self.id), kernel.clone()).await?;
        self.dht.put(&keys::reduce_fn(self.id), kernel).await?;

        let mut staged: u64 = 0;
        let mut count = 0usize;
        for (index, chunk) in input.chunks(self.options.items_per_chunk.max(1)).enumerate() {
            let payload = Bytes::from(to_wire(&chunk.to_vec())?);
            staged += payload.len() as u64;
            if let Some(cap) = self.options.memory_cap {
                if staged > cap {
                    return Err(Error::CapacityExceeded);
                }
            }
            self.dht.put(&keys::chunk(self.id, index), payload).await?;
            count = index + 1;
        }
        tracing::info!("job {}: staged {} chunks, {} bytes", self.id, count, staged);

        let mut state = self.lock_state()?;
        state.bytes_written = staged;
        state.map_tasks = (0..count)
            .map(|i| TaskDescriptor::new(self.id, Phase::Map, i, keys::chunk(self.id, i)))
            .collect();
        Ok(())
    }

    /// Dispatch loop of one phase. Returns once every task is Done, errors
    /// once the job is failed.
    async fn run_phase(&self, phase: Phase) -> Result<()> {
        let sweep = Duration::from_millis((self.options.task_timeout_ms / 10).clamp(20, 1000));
        loop {
            let workers = self.live_workers().await;

            let dispatches = {
                let mut state = self.lock_state()?;
                if let Some(reason) = state.failure.clone() {
                    return Err(Error::JobFailed(reason));
                }
                state.workers = workers;

                let now = get_epoch_ms();
                let max_attempts = self.options.max_attempts;
                let timeout_ms = self.options.task_timeout_ms;
                let job = self.id;
                let me = self.me;
                let kernel_key = match phase {
                    Phase::Map => keys::map_fn(job),
                    Phase::Reduce => keys::reduce_fn(job),
                };

                let snapshot = state.workers.clone();
                let mut rr = state.rr_cursor;
                let mut aborted = None;
                let mut out: Vec<(TaskAssignment, NodeRef)> = vec![];

                let tasks = state.tasks_mut(phase);
                for task in tasks.iter_mut() {
                    if task.expired(now) {
                        tracing::warn!(
                            "job {}: {} task {} timed out on {:?}, requeueing",
                            job,
                            phase,
                            task.index,
                            task.assignee,
                        );
                        task.requeue();
                    }
                }

                if tasks.iter().all(|t| t.state == TaskState::Done) {
                    return Ok(());
                }

                if !snapshot.is_empty() {
                    for task in tasks.iter_mut().filter(|t| t.state == TaskState::Pending) {
                        if task.attempts >= max_attempts {
                            task.state = TaskState::Failed;
                            aborted = Some(format!(
                                "{} task {} exceeded {} attempts",
                                phase, task.index, max_attempts
                            ));
                            break;
                        }
                        // round-robin, skipping the worker that just failed
                        // this task when there is any alternative
                        let mut pick = snapshot[rr % snapshot.len()];
                        rr += 1;
                        if Some(pick) == task.assignee && snapshot.len() > 1 {
                            pick = snapshot[rr % snapshot.len()];
                            rr += 1;
                        }
                        task.dispatch(pick, timeout_ms);
                        out.push((
                            TaskAssignment {
                                job,
                                phase,
                                index: task.index,
                                input_key: task.input_key.clone(),
                                kernel_key: kernel_key.clone(),
                                coordinator: me,
                            },
                            pick,
                        ));
                    }
                }
                state.rr_cursor = rr;

                if let Some(reason) = aborted {
                    state.failure = Some(reason.clone());
                    state.phase = JobPhase::Failed;
                    return Err(Error::JobFailed(reason));
                }
                out
            };

            for (assignment, worker) in dispatches {
                let index = assignment.index;
                let request = match phase {
                    Phase::Map => Request::RunMap(assignment),
                    Phase::Reduce => Request::RunReduce(assignment),
                };
                let accepted = matches!(
                    self.dht.call(worker, request).await,
                    Ok(Response::Accepted(true))
                );
                if !accepted {
                    tracing::warn!(
                        "job {}: {} task {} not accepted by {}, requeueing",
                        self.id,
                        phase,
                        index,
                        worker
                    );
                    let mut state = self.lock_state()?;
                    let tasks = state.tasks_mut(phase);
                    if let Some(task) = tasks.get_mut(index) {
                        if task.state == TaskState::InFlight && task.assignee == Some(worker) {
                            task.requeue();
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sweep) => {}
            }
        }
    }

    /// Membership snapshot for assignment: every registered node that
    /// answers a ping right now.
    async fn live_workers(&self) -> Vec<NodeRef> {
        let mut workers = vec![];
        match self.directory.list(NODE_NAME_PREFIX).await {
            Ok(entries) => {
                for (_, addr) in entries {
                    let candidate = NodeRef::new(addr);
                    if candidate.did == self.me.did {
                        workers.push(candidate);
                        continue;
                    }
                    if let Ok(Response::Pong) = self.dht.call(candidate, Request::Ping).await {
                        workers.push(candidate);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("job {}: directory listing failed: {}", self.id, e);
                workers = self
                    .dht
                    .ring()
                    .successors()
                    .list()
                    .unwrap_or_default();
                workers.push(self.me);
            }
        }
        if workers.is_empty() {
            workers.push(self.me);
        }
        workers.sort_by_key(|w| w.did);
        workers.dedup_by_key(|w| w.did);
        workers
    }

    /// Enumerate the distinct intermediate buckets the map phase produced
    /// and build one reduce task per bucket.
    async fn plan_reduce(&self) -> Result<()> {
        let inter = self.dht.keys(&keys::inter_prefix(self.id)).await?;
        let mut buckets: Vec<String> = inter
            .iter()
            .filter_map(|k| keys::bucket_of(k))
            .map(str::to_string)
            .collect();
        buckets.sort();
        buckets.dedup();
        tracing::info!("job {}: {} distinct intermediate keys", self.id, buckets.len());

        let mut state = self.lock_state()?;
        state.reduce_tasks = buckets
            .into_iter()
            .enumerate()
            .map(|(i, bucket)| {
                TaskDescriptor::new(
                    self.id,
                    Phase::Reduce,
                    i,
                    keys::inter_bucket_prefix(self.id, &bucket),
                )
            })
            .collect();
        Ok(())
    }

    /// Collect the output mapping, then purge every key the job wrote.
    async fn finalize(&self) -> Result<()> {
        let out_keys = self.dht.keys(&keys::out_prefix(self.id)).await?;
        let mut results = HashMap::new();
        for key in out_keys {
            let payload = self.dht.get(&key).await?;
            let (out_key, out_value): (Bytes, Bytes) = from_wire(&payload)?;
            results.insert(out_key, out_value);
        }

        *self
            .results
            .lock()
            .map_err(|_| Error::RingSyncLockError)? = Some(results);
        {
            let mut state = self.lock_state()?;
            state.phase = JobPhase::Done;
        }

        for key in self.dht.keys(&keys::job_prefix(self.id)).await? {
            if let Err(e) = self.dht.delete(&key).await {
                tracing::debug!("job {}: cleanup of {:?} failed: {}", self.id, key, e);
            }
        }
        Ok(())
    }

    /// Apply a worker's completion report. Late reports for a phase that
    /// already closed are dropped; a Done task is never reopened.
    pub fn handle_report(&self, report: TaskReport) -> Result<()> {
        let mut state = self.lock_state()?;

        let phase_open = matches!(
            (report.phase, state.phase),
            (Phase::Map, JobPhase::Mapping) | (Phase::Reduce, JobPhase::Reducing)
        );
        if !phase_open {
            tracing::debug!(
                "job {}: dropping late {} report for task {} from {}",
                self.id,
                report.phase,
                report.index,
                report.worker
            );
            return Ok(());
        }

        let max_attempts = self.options.max_attempts;
        let mut add_bytes = 0u64;
        let mut failure = None;
        {
            let tasks = state.tasks_mut(report.phase);
            let task = match tasks.get_mut(report.index) {
                Some(t) => t,
                None => return Ok(()),
            };
            if task.state == TaskState::Done {
                return Ok(());
            }
            match report.outcome {
                TaskOutcome::Completed { bytes_written } => {
                    task.state = TaskState::Done;
                    add_bytes = bytes_written;
                }
                TaskOutcome::Failed { reason } => {
                    tracing::warn!(
                        "job {}: {} task {} failed on {}: {}",
                        self.id,
                        report.phase,
                        report.index,
                        report.worker,
                        reason
                    );
                    if task.attempts >= max_attempts {
                        task.state = TaskState::Failed;
                        failure = Some(format!("task aborted: {reason}"));
                    } else {
                        task.requeue();
                    }
                }
            }
        }

        state.bytes_written += add_bytes;
        if let Some(cap) = self.options.memory_cap {
            if state.bytes_written > cap {
                failure = Some(Error::CapacityExceeded.to_string());
            }
        }
        if let Some(reason) = failure {
            state.failure.get_or_insert(reason);
        }
        drop(state);

        self.wake.notify_one();
        Ok(())
    }

    /// Block until the job finishes, then hand back the output mapping.
    pub async fn await_results(&self) -> Result<HashMap<Bytes, Bytes>> {
        let mut rx = self.phase_tx.subscribe();
        loop {
            let phase = *rx.borrow();
            match phase {
                JobPhase::Done => {
                    let results = self
                        .results
                        .lock()
                        .map_err(|_| Error::RingSyncLockError)?
                        .clone();
                    return Ok(results.unwrap_or_default());
                }
                JobPhase::Failed => {
                    let reason = self
                        .lock_state()?
                        .failure
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string());
                    return Err(Error::JobFailed(reason));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::JobFailed("coordinator shut down".to_string()));
            }
        }
    }

    pub fn status(&self) -> Result<StatusReport> {
        let state = self.lock_state()?;
        let all = state.map_tasks.iter().chain(state.reduce_tasks.iter());
        let mut total = 0;
        let mut done = 0;
        let mut failed = 0;
        for task in all {
            total += 1;
            match task.state {
                TaskState::Done => done += 1,
                TaskState::Failed => failed += 1,
                _ => {}
            }
        }
        Ok(StatusReport {
            phase: state.phase,
            tasks_total: total,
            tasks_done: done,
            tasks_failed: failed,
        })
    }
}
