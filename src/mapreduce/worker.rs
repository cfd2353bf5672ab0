//! Worker-side task execution.
//!
//! A worker accepts a task, fetches its input and kernel handle from the
//! DHT, runs the kernel, writes the output back into the DHT and reports
//! completion to the coordinator. Acceptance is immediate; the coordinator's
//! deadline sweep covers the crash-after-accept window.
use std::sync::Arc;

use bytes::Bytes;

use super::keys;
use crate::dht::did::NodeRef;
use crate::dht::service::DhtService;
use crate::error::Error;
use crate::error::Result;
use crate::mapreduce::kernel::KernelRegistry;
use crate::mapreduce::task::Phase;
use crate::mapreduce::task::TaskAssignment;
use crate::mapreduce::task::TaskOutcome;
use crate::mapreduce::task::TaskReport;
use crate::rpc::from_wire;
use crate::rpc::to_wire;
use crate::rpc::Request;
use crate::rpc::Response;

/// Executes assignments on this node. Clones share everything.
#[derive(Clone)]
pub struct TaskRunner {
    me: NodeRef,
    dht: Arc<DhtService>,
    kernels: Arc<KernelRegistry>,
}

impl TaskRunner {
    pub fn new(me: NodeRef, dht: Arc<DhtService>, kernels: Arc<KernelRegistry>) -> Self {
        Self { me, dht, kernels }
    }

    /// Take an assignment and run it on a spawned task. Returns whether the
    /// assignment was accepted.
    pub fn accept(&self, assignment: TaskAssignment) -> bool {
        tracing::debug!(
            "accepted {} task {} of job {}",
            assignment.phase,
            assignment.index,
            assignment.job
        );
        let this = self.clone();
        tokio::spawn(async move {
            this.execute_and_report(assignment).await;
        });
        true
    }

    async fn execute_and_report(&self, assignment: TaskAssignment) {
        let outcome = match assignment.phase {
            Phase::Map => self.run_map(&assignment).await,
            Phase::Reduce => self.run_reduce(&assignment).await,
        };
        let outcome = match outcome {
            Ok(bytes_written) => TaskOutcome::Completed { bytes_written },
            Err(e) => TaskOutcome::Failed {
                reason: e.to_string(),
            },
        };
        let report = TaskReport {
            job: assignment.job,
            phase: assignment.phase,
            index: assignment.index,
            worker: self.me,
            outcome,
        };
        match self
            .dht
            .call(assignment.coordinator, Request::ReportTask(report))
            .await
        {
            Ok(Response::Ok) => {}
            Ok(other) => tracing::warn!(
                "report of {} task {} got odd response: {:?}",
                assignment.phase,
                assignment.index,
                other
            ),
            Err(e) => tracing::warn!(
                "report of {} task {} to {} failed: {}",
                assignment.phase,
                assignment.index,
                assignment.coordinator,
                e
            ),
        }
    }

    /// Resolve the kernel handle staged for this job.
    async fn kernel_for(&self, kernel_key: &str) -> Result<(String, crate::mapreduce::Kernel)> {
        let raw = self.dht.get(kernel_key).await?;
        let name = String::from_utf8(raw.to_vec())
            .map_err(|_| Error::KernelFailed("kernel handle is not utf-8".to_string()))?;
        let kernel = self.kernels.get(&name)?;
        Ok((name, kernel))
    }

    /// Fetch the chunk, run `map_fn` over each pair, write every emission
    /// under a key derived from (bucket, chunk, emission index) so a retry
    /// overwrites instead of duplicating. Returns bytes written.
    async fn run_map(&self, assignment: &TaskAssignment) -> Result<u64> {
        let (name, kernel) = self.kernel_for(&assignment.kernel_key).await?;
        let chunk_raw = self.dht.get(&assignment.input_key).await?;
        let pairs: Vec<(Bytes, Bytes)> = from_wire(&chunk_raw)?;

        let mut written: u64 = 0;
        let mut seq = 0usize;
        for (in_key, in_value) in &pairs {
            let emitted = (kernel.map_fn)(in_key, in_value)
                .map_err(|e| Error::KernelFailed(format!("map {name}: {e}")))?;
            for (out_key, mid_value) in emitted {
                let dht_key = keys::inter(assignment.job, &out_key, assignment.index, seq);
                seq += 1;
                let payload = Bytes::from(to_wire(&(out_key, mid_value))?);
                written += payload.len() as u64;
                self.dht.put(&dht_key, payload).await?;
            }
        }
        tracing::debug!(
            "map task {} of job {}: {} emissions, {} bytes",
            assignment.index,
            assignment.job,
            seq,
            written
        );
        Ok(written)
    }

    /// Gather every intermediate value of one bucket, fold it with
    /// `reduce_fn`, store the final pair. Returns bytes written.
    async fn run_reduce(&self, assignment: &TaskAssignment) -> Result<u64> {
        let (name, kernel) = self.kernel_for(&assignment.kernel_key).await?;

        let inter_keys = self.dht.keys(&assignment.input_key).await?;
        let mut out_key: Option<Bytes> = None;
        let mut values = Vec::with_capacity(inter_keys.len());
        for key in inter_keys {
            let payload = self.dht.get(&key).await?;
            let (k, v): (Bytes, Bytes) = from_wire(&payload)?;
            out_key.get_or_insert(k);
            values.push(v);
        }
        let out_key = out_key.ok_or(Error::KeyNotFound)?;

        let reduced = (kernel.reduce_fn)(&out_key, values)
            .map_err(|e| Error::KernelFailed(format!("reduce {name}: {e}")))?;

        let dht_key = keys::out(assignment.job, &out_key);
        let payload = Bytes::from(to_wire(&(out_key, reduced))?);
        let written = payload.len() as u64;
        self.dht.put(&dht_key, payload).await?;
        Ok(written)
    }
}
