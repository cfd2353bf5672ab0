//! Two-phase map/reduce scheduling over the DHT.
//!
//! Everything a job touches lives in the DHT under `job/<JobId>/...`: the
//! input chunks, the kernel handles, the intermediate pairs and the final
//! outputs. Workers only ever see DHT keys, so any ring member can run any
//! task.
pub mod coordinator;
pub mod kernel;
pub mod task;
pub mod worker;

pub use coordinator::JobController;
pub use kernel::Kernel;
pub use kernel::KernelRegistry;
pub use task::JobId;
pub use worker::TaskRunner;

use crate::dht::Did;

/// DHT key scheme of one job.
///
/// Intermediate keys are deterministic in (bucket, chunk, emission index):
/// a retried map attempt rewrites the same keys, so partial output from a
/// dead attempt is overwritten rather than double-counted.
pub mod keys {
    use super::*;
    use crate::mapreduce::task::JobId;

    pub fn chunk(job: JobId, index: usize) -> String {
        format!("job/{job}/chunk/{index}")
    }

    pub fn map_fn(job: JobId) -> String {
        format!("job/{job}/map_fn")
    }

    pub fn reduce_fn(job: JobId) -> String {
        format!("job/{job}/reduce_fn")
    }

    pub fn inter_prefix(job: JobId) -> String {
        format!("job/{job}/inter/")
    }

    pub fn inter_bucket_prefix(job: JobId, bucket: &str) -> String {
        format!("job/{job}/inter/{bucket}/")
    }

    pub fn inter(job: JobId, out_key: &[u8], chunk: usize, seq: usize) -> String {
        let bucket = Did::hash(out_key).to_hex();
        format!("job/{job}/inter/{bucket}/{chunk}/{seq}")
    }

    pub fn out_prefix(job: JobId) -> String {
        format!("job/{job}/out/")
    }

    pub fn out(job: JobId, out_key: &[u8]) -> String {
        format!("job/{job}/out/{}", Did::hash(out_key).to_hex())
    }

    pub fn job_prefix(job: JobId) -> String {
        format!("job/{job}/")
    }

    /// Bucket segment of an intermediate key, if it is one.
    pub fn bucket_of(key: &str) -> Option<&str> {
        // job/<id>/inter/<bucket>/<chunk>/<seq>
        let mut parts = key.split('/');
        if parts.next() != Some("job") {
            return None;
        }
        parts.next()?;
        if parts.next() != Some("inter") {
            return None;
        }
        parts.next()
    }
}

/// Per-job knobs, defaulted from the crate constants.
#[derive(Clone, Debug)]
pub struct JobOptions {
    pub items_per_chunk: usize,
    pub task_timeout_ms: u64,
    pub max_attempts: u32,
    /// Cap on bytes a job may write into the ring. `None` means unbounded.
    pub memory_cap: Option<u64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            items_per_chunk: crate::consts::ITEMS_PER_CHUNK,
            task_timeout_ms: crate::consts::MAX_TASK_TIMEOUT_MS,
            max_attempts: crate::consts::MAX_TASK_ATTEMPTS,
            memory_cap: None,
        }
    }
}
