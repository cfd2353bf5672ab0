//! Named map/reduce kernels.
//!
//! User callables never travel as code: a job ships the *name* of a kernel
//! and every worker resolves it against its local registry, so an invocation
//! is reproducible on any node that carries the same build.
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::Error;
use crate::error::Result;

/// A map function takes one input pair and emits intermediate pairs.
pub type MapKernel = fn(key: &[u8], value: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

/// A reduce function folds all values of one intermediate key into a single
/// output value.
pub type ReduceKernel = fn(key: &[u8], values: Vec<Bytes>) -> Result<Bytes>;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Kernel {
    pub map_fn: MapKernel,
    pub reduce_fn: ReduceKernel,
}

/// Per-process kernel table, seeded with the builtins.
pub struct KernelRegistry {
    table: DashMap<String, Kernel>,
}

impl KernelRegistry {
    pub fn with_builtins() -> Self {
        let registry = Self {
            table: DashMap::new(),
        };
        registry.register("wc", Kernel {
            map_fn: wc::map,
            reduce_fn: wc::reduce,
        });
        registry
    }

    pub fn register(&self, name: &str, kernel: Kernel) {
        self.table.insert(name.to_string(), kernel);
    }

    pub fn get(&self, name: &str) -> Result<Kernel> {
        self.table
            .get(name)
            .map(|k| *k)
            .ok_or_else(|| Error::UnknownKernel(name.to_string()))
    }
}

/// Word count: the canonical smoke-test workload.
pub mod wc {
    use super::*;

    pub fn map(_key: &[u8], value: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let line = String::from_utf8_lossy(value);
        Ok(line
            .split_whitespace()
            .map(|w| {
                (
                    Bytes::copy_from_slice(w.to_lowercase().as_bytes()),
                    Bytes::copy_from_slice(&1u64.to_be_bytes()),
                )
            })
            .collect())
    }

    pub fn reduce(_key: &[u8], values: Vec<Bytes>) -> Result<Bytes> {
        let mut total: u64 = 0;
        for v in values {
            let mut raw = [0u8; 8];
            if v.len() != 8 {
                return Err(Error::KernelFailed(format!(
                    "word count value has {} bytes, want 8",
                    v.len()
                )));
            }
            raw.copy_from_slice(&v);
            total += u64::from_be_bytes(raw);
        }
        Ok(Bytes::copy_from_slice(&total.to_be_bytes()))
    }
}
