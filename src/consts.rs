//! Constant variables.

/// Bit width of the ring identifier space.
pub const RING_BITS: usize = 160;

/// Upper bound on any individual peer RPC, in milliseconds.
pub const REQUEST_TIMEOUT_MS: u64 = 500;

/// Upper bound on a single map/reduce task attempt, in milliseconds.
pub const MAX_TASK_TIMEOUT_MS: u64 = 300 * 1000;

/// Map fan-out granularity: input items grouped per chunk.
pub const ITEMS_PER_CHUNK: usize = 16;

/// Primary plus `DHT_REPLICATION_SIZE - 1` secondaries per key.
pub const DHT_REPLICATION_SIZE: usize = 5;

/// Successor list length. Must be >= the replication size.
pub const SUCCESSOR_LIST_LEN: usize = 5;

/// Ring maintenance interval, in milliseconds.
pub const STABILIZE_PERIOD_MS: u64 = 500;

/// Finger table maintenance interval, in milliseconds.
pub const FIX_FINGERS_PERIOD_MS: u64 = 100;

/// Predecessor liveness check interval, in milliseconds.
pub const CHECK_PREDECESSOR_PERIOD_MS: u64 = 1000;

/// Attempts per task before the whole job is failed.
pub const MAX_TASK_ATTEMPTS: u32 = 5;

/// Hop bound for iterative successor resolution.
pub const MAX_LOOKUP_HOPS: usize = RING_BITS * 2;

/// Largest accepted wire frame. Chunks and intermediate values must fit.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Directory name prefix under which every node registers itself.
pub const NODE_NAME_PREFIX: &str = "mapring.node.";

/// Well-known directory name of the ring anchor.
pub const RING_NAME: &str = "mapring.ring";
