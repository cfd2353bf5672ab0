//! Error of mapring.

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Peer did not answer within the request deadline")]
    RpcTimeout,

    #[error("Peer unreachable: {0}")]
    RpcUnreachable(String),

    #[error("Peer reported: {0}")]
    Remote(String),

    #[error("Key absent from all reachable replicas")]
    KeyNotFound,

    #[error("No replica answered")]
    Unavailable,

    #[error("Write rejected, a newer version exists")]
    VersionConflict,

    #[error("Task did not complete within the task deadline")]
    TaskTimeout,

    #[error("Task exceeded its retry cap")]
    TaskAborted,

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Per-job memory cap exceeded")]
    CapacityExceeded,

    #[error("No ring member reachable")]
    RingEmpty,

    #[error("Ring id collision, joining node must abort")]
    IdCollision,

    #[error("Not a ring id: {0}")]
    InvalidDid(String),

    #[error("Successor lookup exceeded the hop bound")]
    LookupDiverged,

    #[error("Unexpected ring action, {0}")]
    RingUnexpectedAction(String),

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("Unknown kernel {0:?}")]
    UnknownKernel(String),

    #[error("Kernel failed: {0}")]
    KernelFailed(String),

    #[error("Unknown job")]
    UnknownJob,

    #[error("Name not registered: {0}")]
    NameNotFound(String),

    #[error("Wire frame exceeds size bound, {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Bincode serialization error")]
    BincodeSerialize(#[source] bincode::Error),

    #[error("Bincode deserialization error")]
    BincodeDeserialize(#[source] bincode::Error),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Failed to read ring state from a sync lock")]
    RingSyncLockError,
}

pub type Result<T> = std::result::Result<T, Error>;
