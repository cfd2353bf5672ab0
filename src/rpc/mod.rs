//! Peer RPC surface and wire codec.
//!
//! Every call is a single request/response exchange. Frames are
//! length-prefixed bincode; the caller attaches a deadline to the whole
//! exchange, so a silent peer surfaces as [Error::RpcTimeout].
pub mod client;
pub mod server;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::consts::MAX_FRAME_SIZE;
use crate::dht::did::NodeRef;
use crate::dht::storage::Entry;
use crate::dht::Did;
use crate::error::Error;
use crate::error::Result;
use crate::mapreduce::task::JobId;
use crate::mapreduce::task::StatusReport;
use crate::mapreduce::task::TaskAssignment;
use crate::mapreduce::task::TaskReport;

pub use client::RpcClient;
pub use client::TcpClient;

/// A request wrapped with its caller: every peer call carries the
/// originating node so the receiver can learn about it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeRef,
    pub request: Request,
}

/// The full peer surface. All requests are idempotent on their inputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    FindSuccessor { id: Did },
    GetPredecessor,
    GetSuccessorList,
    Notify { candidate: NodeRef },
    Ping,
    DhtPut { key: String, value: Bytes },
    DhtGet { key: String },
    DhtDelete { key: String },
    DhtLocalKeys { prefix: String },
    /// Read a node's own tables only, no routing. Used for replica fallback.
    LocalGet { key: String },
    /// Primary -> secondary entry push. Internal to replica sync.
    Replicate { key: String, entry: Entry },
    /// Primary -> secondary removal. Internal to replica sync.
    ReplicaDrop { key: String },
    /// Ask a node for the entries it primarily owns, for replica pull.
    PullPrimaries,
    /// Hand a primary entry to its rightful owner after a topology change.
    Migrate { key: String, entry: Entry },
    RunMap(TaskAssignment),
    RunReduce(TaskAssignment),
    ReportTask(TaskReport),
    TaskStatus { job: JobId },
}

/// One hop of iterative successor resolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupStep {
    /// The queried node resolved the id to this owner.
    Found(NodeRef),
    /// Re-issue the query at this closer peer.
    Forward(NodeRef),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Successor(LookupStep),
    Predecessor(Option<NodeRef>),
    SuccessorList(Vec<NodeRef>),
    Pong,
    Ok,
    /// Authoritative per-node answer: `None` means "I should have it and
    /// don't", which is distinct from being unreachable.
    Value(Option<Entry>),
    Keys(Vec<String>),
    Primaries(Vec<(String, Entry)>),
    /// Whether a task assignment was accepted for execution.
    Accepted(bool),
    JobStatus(Option<StatusReport>),
    /// Remote-side failure, stringified for the wire.
    Error(String),
}

pub fn to_wire<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(Error::BincodeSerialize)
}

pub fn from_wire<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    bincode::deserialize(raw).map_err(Error::BincodeDeserialize)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(stream: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let encoded = to_wire(value)?;
    if encoded.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(encoded.len()));
    }
    stream.write_all(&(encoded.len() as u32).to_be_bytes()).await?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(len));
    }
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    from_wire(&buffer)
}
