//! One process, one node: Chord ring, DHT shard, task runner and job table
//! wired behind a single RPC surface.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::config::Config;
use crate::consts::MAX_LOOKUP_HOPS;
use crate::consts::RING_BITS;
use crate::consts::RING_NAME;
use crate::dht::chord::Ring;
use crate::dht::did::NodeRef;
use crate::dht::service::DhtService;
use crate::dht::stabilization::Stabilization;
use crate::dht::storage::LocalShard;
use crate::dht::successor::SuccessorReader;
use crate::dht::successor::SuccessorWriter;
use crate::directory::Directory;
use crate::error::Error;
use crate::error::Result;
use crate::mapreduce::coordinator::JobController;
use crate::mapreduce::kernel::KernelRegistry;
use crate::mapreduce::task::JobId;
use crate::mapreduce::task::StatusReport;
use crate::mapreduce::worker::TaskRunner;
use crate::mapreduce::JobOptions;
use crate::rpc::client::is_unreachable;
use crate::rpc::server::RequestHandler;
use crate::rpc::Envelope;
use crate::rpc::LookupStep;
use crate::rpc::Request;
use crate::rpc::Response;
use crate::rpc::RpcClient;

/// Process-wide singleton. Initialize once at startup, share via `Arc`.
pub struct Node {
    me: NodeRef,
    config: Config,
    ring: Arc<Ring>,
    shard: Arc<LocalShard>,
    dht: Arc<DhtService>,
    stabilization: Arc<Stabilization>,
    directory: Arc<dyn Directory>,
    kernels: Arc<KernelRegistry>,
    runner: TaskRunner,
    jobs: DashMap<JobId, Arc<JobController>>,
}

impl Node {
    pub fn new(
        addr: SocketAddr,
        client: Arc<dyn RpcClient>,
        directory: Arc<dyn Directory>,
        config: Config,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let me = NodeRef::new(addr);
        let ring = Arc::new(Ring::new(me, config.successor_list_len, RING_BITS));
        let shard = Arc::new(LocalShard::new());
        let dht = Arc::new(DhtService::new(
            me,
            ring.clone(),
            shard.clone(),
            client,
            config.replication,
        ));
        let stabilization = Arc::new(Stabilization::new(ring.clone(), dht.clone()));
        let kernels = Arc::new(KernelRegistry::with_builtins());
        let runner = TaskRunner::new(me, dht.clone(), kernels.clone());

        Ok(Arc::new(Self {
            me,
            config,
            ring,
            shard,
            dht,
            stabilization,
            directory,
            kernels,
            runner,
            jobs: DashMap::new(),
        }))
    }

    pub fn me(&self) -> NodeRef {
        self.me
    }

    pub fn dht(&self) -> &Arc<DhtService> {
        &self.dht
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    pub fn stabilization(&self) -> &Arc<Stabilization> {
        &self.stabilization
    }

    pub fn kernels(&self) -> &Arc<KernelRegistry> {
        &self.kernels
    }

    /// Register in the directory and either anchor a fresh ring or join the
    /// existing one.
    pub async fn bootstrap(&self) -> Result<()> {
        self.directory.register(&self.me.name(), self.me.addr).await?;
        match self.directory.lookup(RING_NAME).await {
            Ok(anchor) if anchor != self.me.addr => self.join(anchor).await,
            Ok(_) => Ok(()),
            Err(Error::NameNotFound(_)) => {
                tracing::info!("no ring in the directory, announcing self as anchor");
                self.directory.register(RING_NAME, self.me.addr).await
            }
            Err(e) => Err(e),
        }
    }

    /// Join the ring through a bootstrap peer: resolve our own successor via
    /// the peer, adopt it and announce ourselves. Aborts on id collision.
    pub async fn join(&self, bootstrap: SocketAddr) -> Result<()> {
        let peer = NodeRef::new(bootstrap);
        if peer.addr == self.me.addr {
            return Ok(());
        }
        if peer.did == self.me.did {
            return Err(Error::IdCollision);
        }

        self.ring.join(peer)?;

        // iterative lookup of our own successor, driven through the peer
        let mut hop = peer;
        for _ in 0..MAX_LOOKUP_HOPS {
            let request = Request::FindSuccessor { id: self.me.did };
            match self.dht.call(hop, request).await {
                Ok(Response::Successor(LookupStep::Found(succ))) => {
                    if succ.did == self.me.did && succ.addr != self.me.addr {
                        return Err(Error::IdCollision);
                    }
                    if succ.did != self.me.did {
                        self.ring.successors().update(succ)?;
                        self.stabilization.announce(succ).await;
                    }
                    tracing::info!("joined ring via {}, successor {}", peer, succ);
                    return Ok(());
                }
                Ok(Response::Successor(LookupStep::Forward(next))) => {
                    if next.did == self.me.did && next.addr != self.me.addr {
                        return Err(Error::IdCollision);
                    }
                    if next.did == hop.did {
                        // hop can't improve, treat it as our successor
                        self.ring.successors().update(hop)?;
                        self.stabilization.announce(hop).await;
                        return Ok(());
                    }
                    hop = next;
                }
                Ok(_) => return Err(Error::UnexpectedResponse("join find_successor")),
                Err(e) if is_unreachable(&e) => {
                    return Err(Error::RingEmpty);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::LookupDiverged)
    }

    /// Periodic ring upkeep plus the directory re-check that lets an
    /// isolated node rejoin through whatever peer is still registered.
    pub fn spawn_maintenance(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = self.stabilization.clone().spawn(
            self.config.stabilize_period(),
            self.config.fix_fingers_period(),
            self.config.check_predecessor_period(),
        );

        let this = self;
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.stabilize_period());
            loop {
                tick.tick().await;
                if let Err(e) = this.check_ring_membership().await {
                    tracing::debug!("ring membership check failed: {}", e);
                }
            }
        }));
        handles
    }

    /// Re-anchor or rejoin when the ring pointer moved or we got isolated.
    async fn check_ring_membership(&self) -> Result<()> {
        match self.directory.lookup(RING_NAME).await {
            Ok(anchor) if anchor != self.me.addr => {
                if self.ring.successors().is_empty()? {
                    tracing::info!("isolated from ring, rejoining via {}", anchor);
                    self.join(anchor).await?;
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(Error::NameNotFound(_)) => {
                self.directory.register(RING_NAME, self.me.addr).await
            }
            Err(e) => Err(e),
        }
    }

    /// Submit a job; this node becomes its coordinator.
    pub fn submit(
        &self,
        input: Vec<(Bytes, Bytes)>,
        kernel: &str,
        options: JobOptions,
    ) -> Result<JobId> {
        self.kernels.get(kernel)?;
        let job = JobId::generate();
        let controller = JobController::new(
            job,
            kernel,
            options,
            self.me,
            self.dht.clone(),
            self.directory.clone(),
        );
        self.jobs.insert(job, controller.clone());
        tokio::spawn(controller.run(input));
        tracing::info!("job {} submitted with kernel {:?}", job, kernel);
        Ok(job)
    }

    /// Block until the job completes or fails.
    pub async fn await_results(&self, job: JobId) -> Result<HashMap<Bytes, Bytes>> {
        let controller = self
            .jobs
            .get(&job)
            .map(|c| Arc::clone(c.value()))
            .ok_or(Error::UnknownJob)?;
        controller.await_results().await
    }

    pub fn status(&self, job: JobId) -> Result<StatusReport> {
        let controller = self
            .jobs
            .get(&job)
            .map(|c| Arc::clone(c.value()))
            .ok_or(Error::UnknownJob)?;
        controller.status()
    }
}

#[async_trait]
impl RequestHandler for Node {
    async fn handle(&self, envelope: Envelope) -> Response {
        let Envelope { from, request } = envelope;
        match self.dispatch(from, request).await {
            Ok(response) => response,
            Err(e) => Response::Error(e.to_string()),
        }
    }
}

impl Node {
    async fn dispatch(&self, from: NodeRef, request: Request) -> Result<Response> {
        tracing::trace!("rpc from {}", from);
        match request {
            Request::FindSuccessor { id } => {
                let step = match self.ring.find_successor(id)? {
                    crate::dht::RingAction::Found(owner) => LookupStep::Found(owner),
                    crate::dht::RingAction::Forward(next) => LookupStep::Forward(next),
                    crate::dht::RingAction::None => LookupStep::Found(self.me),
                };
                Ok(Response::Successor(step))
            }
            Request::GetPredecessor => Ok(Response::Predecessor(self.ring.predecessor()?)),
            Request::GetSuccessorList => {
                Ok(Response::SuccessorList(self.ring.successors().list()?))
            }
            Request::Notify { candidate } => {
                self.ring.notify(candidate)?;
                Ok(Response::Ok)
            }
            Request::Ping => Ok(Response::Pong),
            Request::DhtPut { key, value } => {
                self.dht.put(&key, value).await?;
                Ok(Response::Ok)
            }
            Request::DhtGet { key } => match self.dht.get_entry(&key).await {
                Ok(entry) => Ok(Response::Value(Some(entry))),
                Err(Error::KeyNotFound) => Ok(Response::Value(None)),
                Err(e) => Err(e),
            },
            Request::DhtDelete { key } => {
                self.dht.delete(&key).await?;
                Ok(Response::Ok)
            }
            Request::DhtLocalKeys { prefix } => {
                Ok(Response::Keys(self.shard.keys_with_prefix(&prefix)))
            }
            Request::LocalGet { key } => {
                Ok(Response::Value(self.shard.get(&key).map(|(e, _)| e)))
            }
            Request::Replicate { key, entry } => {
                Ok(Response::Accepted(self.shard.admit_replica(&key, entry)))
            }
            Request::ReplicaDrop { key } => {
                self.shard.remove_replica(&key);
                Ok(Response::Ok)
            }
            Request::PullPrimaries => Ok(Response::Primaries(self.shard.primary_items())),
            Request::Migrate { key, entry } => {
                Ok(Response::Accepted(self.shard.admit_primary(&key, entry)))
            }
            Request::RunMap(assignment) | Request::RunReduce(assignment) => {
                Ok(Response::Accepted(self.runner.accept(assignment)))
            }
            Request::ReportTask(report) => {
                let controller = self
                    .jobs
                    .get(&report.job)
                    .map(|c| Arc::clone(c.value()))
                    .ok_or(Error::UnknownJob)?;
                controller.handle_report(report)?;
                Ok(Response::Ok)
            }
            Request::TaskStatus { job } => {
                let status = self
                    .jobs
                    .get(&job)
                    .map(|c| c.status())
                    .transpose()?;
                Ok(Response::JobStatus(status))
            }
        }
    }
}
