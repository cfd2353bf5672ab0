//! Multi-node scenarios driven over an in-process transport.
//!
//! Nodes are wired together through [LocalClient] instead of TCP and the
//! periodic maintenance is stepped explicitly, so rings converge
//! deterministically under test.
mod jobs;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::DashSet;

use crate::config::Config;
use crate::dht::Did;
use crate::directory::MemDirectory;
use crate::error::Error;
use crate::error::Result;
use crate::node::Node;
use crate::rpc::server::RequestHandler;
use crate::rpc::Envelope;
use crate::rpc::Response;
use crate::rpc::RpcClient;

/// In-process transport: delivers envelopes straight into the target node's
/// handler. Killed addresses refuse traffic in both directions, which is
/// what a crashed process looks like from the outside.
pub struct LocalClient {
    handlers: DashMap<SocketAddr, Arc<Node>>,
    dead: DashSet<SocketAddr>,
}

impl LocalClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
            dead: DashSet::new(),
        })
    }

    pub fn register(&self, node: Arc<Node>) {
        self.handlers.insert(node.me().addr, node);
    }

    pub fn kill(&self, addr: SocketAddr) {
        self.dead.insert(addr);
    }
}

#[async_trait]
impl RpcClient for LocalClient {
    async fn call(&self, to: SocketAddr, envelope: Envelope) -> Result<Response> {
        if self.dead.contains(&envelope.from.addr) {
            return Err(Error::RpcUnreachable(format!("{} is down", envelope.from)));
        }
        if self.dead.contains(&to) {
            return Err(Error::RpcUnreachable(format!("{to} is down")));
        }
        // clone the Arc out so no map guard is held across the await
        let handler = self
            .handlers
            .get(&to)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| Error::RpcUnreachable(format!("{to} not listening")))?;
        Ok(handler.handle(envelope).await)
    }
}

/// A ring of in-process nodes sharing one transport and one directory.
pub struct Cluster {
    pub client: Arc<LocalClient>,
    pub directory: Arc<MemDirectory>,
    nodes: Mutex<Vec<Arc<Node>>>,
    next_port: Mutex<u16>,
}

impl Cluster {
    /// Boot `n` nodes and run the ring to convergence.
    pub async fn start(n: usize, config: Config) -> Arc<Self> {
        let cluster = Arc::new(Self {
            client: LocalClient::new(),
            directory: Arc::new(MemDirectory::new()),
            nodes: Mutex::new(vec![]),
            next_port: Mutex::new(9000),
        });
        for _ in 0..n {
            cluster.add_node(config.clone()).await;
        }
        cluster.stabilize(4 * n.max(2)).await;
        cluster
    }

    /// Boot one more node and join it to the ring.
    pub async fn add_node(&self, config: Config) -> Arc<Node> {
        let port = {
            let mut next = self.next_port.lock().unwrap();
            let port = *next;
            *next += 1;
            port
        };
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let node = Node::new(
            addr,
            self.client.clone(),
            self.directory.clone(),
            config,
        )
        .unwrap();
        self.client.register(node.clone());
        node.bootstrap().await.unwrap();
        self.nodes.lock().unwrap().push(node.clone());
        node
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().unwrap().clone()
    }

    pub fn node(&self, index: usize) -> Arc<Node> {
        self.nodes.lock().unwrap()[index].clone()
    }

    /// Step every node's maintenance `rounds` times, round-robin, the way
    /// the timers would interleave it.
    pub async fn stabilize(&self, rounds: usize) {
        for _ in 0..rounds {
            for node in self.nodes() {
                if let Err(e) = node.stabilization().run_once().await {
                    tracing::debug!("stabilization of {} errored: {}", node.me(), e);
                }
                // extra finger repairs per round keep lookups short
                for _ in 0..8 {
                    let _ = node.stabilization().fix_fingers().await;
                }
            }
        }
    }

    /// Keep the ring converging in the background while a job runs.
    pub fn spawn_auto_stabilize(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cluster = self;
        tokio::spawn(async move {
            loop {
                cluster.stabilize(1).await;
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
    }

    /// Crash a node: unreachable both ways, no longer stepped.
    pub fn kill(&self, node: &Arc<Node>) {
        self.client.kill(node.me().addr);
        self.nodes
            .lock()
            .unwrap()
            .retain(|n| n.me().did != node.me().did);
    }

    /// The node currently owning ring point `id`, by local ownership.
    pub fn owner_of(&self, id: Did) -> Option<Arc<Node>> {
        self.nodes()
            .into_iter()
            .find(|n| n.ring().owns(id).unwrap_or(false))
    }

    /// How many live nodes hold a copy of `key` in either table.
    pub fn holders_of(&self, key: &str) -> usize {
        self.nodes()
            .iter()
            .filter(|n| n.dht().shard().get(key).is_some())
            .count()
    }
}

/// Small test config: tight replication and fast task deadlines.
pub fn test_config() -> Config {
    Config {
        replication: 3,
        successor_list_len: 4,
        max_task_timeout_ms: 1500,
        items_per_chunk: 2,
        ..Config::default()
    }
}
