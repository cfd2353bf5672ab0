//! Caller-facing DHT operations on top of the Chord ring.
//!
//! Routing is iterative: this node drives every lookup hop itself, so each
//! hop gets its own deadline and a dead hop can be pruned locally before
//! retrying. Writes land on the primary and fan out to the next R-1
//! successors in the background; reads fall back across that replica set.
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;

use crate::consts::MAX_LOOKUP_HOPS;
use crate::dht::chord::Ring;
use crate::dht::chord::RingAction;
use crate::dht::did::NodeRef;
use crate::dht::storage::Entry;
use crate::dht::storage::LocalShard;
use crate::dht::successor::SuccessorReader;
use crate::dht::Did;
use crate::error::Error;
use crate::error::Result;
use crate::rpc::client::is_unreachable;
use crate::rpc::Envelope;
use crate::rpc::LookupStep;
use crate::rpc::Request;
use crate::rpc::Response;
use crate::rpc::RpcClient;

/// DHT shard service of one node. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct DhtService {
    me: NodeRef,
    ring: Arc<Ring>,
    shard: Arc<LocalShard>,
    client: Arc<dyn RpcClient>,
    replication: usize,
    /// Successor set at the last replica sync, to detect topology change.
    synced_succs: Arc<Mutex<Vec<Did>>>,
}

impl DhtService {
    pub fn new(
        me: NodeRef,
        ring: Arc<Ring>,
        shard: Arc<LocalShard>,
        client: Arc<dyn RpcClient>,
        replication: usize,
    ) -> Self {
        Self {
            me,
            ring,
            shard,
            client,
            replication,
            synced_succs: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn shard(&self) -> &Arc<LocalShard> {
        &self.shard
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    /// One peer call stamped with this node as the caller.
    pub async fn call(&self, to: NodeRef, request: Request) -> Result<Response> {
        let envelope = Envelope {
            from: self.me,
            request,
        };
        match self.client.call(to.addr, envelope).await? {
            Response::Error(msg) => Err(Error::Remote(msg)),
            response => Ok(response),
        }
    }

    /// Resolve the live owner of ring point `id`, iteratively. Dead hops are
    /// pruned from the local ring and the walk restarts from what is left.
    pub async fn resolve_successor(&self, id: Did) -> Result<NodeRef> {
        let mut step = self.ring.find_successor(id)?;
        for _ in 0..MAX_LOOKUP_HOPS {
            let next = match step {
                RingAction::Found(owner) => return Ok(owner),
                RingAction::Forward(next) => next,
                RingAction::None => return Ok(self.me),
            };
            match self.call(next, Request::FindSuccessor { id }).await {
                Ok(Response::Successor(LookupStep::Found(owner))) => return Ok(owner),
                Ok(Response::Successor(LookupStep::Forward(hop))) => {
                    step = if hop.did == next.did {
                        // the hop has no closer peer, it is the best answer
                        RingAction::Found(next)
                    } else {
                        RingAction::Forward(hop)
                    };
                }
                Ok(_) => return Err(Error::UnexpectedResponse("find_successor")),
                Err(e) if is_unreachable(&e) => {
                    tracing::debug!("lookup hop {} unreachable, pruning: {}", next, e);
                    self.ring.remove(next.did)?;
                    step = self.ring.find_successor(id)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::LookupDiverged)
    }

    /// Store `value` under `key`. Returns after the primary write; the
    /// replica fan-out runs in the background and is logged, never fatal.
    pub async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let id = Did::hash(key.as_bytes());
        let primary = self.resolve_successor(id).await?;

        if primary.did == self.me.did {
            let entry = self.shard.put_primary(key, value, self.me.did);
            let this: DhtService = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                this.replicate_entry(&key, entry).await;
            });
            Ok(())
        } else {
            let request = Request::DhtPut {
                key: key.to_string(),
                value,
            };
            match self.call(primary, request).await? {
                Response::Ok => Ok(()),
                _ => Err(Error::UnexpectedResponse("dht_put")),
            }
        }
    }

    /// Read the current entry for `key`, with replica fallback. `KeyNotFound`
    /// means every reachable holder answered authoritatively without the
    /// key; `Unavailable` means nobody answered at all.
    pub async fn get_entry(&self, key: &str) -> Result<Entry> {
        let id = Did::hash(key.as_bytes());
        let primary = self.resolve_successor(id).await?;

        if primary.did == self.me.did {
            if let Some((entry, _)) = self.shard.get(key) {
                return Ok(entry);
            }
            return self.get_from_replicas(key, primary, true).await;
        }

        let request = Request::DhtGet {
            key: key.to_string(),
        };
        match self.call(primary, request).await {
            Ok(Response::Value(Some(entry))) => Ok(entry),
            Ok(Response::Value(None)) => Err(Error::KeyNotFound),
            Ok(_) => Err(Error::UnexpectedResponse("dht_get")),
            // the primary answered but could not serve: treat like silence
            // and ask the replicas ourselves
            Err(Error::Remote(_)) => self.get_from_replicas(key, primary, true).await,
            Err(e) if is_unreachable(&e) => self.get_from_replicas(key, primary, false).await,
            Err(e) => Err(e),
        }
    }

    /// Read `key` and return its bytes.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        Ok(self.get_entry(key).await?.value)
    }

    /// Probe the replica set of `primary` with local-only reads.
    async fn get_from_replicas(
        &self,
        key: &str,
        primary: NodeRef,
        primary_answered: bool,
    ) -> Result<Entry> {
        let mut answered = primary_answered;
        for replica in self.replica_candidates(primary).await {
            let request = Request::LocalGet {
                key: key.to_string(),
            };
            match self.call(replica, request).await {
                Ok(Response::Value(Some(entry))) => return Ok(entry),
                Ok(Response::Value(None)) => answered = true,
                Ok(_) => {}
                Err(e) => tracing::debug!("replica {} probe failed: {}", replica, e),
            }
        }
        if answered {
            Err(Error::KeyNotFound)
        } else {
            Err(Error::Unavailable)
        }
    }

    /// Remove `key` everywhere. Same routing as `put`; replica removal is
    /// backgrounded.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let id = Did::hash(key.as_bytes());
        let primary = self.resolve_successor(id).await?;

        if primary.did == self.me.did {
            self.shard.remove(key);
            let this: DhtService = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                for target in this.replica_targets() {
                    let request = Request::ReplicaDrop { key: key.clone() };
                    if let Err(e) = this.call(target, request).await {
                        tracing::debug!("replica drop of {:?} at {} failed: {}", key, target, e);
                    }
                }
            });
            Ok(())
        } else {
            let request = Request::DhtDelete {
                key: key.to_string(),
            };
            match self.call(primary, request).await? {
                Response::Ok => Ok(()),
                _ => Err(Error::UnexpectedResponse("dht_delete")),
            }
        }
    }

    /// Scatter-gather key enumeration: walk every node reachable over
    /// successor links and collect its local keys. Replica overlap produces
    /// duplicates, deduped here by key.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: HashSet<String> = self.shard.keys_with_prefix(prefix).into_iter().collect();

        let mut visited: HashSet<Did> = HashSet::from([self.me.did]);
        let mut frontier: Vec<NodeRef> = self.ring.successors().list()?;

        while let Some(node) = frontier.pop() {
            if !visited.insert(node.did) {
                continue;
            }
            let request = Request::DhtLocalKeys {
                prefix: prefix.to_string(),
            };
            match self.call(node, request).await {
                Ok(Response::Keys(remote)) => keys.extend(remote),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("keys scatter skipped {}: {}", node, e);
                    continue;
                }
            }
            if let Ok(Response::SuccessorList(succs)) =
                self.call(node, Request::GetSuccessorList).await
            {
                frontier.extend(succs.into_iter().filter(|s| !visited.contains(&s.did)));
            }
        }

        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        Ok(keys)
    }

    /// The next R-1 distinct successors of this node: its replica targets.
    fn replica_targets(&self) -> Vec<NodeRef> {
        let succs = self.ring.successors().list().unwrap_or_default();
        let mut seen = HashSet::from([self.me.did]);
        succs
            .into_iter()
            .filter(|s| seen.insert(s.did))
            .take(self.replication.saturating_sub(1))
            .collect()
    }

    /// Nodes likely holding replicas for keys owned by `primary`: ask the
    /// primary itself when possible, otherwise fall back to our own view of
    /// the ring after it.
    async fn replica_candidates(&self, primary: NodeRef) -> Vec<NodeRef> {
        let mut candidates: Vec<NodeRef> = vec![];
        if primary.did == self.me.did {
            candidates = self.ring.successors().list().unwrap_or_default();
        } else if let Ok(Response::SuccessorList(succs)) =
            self.call(primary, Request::GetSuccessorList).await
        {
            candidates = succs;
        }
        if candidates.is_empty() {
            // primary is mute: everything we know, clockwise after it
            let mut known = self.ring.successors().list().unwrap_or_default();
            if let Ok(finger) = self.ring.lock_finger() {
                known.extend(finger.list().iter().flatten().copied());
            }
            known.sort_by_key(|n| n.did - primary.did);
            candidates = known;
        }
        let mut seen = HashSet::from([primary.did, self.me.did]);
        candidates
            .into_iter()
            .filter(|s| seen.insert(s.did))
            .take(self.replication.saturating_sub(1))
            .collect()
    }

    async fn replicate_entry(&self, key: &str, entry: Entry) {
        for target in self.replica_targets() {
            let request = Request::Replicate {
                key: key.to_string(),
                entry: entry.clone(),
            };
            match self.call(target, request).await {
                Ok(Response::Accepted(_)) => {}
                Ok(_) => tracing::debug!("replicate {:?} at {}: odd response", key, target),
                Err(e) => tracing::debug!("replicate {:?} at {} failed: {}", key, target, e),
            }
        }
    }

    /// Replica upkeep, run after each stabilization round.
    ///
    /// On a successor-set change: push primary keys to the current replica
    /// set. Always: promote replica keys this node now owns, hand mis-owned
    /// primary keys to their owner, drop replica keys this node no longer
    /// backs, and pull the predecessor's primaries into replica role.
    pub async fn sync_replicas(&self) -> Result<()> {
        let current: Vec<Did> = self
            .ring
            .successors()
            .list()?
            .iter()
            .map(|s| s.did)
            .collect();
        let changed = {
            let mut synced = self
                .synced_succs
                .lock()
                .map_err(|_| Error::RingSyncLockError)?;
            let changed = *synced != current;
            *synced = current;
            changed
        };

        if changed {
            for (key, entry) in self.shard.primary_items() {
                self.replicate_entry(&key, entry).await;
            }
        }

        // promotion and migration both need a settled predecessor to decide
        // ownership; skip them until notify has run
        let pred = self.ring.predecessor()?;
        if pred.is_some() {
            self.promote_owned_replicas().await?;
            self.migrate_misplaced_primaries().await;
            self.drop_stale_replicas().await;
        }
        self.pull_predecessor_primaries(pred).await;
        Ok(())
    }

    /// Claim replica keys whose primary this node has become.
    async fn promote_owned_replicas(&self) -> Result<()> {
        for (key, _) in self.shard.replica_items() {
            let id = Did::hash(key.as_bytes());
            if self.ring.owns(id)? {
                if let Some(entry) = self.shard.promote(&key) {
                    tracing::debug!("claimed {:?} as primary", key);
                    self.replicate_entry(&key, entry).await;
                }
            }
        }
        Ok(())
    }

    /// Hand primary keys to their owner when ring repair moved them away.
    async fn migrate_misplaced_primaries(&self) {
        for (key, entry) in self.shard.primary_items() {
            let id = Did::hash(key.as_bytes());
            if self.ring.owns(id).unwrap_or(true) {
                continue;
            }
            let owner = match self.resolve_successor(id).await {
                Ok(owner) if owner.did != self.me.did => owner,
                _ => continue,
            };
            let request = Request::Migrate {
                key: key.clone(),
                entry,
            };
            match self.call(owner, request).await {
                Ok(Response::Accepted(_)) => {
                    self.shard.evict_primary(&key);
                    tracing::debug!("migrated {:?} to {}", key, owner);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("migrate {:?} to {} failed: {}", key, owner, e),
            }
        }
    }

    /// Drop replica keys whose primary no longer counts this node among its
    /// first R-1 successors.
    async fn drop_stale_replicas(&self) {
        let mut succ_cache: HashMap<Did, Vec<NodeRef>> = HashMap::new();
        for (key, _) in self.shard.replica_items() {
            let id = Did::hash(key.as_bytes());
            let primary = match self.resolve_successor(id).await {
                Ok(p) => p,
                Err(_) => continue,
            };
            if primary.did == self.me.did {
                continue;
            }
            let succs = if let Some(cached) = succ_cache.get(&primary.did) {
                cached.clone()
            } else {
                let fetched = match self.call(primary, Request::GetSuccessorList).await {
                    Ok(Response::SuccessorList(s)) => s,
                    _ => continue,
                };
                succ_cache.insert(primary.did, fetched.clone());
                fetched
            };
            let in_replica_set = succs
                .iter()
                .take(self.replication.saturating_sub(1))
                .any(|s| s.did == self.me.did);
            if !in_replica_set {
                self.shard.remove_replica(&key);
                tracing::debug!("dropped stale replica {:?}", key);
            }
        }
    }

    /// Pull the predecessor's primaries into this node's replica tables.
    async fn pull_predecessor_primaries(&self, pred: Option<NodeRef>) {
        let pred = match pred {
            Some(p) if p.did != self.me.did => p,
            _ => return,
        };
        match self.call(pred, Request::PullPrimaries).await {
            Ok(Response::Primaries(items)) => {
                for (key, entry) in items {
                    self.shard.admit_replica(&key, entry);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("replica pull from {} failed: {}", pred, e),
        }
    }
}
