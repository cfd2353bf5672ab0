//! Periodic ring maintenance: stabilize, fix fingers, check predecessor.
use std::sync::Arc;
use std::time::Duration;

use crate::dht::chord::Ring;
use crate::dht::did::NodeRef;
use crate::dht::service::DhtService;
use crate::dht::successor::SuccessorReader;
use crate::dht::successor::SuccessorWriter;
use crate::error::Result;
use crate::rpc::client::is_unreachable;
use crate::rpc::Request;
use crate::rpc::Response;

/// Drives the three periodic repairs of one node. Each repair snapshots the
/// ring under its locks, then talks to peers with the locks released.
pub struct Stabilization {
    ring: Arc<Ring>,
    service: Arc<DhtService>,
}

impl Stabilization {
    pub fn new(ring: Arc<Ring>, service: Arc<DhtService>) -> Self {
        Self { ring, service }
    }

    /// Repair the successor pointer and reconcile the successor list, then
    /// announce ourselves to the successor and let the replica layer react
    /// to whatever changed.
    pub async fn stabilize(&self) -> Result<()> {
        let me = self.ring.me;

        let successor = match self.ring.successors().min()? {
            Some(s) => s,
            None => {
                // degenerated ring: fall back to the predecessor if we still
                // know one
                if let Some(pred) = self.ring.predecessor()? {
                    if pred.did != me.did {
                        self.ring.successors().update(pred)?;
                    }
                }
                return Ok(());
            }
        };

        // adopt a tighter successor announced by the current one
        match self.service.call(successor, Request::GetPredecessor).await {
            Ok(Response::Predecessor(Some(p)))
                if p.did != me.did && p.did.in_arc(me.did, successor.did) =>
            {
                self.ring.successors().update(p)?;
            }
            Ok(_) => {}
            Err(e) if is_unreachable(&e) => {
                tracing::info!("successor {} unreachable, promoting next", successor);
                self.ring.remove(successor.did)?;
                return Ok(());
            }
            Err(e) => {
                tracing::debug!("stabilize: get_predecessor from {} failed: {}", successor, e);
            }
        }

        let head = match self.ring.successors().min()? {
            Some(s) => s,
            None => return Ok(()),
        };

        // reconcile our list from the successor's list
        match self.service.call(head, Request::GetSuccessorList).await {
            Ok(Response::SuccessorList(succs)) => {
                self.ring.successors().extend(&succs)?;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("stabilize: successor list from {} failed: {}", head, e),
        }

        if let Err(e) = self
            .service
            .call(head, Request::Notify { candidate: me })
            .await
        {
            tracing::debug!("stabilize: notify {} failed: {}", head, e);
        }

        if let Err(e) = self.service.sync_replicas().await {
            tracing::debug!("stabilize: replica sync failed: {}", e);
        }

        Ok(())
    }

    /// Repair one finger slot, round-robin.
    pub async fn fix_fingers(&self) -> Result<()> {
        let (index, target) = self.ring.next_finger()?;
        match self.service.resolve_successor(target).await {
            Ok(node) => self.ring.fix_finger(index, node),
            Err(e) => {
                tracing::debug!("fix_fingers: slot {} unresolved: {}", index, e);
                Ok(())
            }
        }
    }

    /// Clear the predecessor when it stops answering pings.
    pub async fn check_predecessor(&self) -> Result<()> {
        let pred = match self.ring.predecessor()? {
            Some(p) => p,
            None => return Ok(()),
        };
        match self.service.call(pred, Request::Ping).await {
            Ok(Response::Pong) => Ok(()),
            Ok(_) => Ok(()),
            Err(e) if is_unreachable(&e) => {
                tracing::info!("predecessor {} unreachable, clearing", pred);
                self.ring.clear_predecessor()
            }
            Err(e) => {
                tracing::debug!("check_predecessor: ping {} failed: {}", pred, e);
                Ok(())
            }
        }
    }

    /// One full maintenance round. Tests drive rings deterministically with
    /// this instead of timers.
    pub async fn run_once(&self) -> Result<()> {
        self.check_predecessor().await?;
        self.stabilize().await?;
        self.fix_fingers().await?;
        Ok(())
    }

    /// Spawn the three periodic loops. They run until the process exits;
    /// individual failures are logged and the loops keep going.
    pub fn spawn(
        self: Arc<Self>,
        stabilize_every: Duration,
        fix_fingers_every: Duration,
        check_predecessor_every: Duration,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![];

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(stabilize_every);
            loop {
                tick.tick().await;
                if let Err(e) = this.stabilize().await {
                    tracing::error!("stabilize failed: {}", e);
                }
            }
        }));

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(fix_fingers_every);
            loop {
                tick.tick().await;
                if let Err(e) = this.fix_fingers().await {
                    tracing::error!("fix_fingers failed: {}", e);
                }
            }
        }));

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(check_predecessor_every);
            loop {
                tick.tick().await;
                if let Err(e) = this.check_predecessor().await {
                    tracing::error!("check_predecessor failed: {}", e);
                }
            }
        }));

        handles
    }

    /// Bootstrap peer discovery hook used right after join: make sure the
    /// successor knows about us without waiting a full period.
    pub async fn announce(&self, to: NodeRef) {
        if let Err(e) = self
            .service
            .call(to, Request::Notify {
                candidate: self.ring.me,
            })
            .await
        {
            tracing::debug!("announce to {} failed: {}", to, e);
        }
    }
}
