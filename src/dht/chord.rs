//! Chord algorithm implement.
//!
//! All ring state mutation is local and lock-guarded; anything that needs a
//! peer round-trip is handed back to the caller as a [RingAction] so RPCs are
//! never issued while a lock is held.
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::dht::did::NodeRef;
use crate::dht::successor::SuccessorReader;
use crate::dht::successor::SuccessorWriter;
use crate::dht::Did;
use crate::dht::FingerTable;
use crate::dht::SuccessorSeq;
use crate::error::Error;
use crate::error::Result;

/// Local Chord state of one process: finger table, successor list and
/// predecessor, all keyed by [Did] on the 2^160 ring.
#[derive(Clone)]
pub struct Ring {
    /// This node.
    pub me: NodeRef,
    /// Routing shortcuts, entry i caches the successor of `me + 2^i`.
    finger: Arc<Mutex<FingerTable>>,
    /// Next nodes on the ring, clockwise. Head is the immediate successor.
    successors: SuccessorSeq,
    /// Previous node on the ring, cleared when suspected dead.
    predecessor: Arc<Mutex<Option<NodeRef>>>,
}

/// Result of a local Chord step. `Forward` asks the caller to re-issue the
/// query at the given peer: lookups are iterative, the originator drives
/// every hop and owns the per-hop timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingAction {
    /// Nothing further to do.
    None,
    /// The query resolves to this node.
    Found(NodeRef),
    /// Re-issue the query at this peer.
    Forward(NodeRef),
}

impl Ring {
    pub fn new(me: NodeRef, succ_max: usize, finger_bits: usize) -> Self {
        Self {
            successors: SuccessorSeq::new(me.did, succ_max),
            predecessor: Arc::new(Mutex::new(None)),
            finger: Arc::new(Mutex::new(FingerTable::new(me.did, finger_bits))),
            me,
        }
    }

    pub fn lock_finger(&self) -> Result<MutexGuard<FingerTable>> {
        self.finger.lock().map_err(|_| Error::RingSyncLockError)
    }

    pub fn lock_predecessor(&self) -> Result<MutexGuard<Option<NodeRef>>> {
        self.predecessor.lock().map_err(|_| Error::RingSyncLockError)
    }

    pub fn successors(&self) -> &SuccessorSeq {
        &self.successors
    }

    pub fn predecessor(&self) -> Result<Option<NodeRef>> {
        Ok(*self.lock_predecessor()?)
    }

    /// Account a freshly discovered peer in the finger table and successor
    /// list, and ask the caller to look up our own successor through it.
    pub fn join(&self, peer: NodeRef) -> Result<RingAction> {
        if peer.did == self.me.did {
            return Ok(RingAction::None);
        }

        self.lock_finger()?.join(peer);
        self.successors.update(peer)?;

        Ok(RingAction::Forward(peer))
    }

    /// One local step of successor resolution for `id`.
    pub fn find_successor(&self, id: Did) -> Result<RingAction> {
        // copy the predecessor out so no lock is held across the lookup
        let pred = *self.lock_predecessor()?;
        let succ = {
            if id == self.me.did {
                RingAction::Found(self.me)
            } else if pred.map_or(false, |p| id.in_arc(p.did, self.me.did)) {
                RingAction::Found(self.me)
            } else {
                self.find_successor_after_self(id)?
            }
        };

        tracing::trace!(
            "find_successor: self: {}, id: {}, result: {:?}",
            self.me,
            id,
            succ
        );

        Ok(succ)
    }

    fn find_successor_after_self(&self, id: Did) -> Result<RingAction> {
        let first = match self.successors.min()? {
            // Singleton ring answers everything itself.
            None => return Ok(RingAction::Found(self.me)),
            Some(first) => first,
        };

        if id.in_arc(self.me.did, first.did) {
            Ok(RingAction::Found(first))
        } else {
            match self.closest_preceding(id)? {
                Some(hop) => Ok(RingAction::Forward(hop)),
                None => Ok(RingAction::Found(first)),
            }
        }
    }

    /// Closest known node strictly preceding `id`, picked from the finger
    /// table and the successor list, whichever gets nearer.
    pub fn closest_preceding(&self, id: Did) -> Result<Option<NodeRef>> {
        let from_finger = self.lock_finger()?.closest_preceding(id);

        let mut from_succ = None;
        for s in self.successors.list()?.into_iter().rev() {
            if s.did.bias(self.me.did) < id.bias(self.me.did) {
                from_succ = Some(s);
                break;
            }
        }

        Ok(match (from_finger, from_succ) {
            (Some(f), Some(s)) => {
                if f.did.bias(self.me.did) < s.did.bias(self.me.did) {
                    Some(s)
                } else {
                    Some(f)
                }
            }
            (f, s) => f.or(s),
        })
    }

    /// Handle an announcement from a node that thinks it is our predecessor.
    /// Concurrent joins resolve here: the tighter candidate always wins.
    pub fn notify(&self, candidate: NodeRef) -> Result<Option<NodeRef>> {
        if candidate.did == self.me.did {
            return Ok(None);
        }
        let mut predecessor = self.lock_predecessor()?;

        match *predecessor {
            Some(pre) => {
                if candidate.did.in_arc(pre.did, self.me.did) && candidate.did != self.me.did {
                    *predecessor = Some(candidate);
                    Ok(Some(candidate))
                } else {
                    Ok(None)
                }
            }
            None => {
                *predecessor = Some(candidate);
                Ok(Some(candidate))
            }
        }
    }

    /// Pick the next finger to repair, round-robin, and return its target id.
    pub fn next_finger(&self) -> Result<(usize, Did)> {
        let mut finger = self.lock_finger()?;
        let index = (finger.fix_finger_index + 1) % finger.list().len();
        finger.fix_finger_index = index;
        Ok((index, self.me.did.finger_start(index)))
    }

    /// Install the resolved successor for a finger slot.
    pub fn fix_finger(&self, index: usize, node: NodeRef) -> Result<()> {
        let mut finger = self.lock_finger()?;
        finger.fix_finger_index = index;
        if node.did == self.me.did {
            return Ok(());
        }
        finger.set(index, node);
        Ok(())
    }

    /// Drop a node proven dead from every local structure. If the successor
    /// list empties, refill it from the finger table.
    pub fn remove(&self, did: Did) -> Result<()> {
        // lock order is predecessor, then finger, as in find_successor
        let mut predecessor = self.lock_predecessor()?;
        let mut finger = self.lock_finger()?;
        if let Some(pre) = *predecessor {
            if pre.did == did {
                *predecessor = None;
            }
        }
        finger.remove(did);
        self.successors.remove(did)?;
        if self.successors.is_empty()? {
            if let Some(x) = finger.first() {
                self.successors.update(x)?;
            }
        }
        Ok(())
    }

    /// Clear the predecessor after a failed liveness probe.
    pub fn clear_predecessor(&self) -> Result<()> {
        *self.lock_predecessor()? = None;
        Ok(())
    }

    /// Whether this node is the primary owner of ring point `id`:
    /// `id ∈ (predecessor, self]`, or no other node is known.
    pub fn owns(&self, id: Did) -> Result<bool> {
        if id == self.me.did {
            return Ok(true);
        }
        match *self.lock_predecessor()? {
            Some(pred) => Ok(id.in_arc(pred.did, self.me.did)),
            None => Ok(self.successors.is_empty()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::tests::gen_ordered_refs;

    #[test]
    fn test_join_and_forward() -> Result<()> {
        let refs = gen_ordered_refs(4);
        let (a, b, c, d) = (refs[0], refs[1], refs[2], refs[3]);

        let ring = Ring::new(a, 3, 160);
        assert!(ring.successors().is_empty()?);
        assert!(ring.lock_finger()?.is_empty());

        // a node won't join itself
        assert_eq!(ring.join(a)?, RingAction::None);
        assert!(ring.successors().is_empty()?);

        assert_eq!(ring.join(b)?, RingAction::Forward(b));
        assert_eq!(ring.successors().list()?, vec![b]);
        assert!(ring.lock_finger()?.contains(b.did));

        // repeated join is idempotent
        ring.join(b)?;
        assert_eq!(ring.successors().list()?, vec![b]);

        ring.join(c)?;
        assert_eq!(ring.successors().list()?, vec![b, c]);

        // d is past the known fingers, lookups for it are forwarded to the
        // closest preceding node
        assert_eq!(ring.find_successor(d.did)?, RingAction::Forward(c));
        // c's successor resolution goes through b
        assert_eq!(ring.find_successor(c.did)?, RingAction::Forward(b));
        Ok(())
    }

    #[test]
    fn test_find_successor_singleton() -> Result<()> {
        let refs = gen_ordered_refs(2);
        let ring = Ring::new(refs[0], 3, 160);
        // a singleton ring owns every id
        assert_eq!(
            ring.find_successor(refs[1].did)?,
            RingAction::Found(refs[0])
        );
        assert_eq!(
            ring.find_successor(refs[0].did)?,
            RingAction::Found(refs[0])
        );
        Ok(())
    }

    #[test]
    fn test_find_successor_local_range() -> Result<()> {
        let refs = gen_ordered_refs(3);
        let (a, b, c) = (refs[0], refs[1], refs[2]);

        let ring = Ring::new(b, 3, 160);
        ring.join(c)?;
        ring.notify(a)?;

        // anything in (a, b] resolves to b locally
        assert_eq!(ring.find_successor(b.did)?, RingAction::Found(b));
        // anything in (b, c] resolves to the successor
        assert_eq!(ring.find_successor(c.did)?, RingAction::Found(c));
        Ok(())
    }

    #[test]
    fn test_notify_prefers_tighter_predecessor() -> Result<()> {
        let refs = gen_ordered_refs(3);
        let (a, b, c) = (refs[0], refs[1], refs[2]);

        let ring = Ring::new(c, 3, 160);
        assert_eq!(ring.notify(a)?, Some(a));
        assert_eq!(ring.predecessor()?, Some(a));

        // b is between a and c: tighter, adopted
        assert_eq!(ring.notify(b)?, Some(b));
        assert_eq!(ring.predecessor()?, Some(b));

        // a is looser now: ignored
        assert_eq!(ring.notify(a)?, None);
        assert_eq!(ring.predecessor()?, Some(b));
        Ok(())
    }

    #[test]
    fn test_remove_refills_successor_from_finger() -> Result<()> {
        let refs = gen_ordered_refs(3);
        let ring = Ring::new(refs[0], 1, 160);
        ring.join(refs[1])?;
        ring.join(refs[2])?;
        assert_eq!(ring.successors().list()?, vec![refs[1]]);

        ring.remove(refs[1].did)?;
        // the finger table still knows refs[2], the successor list refills
        assert_eq!(ring.successors().list()?, vec![refs[2]]);
        Ok(())
    }

    #[test]
    fn test_owns() -> Result<()> {
        let refs = gen_ordered_refs(3);
        let (a, b, c) = (refs[0], refs[1], refs[2]);

        let ring = Ring::new(b, 3, 160);
        ring.join(c)?;
        ring.notify(a)?;

        assert!(ring.owns(b.did)?);
        assert!(!ring.owns(c.did)?);
        assert!(!ring.owns(a.did)?);
        // a point between a and b belongs to b
        let between = a.did + Did::from(1u32);
        if between != b.did {
            assert!(ring.owns(between)?);
        }
        Ok(())
    }
}
