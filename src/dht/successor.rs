//! Successor list for the Chord ring.
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;

use crate::dht::did::NodeRef;
use crate::dht::did::SortRing;
use crate::dht::BiasId;
use crate::dht::Did;
use crate::error::Error;
use crate::error::Result;

/// A bounded sequence of successors, kept in clockwise order from the owning
/// node. Multiple successors absorb contiguous node failures.
#[derive(Debug, Clone)]
pub struct SuccessorSeq {
    did: Did,
    max: usize,
    successors: Arc<RwLock<Vec<NodeRef>>>,
}

pub trait SuccessorReader {
    fn is_empty(&self) -> Result<bool>;
    fn is_full(&self) -> Result<bool>;
    fn get(&self, index: usize) -> Result<NodeRef>;
    fn len(&self) -> Result<usize>;
    fn min(&self) -> Result<Option<NodeRef>>;
    fn max(&self) -> Result<Option<NodeRef>>;
    fn list(&self) -> Result<Vec<NodeRef>>;
    fn contains(&self, did: Did) -> Result<bool>;
}

pub trait SuccessorWriter {
    fn update(&self, successor: NodeRef) -> Result<Option<NodeRef>>;
    fn extend(&self, succ_list: &[NodeRef]) -> Result<Vec<NodeRef>>;
    fn remove(&self, did: Did) -> Result<()>;
}

impl SuccessorSeq {
    pub fn new(did: Did, max: usize) -> Self {
        Self {
            did,
            max,
            successors: Arc::new(RwLock::new(vec![])),
        }
    }

    fn successors(&self) -> Result<RwLockReadGuard<Vec<NodeRef>>> {
        self.successors.read().map_err(|_| Error::RingSyncLockError)
    }

    fn bias(&self, did: Did) -> BiasId {
        did.bias(self.did)
    }
}

impl SuccessorReader for SuccessorSeq {
    fn contains(&self, did: Did) -> Result<bool> {
        let succs = self.successors()?;
        Ok(succs.iter().any(|s| s.did == did))
    }

    fn is_empty(&self) -> Result<bool> {
        let succs = self.successors()?;
        Ok(succs.is_empty())
    }

    fn is_full(&self) -> Result<bool> {
        let succs = self.successors()?;
        Ok(succs.len() >= self.max)
    }

    fn get(&self, index: usize) -> Result<NodeRef> {
        let succs = self.successors()?;
        Ok(succs[index])
    }

    fn len(&self) -> Result<usize> {
        let succs = self.successors()?;
        Ok(succs.len())
    }

    /// Immediate successor, None on an empty list (singleton ring).
    fn min(&self) -> Result<Option<NodeRef>> {
        let succs = self.successors()?;
        Ok(succs.first().copied())
    }

    fn max(&self) -> Result<Option<NodeRef>> {
        let succs = self.successors()?;
        Ok(succs.last().copied())
    }

    fn list(&self) -> Result<Vec<NodeRef>> {
        let succs = self.successors()?;
        Ok(succs.clone())
    }
}

impl SuccessorWriter for SuccessorSeq {
    fn update(&self, successor: NodeRef) -> Result<Option<NodeRef>> {
        if self.contains(successor.did)? || successor.did == self.did {
            return Ok(None);
        }

        if let Some(max) = self.max()? {
            if self.bias(successor.did) >= self.bias(max.did) && self.is_full()? {
                return Ok(None);
            }
        }

        let mut succs = self
            .successors
            .write()
            .map_err(|_| Error::RingSyncLockError)?;

        succs.push(successor);
        succs.sort_ring(self.did);
        succs.truncate(self.max);
        if succs.iter().any(|s| s.did == successor.did) {
            Ok(Some(successor))
        } else {
            Ok(None)
        }
    }

    fn extend(&self, succ_list: &[NodeRef]) -> Result<Vec<NodeRef>> {
        let mut ret = vec![];
        for s in succ_list {
            if let Some(r) = self.update(*s)? {
                ret.push(r);
            }
        }
        Ok(ret)
    }

    fn remove(&self, did: Did) -> Result<()> {
        let mut succs = self
            .successors
            .write()
            .map_err(|_| Error::RingSyncLockError)?;
        succs.retain(|v| v.did != did);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::tests::gen_ordered_refs;

    #[test]
    fn test_successor_update() {
        let refs = gen_ordered_refs(6);

        let succ = SuccessorSeq::new(refs[0].did, 3);
        assert!(succ.is_empty().unwrap());

        succ.update(refs[2]).unwrap();
        assert_eq!(succ.list().unwrap(), refs[2..3]);

        succ.update(refs[3]).unwrap();
        assert_eq!(succ.list().unwrap(), refs[2..4]);

        succ.update(refs[4]).unwrap();
        assert_eq!(succ.list().unwrap(), refs[2..5]);

        // full and further than the current max: rejected
        succ.update(refs[5]).unwrap();
        assert_eq!(succ.list().unwrap(), refs[2..5]);

        // closer successor displaces the furthest
        succ.update(refs[1]).unwrap();
        assert_eq!(succ.list().unwrap(), refs[1..4]);
    }

    #[test]
    fn test_successor_ignores_self_and_duplicates() {
        let refs = gen_ordered_refs(3);
        let succ = SuccessorSeq::new(refs[0].did, 3);

        assert!(succ.update(refs[0]).unwrap().is_none());
        assert!(succ.is_empty().unwrap());

        succ.update(refs[1]).unwrap();
        assert!(succ.update(refs[1]).unwrap().is_none());
        assert_eq!(succ.len().unwrap(), 1);
    }

    #[test]
    fn test_successor_remove() -> Result<()> {
        let refs = gen_ordered_refs(4);

        let succ = SuccessorSeq::new(refs[0].did, 3);
        succ.update(refs[1])?.unwrap();
        succ.update(refs[2])?.unwrap();
        succ.update(refs[3])?.unwrap();
        assert_eq!(succ.list()?, refs[1..4]);

        succ.remove(refs[2].did)?;
        assert_eq!(succ.list()?, vec![refs[1], refs[3]]);
        Ok(())
    }
}
