//! Finger table of the Chord ring.
use std::ops::Index;

use serde::Deserialize;
use serde::Serialize;

use crate::dht::did::NodeRef;
use crate::dht::Did;

/// Routing table whose i-th entry caches the successor of `self + 2^i`.
/// Entries are compared with bias ordering relative to the owning node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FingerTable {
    did: Did,
    size: usize,
    finger: Vec<Option<NodeRef>>,
    pub(super) fix_finger_index: usize,
}

impl FingerTable {
    pub fn new(did: Did, size: usize) -> Self {
        Self {
            did,
            size,
            finger: vec![None; size],
            fix_finger_index: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First live entry, used to refill an emptied successor list.
    pub fn first(&self) -> Option<NodeRef> {
        self.finger.iter().flatten().next().copied()
    }

    pub fn get(&self, index: usize) -> Option<NodeRef> {
        if index >= self.finger.len() {
            return None;
        }
        self.finger[index]
    }

    fn get_ref(&self, index: usize) -> &Option<NodeRef> {
        if index >= self.finger.len() {
            return &None;
        }
        &self.finger[index]
    }

    pub fn set(&mut self, index: usize, node: NodeRef) {
        tracing::debug!("set finger table index: {} node: {}", index, node);
        if index >= self.finger.len() {
            tracing::error!("set finger index out of range, index: {}", index);
            return;
        }
        if node.did == self.did {
            return;
        }
        self.finger[index] = Some(node);
    }

    /// Setter used by the periodic fix-fingers round.
    pub fn set_fix(&mut self, node: NodeRef) {
        let index = self.fix_finger_index;
        self.set(index, node)
    }

    /// Remove a dead node, backfilling each of its slots with the next
    /// distinct entry so lookups keep converging.
    pub fn remove(&mut self, did: Did) {
        let indexes: Vec<usize> = self
            .finger
            .iter()
            .enumerate()
            .filter(|(_, x)| x.map(|n| n.did) == Some(did))
            .map(|(i, _)| i)
            .collect();

        if let (Some(&first_idx), Some(&last_idx)) = (indexes.first(), indexes.last()) {
            let fix = self.finger.get(last_idx + 1).copied().flatten();
            for idx in first_idx..=last_idx {
                self.finger[idx] = fix;
            }
        }
    }

    /// Slot a newly discovered node into every finger interval it covers,
    /// keeping the closest known entry per slot.
    pub fn join(&mut self, node: NodeRef) {
        if node.did == self.did {
            return;
        }
        let bias = node.did.bias(self.did);

        for k in 0..self.size {
            let pos = self.did.finger_start(k) - self.did;

            if bias.pos() < pos {
                continue;
            }

            if let Some(v) = self.finger[k] {
                if bias > v.did.bias(self.did) {
                    continue;
                }
            }

            self.finger[k] = Some(node);
        }
    }

    pub fn contains(&self, did: Did) -> bool {
        self.finger.iter().any(|x| x.map(|n| n.did) == Some(did))
    }

    /// Closest finger strictly preceding `did` in ring order, or None when no
    /// finger precedes it.
    pub fn closest_preceding(&self, did: Did) -> Option<NodeRef> {
        let bias = did.bias(self.did);

        for i in (0..self.size).rev() {
            if let Some(v) = self.finger[i] {
                if v.did != self.did && v.did.bias(self.did) < bias {
                    return Some(v);
                }
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.finger.iter().flatten().count()
    }

    pub fn list(&self) -> &Vec<Option<NodeRef>> {
        &self.finger
    }
}

impl Index<usize> for FingerTable {
    type Output = Option<NodeRef>;
    fn index(&self, index: usize) -> &Self::Output {
        self.get_ref(index)
    }
}
