//! Chord ring and the DHT built on it.
//!
//! Based on CHORD, ref: <https://pdos.csail.mit.edu/papers/ton:chord/paper-ton.pdf>
//! With high probability a lookup contacts O(log N) nodes. Storage places
//! each key on the first node at or after its hash, replicated across the
//! following successors.
pub mod did;
pub use did::BiasId;
pub use did::Did;
pub use did::NodeRef;
pub mod finger;
pub use finger::FingerTable;
pub mod successor;
pub use successor::SuccessorReader;
pub use successor::SuccessorSeq;
pub use successor::SuccessorWriter;
pub mod chord;
pub use chord::Ring;
pub use chord::RingAction;
pub mod stabilization;
pub use stabilization::Stabilization;
pub mod storage;
pub use storage::LocalShard;
pub mod service;
pub use service::DhtService;

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Node refs in clockwise order from the first one, spaced far enough
    /// apart that finger intervals stay distinguishable.
    pub fn gen_ordered_refs(n: usize) -> Vec<NodeRef> {
        (0..n)
            .map(|i| NodeRef {
                did: Did::from(10u32 + (i as u32) * 10),
                addr: format!("127.0.0.1:{}", 4500 + i).parse().unwrap(),
            })
            .collect()
    }
}
