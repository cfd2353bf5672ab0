use std::cmp::Eq;
use std::cmp::PartialEq;
use std::net::SocketAddr;
use std::ops::Add;
use std::ops::Neg;
use std::ops::Sub;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::Deserialize;
use serde::Serialize;
use sha1::Digest;
use sha1::Sha1;

use crate::consts::RING_BITS;
use crate::error::Error;
use crate::error::Result;

/// Did is a point on the finite ring R(P) where P = 2^160, stored big-endian.
/// Node ids and key ids share this space.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd, Debug, Serialize, Deserialize, Hash)]
pub struct Did([u8; 20]);

impl std::fmt::Display for Did {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for b in self.0.iter().take(6) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

/// Bias Did is a special Did whose ordering is rotated so that `bias` becomes
/// the origin of the ring. Comparing two BiasId with the same bias compares
/// clockwise distance from that origin.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize, Hash)]
pub struct BiasId {
    bias: Did,
    did: Did,
}

impl BiasId {
    pub fn new(bias: Did, did: Did) -> BiasId {
        BiasId {
            bias,
            did: did - bias,
        }
    }

    pub fn to_did(self) -> Did {
        self.did + self.bias
    }

    /// Clockwise distance from the bias point.
    pub fn pos(&self) -> Did {
        self.did
    }
}

impl PartialOrd for BiasId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BiasId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if other.bias != self.bias {
            let did: Did = other.to_did();
            let bid = BiasId::new(self.bias, did);
            self.did.cmp(&bid.did)
        } else {
            self.did.cmp(&other.did)
        }
    }
}

impl From<BiasId> for Did {
    fn from(id: BiasId) -> Did {
        BiasId::to_did(id)
    }
}

impl From<u32> for Did {
    fn from(id: u32) -> Did {
        Self::from(BigUint::from(id))
    }
}

impl Did {
    /// Hash arbitrary bytes onto the ring: SHA-1 taken as a 160-bit integer.
    pub fn hash(bytes: &[u8]) -> Did {
        let digest = Sha1::digest(bytes);
        let mut raw = [0u8; 20];
        raw.copy_from_slice(&digest);
        Did(raw)
    }

    /// Test x <- (a, b], wrapping when a >= b.
    pub fn in_arc(&self, a: Did, b: Did) -> bool {
        let d = *self - a;
        d != Did::zero() && d <= b - a
    }

    /// Transform Did to BiasId relative to `bias`.
    pub fn bias(&self, bias: Did) -> BiasId {
        BiasId::new(bias, *self)
    }

    /// The i-th finger start: self + 2^i (mod 2^160).
    pub fn finger_start(&self, i: usize) -> Did {
        debug_assert!(i < RING_BITS);
        *self + Did::from(BigUint::from(2u16).pow(i as u32))
    }

    pub fn zero() -> Did {
        Did([0u8; 20])
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Sort a set of refs clockwise starting from a base node.
pub trait SortRing {
    fn sort_ring(&mut self, did: Did);
}

impl SortRing for Vec<Did> {
    fn sort_ring(&mut self, did: Did) {
        self.sort_by_key(|a| *a - did);
    }
}

impl From<Did> for BigUint {
    fn from(did: Did) -> BigUint {
        BigUint::from_bytes_be(&did.0)
    }
}

impl From<BigUint> for Did {
    fn from(a: BigUint) -> Self {
        let wrapped = a % (BigUint::from(2u16).pow(RING_BITS as u32));
        let mut va: Vec<u8> = wrapped.to_bytes_be();
        let mut res = vec![0u8; 20 - va.len()];
        res.append(&mut va);
        let mut raw = [0u8; 20];
        raw.copy_from_slice(&res);
        Self(raw)
    }
}

impl FromStr for Did {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim_start_matches("0x");
        if s.len() != 40 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidDid(s.to_string()));
        }
        let mut raw = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).unwrap() as u8;
            let lo = (chunk[1] as char).to_digit(16).unwrap() as u8;
            raw[i] = hi << 4 | lo;
        }
        Ok(Self(raw))
    }
}

// impl finite ring arithmetic for Did
impl Neg for Did {
    type Output = Self;
    fn neg(self) -> Self {
        let ret = BigUint::from(2u16).pow(RING_BITS as u32) - BigUint::from(self);
        ret.into()
    }
}

impl Add for Did {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        ((BigUint::from(self) + BigUint::from(rhs)) % (BigUint::from(2u16).pow(RING_BITS as u32)))
            .into()
    }
}

impl Sub for Did {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

/// A peer handle: ring id plus transport address. Nodes keep NodeRef values,
/// never owning references to peer objects.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize, Hash)]
pub struct NodeRef {
    pub did: Did,
    pub addr: SocketAddr,
}

impl NodeRef {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            did: Did::hash(addr.to_string().as_bytes()),
            addr,
        }
    }

    /// Directory name this node registers under.
    pub fn name(&self) -> String {
        format!("{}{}", crate::consts::NODE_NAME_PREFIX, self.did.to_hex())
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}", self.did, self.addr)
    }
}

impl SortRing for Vec<NodeRef> {
    fn sort_ring(&mut self, did: Did) {
        self.sort_by_key(|a| a.did - did);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finite_ring_neg() {
        let zero = Did::zero();
        let a = Did::from(0x11E807u32);
        assert_eq!(-a + a, zero);
        assert_eq!(-(-a), a);
    }

    #[test]
    fn test_wrap_around_arithmetic() {
        let max = Did::from(BigUint::from(2u16).pow(160) - 1u16);
        let one = Did::from(1u32);
        assert_eq!(max + one, Did::zero());
        assert_eq!(Did::zero() - one, max);
    }

    #[test]
    fn test_sort_ring() {
        let a = Did::from(10u32);
        let b = Did::from(20u32);
        let c = Did::from(30u32);
        let d = Did::from(40u32);
        let mut v = vec![c, b, a, d];
        v.sort_ring(a);
        assert_eq!(v, vec![a, b, c, d]);
        v.sort_ring(b);
        assert_eq!(v, vec![b, c, d, a]);
        v.sort_ring(c);
        assert_eq!(v, vec![c, d, a, b]);
        v.sort_ring(d);
        assert_eq!(v, vec![d, a, b, c]);
    }

    #[test]
    fn test_in_arc_wraps() {
        let a = Did::from(100u32);
        let b = Did::from(10u32);
        // (100, 10] crosses zero
        assert!(Did::from(200u32).in_arc(a, b));
        assert!(Did::from(5u32).in_arc(a, b));
        assert!(Did::from(10u32).in_arc(a, b));
        assert!(!Did::from(100u32).in_arc(a, b));
        assert!(!Did::from(50u32).in_arc(a, b));
    }

    #[test]
    fn test_bias_ordering() {
        let base = Did::from(100u32);
        let near = Did::from(120u32);
        let far = Did::from(20u32); // wraps, further clockwise
        assert!(near.bias(base) < far.bias(base));
    }

    #[test]
    fn test_hash_is_stable() {
        let a = Did::hash(b"127.0.0.1:4500");
        let b = Did::hash(b"127.0.0.1:4500");
        let c = Did::hash(b"127.0.0.1:4501");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hex_round_trip() {
        let a = Did::hash(b"some key");
        let b = Did::from_str(&a.to_hex()).unwrap();
        assert_eq!(a, b);
    }
}
