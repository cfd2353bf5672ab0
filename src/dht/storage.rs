//! Local key/value shard of the DHT.
//!
//! Every node holds two tables: the keys it primarily owns and the keys it
//! replicates for its predecessors. Entries carry a version counter; a write
//! is admitted only if it is newer than what the table already holds, with
//! ties broken by the originator id.
use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;

use crate::dht::Did;

/// A stored value with its write version and originating node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub value: Bytes,
    pub version: u64,
    pub origin: Did,
}

impl Entry {
    pub fn new(value: Bytes, version: u64, origin: Did) -> Self {
        Self {
            value,
            version,
            origin,
        }
    }

    /// Last-writer-wins: higher version, then higher originator id.
    pub fn supersedes(&self, current: &Entry) -> bool {
        self.version > current.version
            || (self.version == current.version && self.origin > current.origin)
    }
}

/// Which table a key currently lives in on this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// Concurrent in-memory shard. Readers of one key never block writers of
/// another.
#[derive(Debug, Default)]
pub struct LocalShard {
    primary: DashMap<String, Entry>,
    replicas: DashMap<String, Entry>,
}

impl LocalShard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary-side write. Bumps the version past whatever this node has
    /// seen for the key and returns the entry that was stored.
    pub fn put_primary(&self, key: &str, value: Bytes, origin: Did) -> Entry {
        let version = self
            .primary
            .get(key)
            .map(|e| e.version)
            .or_else(|| self.replicas.get(key).map(|e| e.version))
            .map_or(1, |v| v + 1);
        let entry = Entry::new(value, version, origin);
        self.primary.insert(key.to_string(), entry.clone());
        // the key is owned now, a stale replica copy must not shadow it
        self.replicas.remove(key);
        entry
    }

    /// Admit an already-versioned entry into the primary table, e.g. when a
    /// key migrates onto this node. Returns false if a newer write exists.
    pub fn admit_primary(&self, key: &str, entry: Entry) -> bool {
        self.admit(&self.primary, key, entry)
    }

    /// Admit a replicated entry. Returns false on version conflict.
    pub fn admit_replica(&self, key: &str, entry: Entry) -> bool {
        self.admit(&self.replicas, key, entry)
    }

    fn admit(&self, table: &DashMap<String, Entry>, key: &str, entry: Entry) -> bool {
        // read guard must be released before inserting into the same map
        let stale = table
            .get(key)
            .map_or(false, |current| !entry.supersedes(&current));
        if stale {
            return false;
        }
        table.insert(key.to_string(), entry);
        true
    }

    /// Read regardless of role. Primary copy wins when both exist.
    pub fn get(&self, key: &str) -> Option<(Entry, Role)> {
        if let Some(e) = self.primary.get(key) {
            return Some((e.clone(), Role::Primary));
        }
        self.replicas.get(key).map(|e| (e.clone(), Role::Replica))
    }

    pub fn remove(&self, key: &str) {
        self.primary.remove(key);
        self.replicas.remove(key);
    }

    pub fn remove_replica(&self, key: &str) {
        self.replicas.remove(key);
    }

    /// Move a replica copy into the primary table. Used when ring repair
    /// makes this node the owner of the key.
    pub fn promote(&self, key: &str) -> Option<Entry> {
        let (key, entry) = self.replicas.remove(key)?;
        let admitted = self.admit(&self.primary, &key, entry.clone());
        admitted.then_some(entry)
    }

    /// Take a primary entry off this node, for migration to a new owner.
    pub fn evict_primary(&self, key: &str) -> Option<Entry> {
        self.primary.remove(key).map(|(_, e)| e)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .primary
            .iter()
            .chain(self.replicas.iter())
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn primary_items(&self) -> Vec<(String, Entry)> {
        self.primary
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn replica_items(&self) -> Vec<(String, Entry)> {
        self.replicas
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(n: u32) -> Did {
        Did::from(n)
    }

    #[test]
    fn test_put_bumps_version() {
        let shard = LocalShard::new();
        let e1 = shard.put_primary("k", Bytes::from("a"), origin(1));
        assert_eq!(e1.version, 1);
        let e2 = shard.put_primary("k", Bytes::from("b"), origin(1));
        assert_eq!(e2.version, 2);
        assert_eq!(shard.get("k").unwrap().0.value, Bytes::from("b"));
    }

    #[test]
    fn test_replica_rejects_stale_write() {
        let shard = LocalShard::new();
        assert!(shard.admit_replica("k", Entry::new(Bytes::from("v2"), 2, origin(1))));
        // an older version must not overwrite
        assert!(!shard.admit_replica("k", Entry::new(Bytes::from("v1"), 1, origin(1))));
        // re-delivery of the same write is rejected too
        assert!(!shard.admit_replica("k", Entry::new(Bytes::from("v2"), 2, origin(1))));
        assert_eq!(shard.get("k").unwrap().0.value, Bytes::from("v2"));
    }

    #[test]
    fn test_version_tie_broken_by_origin() {
        let shard = LocalShard::new();
        assert!(shard.admit_replica("k", Entry::new(Bytes::from("low"), 3, origin(1))));
        assert!(shard.admit_replica("k", Entry::new(Bytes::from("high"), 3, origin(9))));
        assert!(!shard.admit_replica("k", Entry::new(Bytes::from("low"), 3, origin(1))));
        assert_eq!(shard.get("k").unwrap().0.value, Bytes::from("high"));
    }

    #[test]
    fn test_promote_moves_replica_to_primary() {
        let shard = LocalShard::new();
        shard.admit_replica("k", Entry::new(Bytes::from("v"), 1, origin(1)));
        assert_eq!(shard.get("k").unwrap().1, Role::Replica);

        shard.promote("k");
        assert_eq!(shard.get("k").unwrap().1, Role::Primary);
        assert!(shard.replica_items().is_empty());
    }

    #[test]
    fn test_put_clears_replica_shadow() {
        let shard = LocalShard::new();
        shard.admit_replica("k", Entry::new(Bytes::from("old"), 7, origin(1)));
        let e = shard.put_primary("k", Bytes::from("new"), origin(2));
        // version continues past the replica copy
        assert_eq!(e.version, 8);
        assert_eq!(shard.get("k").unwrap(), (e, Role::Primary));
    }

    #[test]
    fn test_keys_with_prefix_dedupes() {
        let shard = LocalShard::new();
        shard.put_primary("job/1/a", Bytes::from("x"), origin(1));
        shard.put_primary("job/1/b", Bytes::from("y"), origin(1));
        shard.put_primary("job/2/a", Bytes::from("z"), origin(1));
        shard.admit_replica("job/1/a", Entry::new(Bytes::from("x"), 1, origin(1)));

        let keys = shard.keys_with_prefix("job/1/");
        assert_eq!(keys, vec!["job/1/a".to_string(), "job/1/b".to_string()]);
    }
}
