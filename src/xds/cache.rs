//! Versioned per-type resource stores with atomic staged publication.
//!
//! All five stores are staged under their write locks before the aggregate
//! version advances, so for any observable snapshot version the clusters
//! referenced by routes are present and the load assignments needed by
//! clusters are present. Per-type locks keep snapshot reads of one type
//! concurrent with updates of another; staged applications take the locks in
//! the fixed `TYPE_URLS` order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use super::resources::{
    BuiltResource, CachedResource, ResourceDelta, ResourceUpdate, TYPE_URLS,
};

/// Shared xDS cache: the single source of truth streams serve from.
#[derive(Debug)]
pub struct XdsCache {
    version: AtomicU64,
    stores: BTreeMap<&'static str, RwLock<HashMap<String, CachedResource>>>,
    /// Version at which each type last changed; input to the aggregate hash.
    type_versions: RwLock<BTreeMap<&'static str, u64>>,
    update_tx: broadcast::Sender<ResourceUpdate>,
}

impl Default for XdsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl XdsCache {
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(128);
        Self {
            version: AtomicU64::new(1),
            stores: TYPE_URLS.iter().map(|url| (*url, RwLock::new(HashMap::new()))).collect(),
            type_versions: RwLock::new(TYPE_URLS.iter().map(|url| (*url, 0u64)).collect()),
            update_tx,
        }
    }

    pub fn version_number(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Version at which `type_url` last changed.
    pub fn type_version(&self, type_url: &str) -> u64 {
        self.type_versions
            .read()
            .expect("type version lock poisoned")
            .get(type_url)
            .copied()
            .unwrap_or(0)
    }

    /// Aggregate snapshot version: a content hash over the per-type version
    /// strings, in serving order.
    pub fn snapshot_version(&self) -> String {
        let versions = self.type_versions.read().expect("type version lock poisoned");
        let mut hasher = Sha256::new();
        for url in TYPE_URLS {
            hasher.update(url.as_bytes());
            hasher.update(versions.get(url).copied().unwrap_or(0).to_be_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }

    /// Stage new contents for several types at once and advance the version
    /// exactly once. Types absent from `staged` keep their contents. Returns
    /// the update when anything changed.
    #[instrument(skip(self, staged), fields(staged_types = staged.len()), name = "xds_apply_snapshot")]
    pub fn apply_snapshot(
        &self,
        staged: BTreeMap<&'static str, Vec<BuiltResource>>,
    ) -> Option<ResourceUpdate> {
        // Locks are taken in TYPE_URLS order and held until every store is
        // consistent with the new version.
        let mut guards = Vec::new();
        for url in TYPE_URLS {
            if staged.contains_key(url) {
                guards.push((url, self.stores[url].write().expect("xds store lock poisoned")));
            }
        }

        let mut pending: Vec<(&'static str, Vec<BuiltResource>, Vec<String>)> = Vec::new();
        for (url, guard) in &guards {
            let incoming = &staged[*url];
            let incoming_names: HashSet<&str> =
                incoming.iter().map(|r| r.name.as_str()).collect();

            let removed: Vec<String> = guard
                .keys()
                .filter(|name| !incoming_names.contains(name.as_str()))
                .cloned()
                .collect();

            let changed: Vec<BuiltResource> = incoming
                .iter()
                .filter(|built| match guard.get(&built.name) {
                    Some(existing) => existing.body != built.resource,
                    None => true,
                })
                .cloned()
                .collect();

            if !changed.is_empty() || !removed.is_empty() {
                pending.push((*url, changed, removed));
            }
        }

        if pending.is_empty() {
            return None;
        }

        let new_version = self.version.fetch_add(1, Ordering::Relaxed) + 1;

        let mut deltas = Vec::new();
        {
            let mut type_versions =
                self.type_versions.write().expect("type version lock poisoned");
            for (url, changed, removed) in pending {
                let (_, guard) = guards
                    .iter_mut()
                    .find(|(guard_url, _)| *guard_url == url)
                    .expect("staged type has a guard");

                for name in &removed {
                    guard.remove(name);
                }

                let mut delta = ResourceDelta {
                    type_url: url.to_string(),
                    added_or_updated: Vec::new(),
                    removed,
                };
                for built in changed {
                    let cached = CachedResource {
                        name: built.name.clone(),
                        type_url: url.to_string(),
                        version: new_version,
                        body: built.resource,
                    };
                    guard.insert(built.name, cached.clone());
                    delta.added_or_updated.push(cached);
                }
                type_versions.insert(url, new_version);
                deltas.push(delta);
            }
        }

        drop(guards);

        let update = ResourceUpdate {
            version: new_version,
            snapshot_version: self.snapshot_version(),
            deltas,
        };

        debug!(
            version = new_version,
            snapshot_version = %update.snapshot_version,
            types = update.deltas.len(),
            "applied staged snapshot"
        );

        let _ = self.update_tx.send(update.clone());
        Some(update)
    }

    /// Convenience wrapper for a single-type application (the EDS fast
    /// path).
    pub fn apply_type(
        &self,
        type_url: &'static str,
        built: Vec<BuiltResource>,
    ) -> Option<ResourceUpdate> {
        let mut staged = BTreeMap::new();
        staged.insert(type_url, built);
        self.apply_snapshot(staged)
    }

    /// Snapshot of the cached resources for one type, name-sorted for
    /// deterministic responses. An empty `names` filter means all.
    pub fn resources(&self, type_url: &str, names: &HashSet<String>) -> Vec<CachedResource> {
        let Some(store) = self.stores.get(type_url) else { return Vec::new() };
        let guard = store.read().expect("xds store lock poisoned");
        let mut resources: Vec<CachedResource> = guard
            .values()
            .filter(|r| names.is_empty() || names.contains(&r.name))
            .cloned()
            .collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        resources
    }

    /// Resources of one type whose version is newer than `known_version`,
    /// honouring the name filter. This is the one-shot half of the watch
    /// contract; the broadcast subscription is the continuation.
    pub fn resources_newer_than(
        &self,
        type_url: &str,
        names: &HashSet<String>,
        known_version: u64,
    ) -> Vec<CachedResource> {
        self.resources(type_url, names)
            .into_iter()
            .filter(|r| r.version > known_version)
            .collect()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ResourceUpdate> {
        self.update_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::super::resources::{CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, ROUTE_TYPE_URL};
    use super::*;
    use envoy_types::pb::google::protobuf::Any;

    fn built(name: &str, payload: &[u8]) -> BuiltResource {
        BuiltResource {
            name: name.to_string(),
            resource: Any { type_url: CLUSTER_TYPE_URL.to_string(), value: payload.to_vec() },
        }
    }

    #[test]
    fn staged_apply_advances_version_once() {
        let cache = XdsCache::new();
        let before = cache.version_number();

        let mut staged = BTreeMap::new();
        staged.insert(CLUSTER_TYPE_URL, vec![built("c1", b"a")]);
        staged.insert(ENDPOINT_TYPE_URL, vec![built("c1", b"eds")]);
        let update = cache.apply_snapshot(staged).expect("update");

        assert_eq!(update.version, before + 1);
        assert_eq!(cache.version_number(), before + 1);
        assert_eq!(update.deltas.len(), 2);
        assert_eq!(cache.type_version(CLUSTER_TYPE_URL), before + 1);
        assert_eq!(cache.type_version(ENDPOINT_TYPE_URL), before + 1);
        // Untouched types stay at zero.
        assert_eq!(cache.type_version(ROUTE_TYPE_URL), 0);
    }

    #[test]
    fn unchanged_apply_is_a_noop() {
        let cache = XdsCache::new();
        assert!(cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a")]).is_some());
        let version = cache.version_number();
        let snapshot = cache.snapshot_version();

        assert!(cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a")]).is_none());
        assert_eq!(cache.version_number(), version);
        assert_eq!(cache.snapshot_version(), snapshot);
    }

    #[test]
    fn removal_produces_removed_names() {
        let cache = XdsCache::new();
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a"), built("c2", b"b")]);
        let update = cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a")]).expect("update");
        assert_eq!(update.deltas[0].removed, vec!["c2".to_string()]);
        assert!(update.deltas[0].added_or_updated.is_empty());
        assert_eq!(cache.resources(CLUSTER_TYPE_URL, &HashSet::new()).len(), 1);
    }

    #[test]
    fn endpoint_only_update_leaves_other_type_versions_alone() {
        let cache = XdsCache::new();
        let mut staged = BTreeMap::new();
        staged.insert(CLUSTER_TYPE_URL, vec![built("c1", b"a")]);
        staged.insert(ENDPOINT_TYPE_URL, vec![built("c1", b"2-endpoints")]);
        cache.apply_snapshot(staged);
        let cds_version = cache.type_version(CLUSTER_TYPE_URL);
        let snapshot_before = cache.snapshot_version();

        let update =
            cache.apply_type(ENDPOINT_TYPE_URL, vec![built("c1", b"3-endpoints")]).expect("update");
        assert_eq!(update.deltas.len(), 1);
        assert_eq!(update.deltas[0].type_url, ENDPOINT_TYPE_URL);
        assert_eq!(cache.type_version(CLUSTER_TYPE_URL), cds_version);
        assert!(cache.type_version(ENDPOINT_TYPE_URL) > cds_version);
        assert_ne!(cache.snapshot_version(), snapshot_before);
    }

    #[test]
    fn resources_newer_than_filters_by_version_and_name() {
        let cache = XdsCache::new();
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a")]);
        let first = cache.version_number();
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a"), built("c2", b"b")]);

        let newer = cache.resources_newer_than(CLUSTER_TYPE_URL, &HashSet::new(), first);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].name, "c2");

        let mut names = HashSet::new();
        names.insert("c1".to_string());
        let filtered = cache.resources(CLUSTER_TYPE_URL, &names);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "c1");
    }

    #[tokio::test]
    async fn updates_broadcast_to_subscribers() {
        let cache = XdsCache::new();
        let mut rx = cache.subscribe_updates();
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a")]);
        let update = rx.recv().await.expect("broadcast update");
        assert_eq!(update.deltas[0].added_or_updated.len(), 1);
    }
}
