//! xDS streaming protocol state machines.
//!
//! Per (stream, type) the server tracks the last nonce sent, the version the
//! client acknowledged, and the requested resource names. The protocol rules:
//!
//! - ACK (matching nonce, no error detail) advances the acknowledged
//!   version; nothing is sent.
//! - NACK (matching nonce, error detail) is logged and the acknowledged
//!   version stays put; the rejected version is *not* resent. The next
//!   snapshot change triggers a fresh response.
//! - A request with a different resource-name set replaces the subscription
//!   and is answered immediately from the current snapshot.
//! - Within a stream, responses for a type are strictly monotonic in the
//!   server's per-type version.
//!
//! The machines are synchronous and channel-free so the protocol rules are
//! unit-testable; `run_sotw_loop`/`run_delta_loop` wire them to gRPC
//! streams with a bounded send channel. When the channel is full the update
//! is coalesced: the type is marked dirty and the latest snapshot is sent
//! once the channel drains.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};
use uuid::Uuid;

use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse, Resource,
};

use crate::xds::cache::XdsCache;
use crate::xds::resources::ResourceUpdate;

/// Per-type bookkeeping for a SotW stream.
#[derive(Debug, Default)]
struct SotwTypeState {
    nonce_sent: Option<String>,
    version_sent: u64,
    version_acked: u64,
    requested: BTreeSet<String>,
    seen_request: bool,
}

/// State-of-the-World protocol machine for one stream.
pub struct SotwMachine {
    cache: Arc<XdsCache>,
    label: Arc<str>,
    types: HashMap<String, SotwTypeState>,
}

impl SotwMachine {
    pub fn new(cache: Arc<XdsCache>, label: &str) -> Self {
        Self { cache, label: Arc::from(label), types: HashMap::new() }
    }

    /// Type URLs this stream has subscribed to.
    pub fn subscribed_types(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    /// Apply one client request; returns the response to send, if any.
    pub fn handle_request(&mut self, request: &DiscoveryRequest) -> Option<DiscoveryResponse> {
        if request.type_url.is_empty() {
            warn!(stream = %self.label, "discovery request without type_url");
            return None;
        }
        let state = self.types.entry(request.type_url.clone()).or_default();

        let mut acked_or_nacked = false;
        if !request.response_nonce.is_empty() {
            if state.nonce_sent.as_deref() == Some(request.response_nonce.as_str()) {
                acked_or_nacked = true;
                match &request.error_detail {
                    None => {
                        state.version_acked = state.version_sent;
                        debug!(
                            stream = %self.label,
                            type_url = %request.type_url,
                            version = state.version_sent,
                            "[ACK] client acknowledged version"
                        );
                    }
                    Some(error_detail) => {
                        warn!(
                            stream = %self.label,
                            type_url = %request.type_url,
                            version = state.version_sent,
                            acked_version = state.version_acked,
                            error_code = error_detail.code,
                            error_message = %error_detail.message,
                            "[NACK] client rejected version; holding until next change"
                        );
                    }
                }
            } else {
                debug!(
                    stream = %self.label,
                    type_url = %request.type_url,
                    nonce = %request.response_nonce,
                    "stale response nonce, ignoring"
                );
            }
        }

        let requested: BTreeSet<String> = request.resource_names.iter().cloned().collect();
        let first_request = !state.seen_request;
        let names_changed = requested != state.requested;
        state.seen_request = true;
        state.requested = requested;

        // Pure ACK/NACK with an unchanged subscription needs no response;
        // a fresh request or a subscription change is answered immediately.
        if acked_or_nacked && !names_changed {
            return None;
        }
        if !first_request && !names_changed && !request.response_nonce.is_empty() {
            return None;
        }

        Some(self.respond(&request.type_url))
    }

    /// React to a snapshot update; returns a response per subscribed type
    /// that is behind the cache.
    pub fn handle_update(&mut self, update: &ResourceUpdate) -> Vec<DiscoveryResponse> {
        let mut responses = Vec::new();
        for delta in &update.deltas {
            if let Some(response) = self.refresh_type(&delta.type_url) {
                responses.push(response);
            }
        }
        responses
    }

    /// Send the latest snapshot of one type if it is newer than what this
    /// stream already sent. Used for both update fan-out and dirty-type
    /// flushes.
    pub fn refresh_type(&mut self, type_url: &str) -> Option<DiscoveryResponse> {
        if !self.types.contains_key(type_url) {
            return None;
        }
        let current = self.cache.type_version(type_url);
        let state = self.types.get(type_url)?;
        if current <= state.version_sent {
            return None;
        }
        Some(self.respond(type_url))
    }

    fn respond(&mut self, type_url: &str) -> DiscoveryResponse {
        let names: HashSet<String> = self
            .types
            .get(type_url)
            .map(|s| s.requested.iter().cloned().collect())
            .unwrap_or_default();
        let resources = self.cache.resources(type_url, &names);
        let version = self.cache.type_version(type_url);
        let nonce = Uuid::new_v4().to_string();

        let state = self.types.entry(type_url.to_string()).or_default();
        state.nonce_sent = Some(nonce.clone());
        state.version_sent = version;

        info!(
            stream = %self.label,
            type_url = %type_url,
            version,
            resource_count = resources.len(),
            "sending discovery response"
        );

        DiscoveryResponse {
            version_info: version.to_string(),
            resources: resources.into_iter().map(|r| r.body).collect(),
            type_url: type_url.to_string(),
            nonce,
            ..Default::default()
        }
    }
}

/// A delta response the client has not acknowledged yet.
#[derive(Debug)]
struct PendingDelta {
    updates: HashMap<String, u64>,
    removed: Vec<String>,
}

#[derive(Debug, Default)]
struct DeltaTypeState {
    /// Resource versions the client is known to hold.
    known: HashMap<String, u64>,
    /// Explicit subscriptions; empty means wildcard.
    subscribed: BTreeSet<String>,
    wildcard: bool,
    /// In-flight responses by nonce; committed on ACK, dropped on NACK.
    pending: HashMap<String, PendingDelta>,
}

/// Incremental protocol machine for one stream.
pub struct DeltaMachine {
    cache: Arc<XdsCache>,
    label: Arc<str>,
    types: HashMap<String, DeltaTypeState>,
}

impl DeltaMachine {
    pub fn new(cache: Arc<XdsCache>, label: &str) -> Self {
        Self { cache, label: Arc::from(label), types: HashMap::new() }
    }

    pub fn handle_request(
        &mut self,
        request: &DeltaDiscoveryRequest,
    ) -> Option<DeltaDiscoveryResponse> {
        if request.type_url.is_empty() {
            warn!(stream = %self.label, "delta discovery request without type_url");
            return None;
        }
        let first_request = !self.types.contains_key(&request.type_url);
        let state = self.types.entry(request.type_url.clone()).or_default();

        if !request.response_nonce.is_empty() {
            match state.pending.remove(&request.response_nonce) {
                Some(pending) => match &request.error_detail {
                    None => {
                        debug!(
                            stream = %self.label,
                            type_url = %request.type_url,
                            nonce = %request.response_nonce,
                            "[ACK] delta acknowledged"
                        );
                        for (name, version) in pending.updates {
                            state.known.insert(name, version);
                        }
                        for name in pending.removed {
                            state.known.remove(&name);
                        }
                    }
                    Some(error_detail) => {
                        warn!(
                            stream = %self.label,
                            type_url = %request.type_url,
                            nonce = %request.response_nonce,
                            error_code = error_detail.code,
                            error_message = %error_detail.message,
                            "[NACK] delta rejected; retaining client versions"
                        );
                    }
                },
                None => {
                    debug!(
                        stream = %self.label,
                        type_url = %request.type_url,
                        nonce = %request.response_nonce,
                        "unknown delta nonce, ignoring"
                    );
                }
            }
        }

        if first_request {
            state.wildcard = request.resource_names_subscribe.is_empty();
            for (name, version) in &request.initial_resource_versions {
                state.known.insert(name.clone(), version.parse().unwrap_or(0));
            }
        }
        for name in &request.resource_names_subscribe {
            state.subscribed.insert(name.clone());
        }
        for name in &request.resource_names_unsubscribe {
            state.subscribed.remove(name);
            state.known.remove(name);
        }

        if first_request || !request.resource_names_subscribe.is_empty() {
            return self.build_delta(&request.type_url);
        }
        None
    }

    pub fn handle_update(&mut self, update: &ResourceUpdate) -> Vec<DeltaDiscoveryResponse> {
        let type_urls: Vec<String> = update
            .deltas
            .iter()
            .map(|d| d.type_url.clone())
            .filter(|t| self.types.contains_key(t))
            .collect();
        type_urls.into_iter().filter_map(|t| self.refresh_type(&t)).collect()
    }

    /// Compute and send Δ = {added ∪ changed} plus removed names against
    /// what the client is known (and pending) to hold.
    pub fn refresh_type(&mut self, type_url: &str) -> Option<DeltaDiscoveryResponse> {
        if !self.types.contains_key(type_url) {
            return None;
        }
        self.build_delta(type_url)
    }

    fn build_delta(&mut self, type_url: &str) -> Option<DeltaDiscoveryResponse> {
        let state = self.types.get_mut(type_url)?;

        let names: HashSet<String> = if state.wildcard {
            HashSet::new()
        } else {
            state.subscribed.iter().cloned().collect()
        };
        let current = self.cache.resources(type_url, &names);

        // Resources the client would hold if every in-flight response were
        // acknowledged; avoids resending while an ACK is on the wire.
        let mut effective: HashMap<String, u64> = state.known.clone();
        for pending in state.pending.values() {
            for (name, version) in &pending.updates {
                effective.insert(name.clone(), *version);
            }
            for name in &pending.removed {
                effective.remove(name);
            }
        }

        let changed: Vec<_> = current
            .iter()
            .filter(|r| effective.get(&r.name).is_none_or(|v| *v < r.version))
            .cloned()
            .collect();

        let current_names: HashSet<&str> = current.iter().map(|r| r.name.as_str()).collect();
        let removed: Vec<String> = effective
            .keys()
            .filter(|name| !current_names.contains(name.as_str()))
            .cloned()
            .collect();

        if changed.is_empty() && removed.is_empty() {
            return None;
        }

        let nonce = Uuid::new_v4().to_string();
        state.pending.insert(
            nonce.clone(),
            PendingDelta {
                updates: changed.iter().map(|r| (r.name.clone(), r.version)).collect(),
                removed: removed.clone(),
            },
        );

        info!(
            stream = %self.label,
            type_url = %type_url,
            added = changed.len(),
            removed = removed.len(),
            "sending delta discovery response"
        );

        Some(DeltaDiscoveryResponse {
            system_version_info: self.cache.version_number().to_string(),
            resources: changed
                .into_iter()
                .map(|cached| Resource {
                    name: cached.name,
                    version: cached.version.to_string(),
                    resource: Some(cached.body),
                    ..Default::default()
                })
                .collect(),
            type_url: type_url.to_string(),
            removed_resources: removed,
            nonce,
            ..Default::default()
        })
    }
}

/// Per-stream send buffer. Small enough that a slow client exercises the
/// coalescing path instead of buffering the world.
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Drive the SotW machine against a gRPC request stream.
pub fn run_sotw_loop<S>(
    cache: Arc<XdsCache>,
    mut in_stream: S,
    label: &'static str,
    token: CancellationToken,
) -> ReceiverStream<std::result::Result<DiscoveryResponse, Status>>
where
    S: futures::Stream<Item = std::result::Result<DiscoveryRequest, Status>>
        + Unpin
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let mut update_rx = cache.subscribe_updates();
    let mut machine = SotwMachine::new(cache, label);

    tokio::spawn(async move {
        // Types whose latest version could not be sent because the channel
        // was full; retried whenever capacity frees up.
        let mut dirty: BTreeSet<String> = BTreeSet::new();

        loop {
            // Flush coalesced types first so a slow client converges on the
            // latest snapshot rather than a backlog.
            while let Some(type_url) = dirty.iter().next().cloned() {
                dirty.remove(&type_url);
                if let Some(response) = machine.refresh_type(&type_url) {
                    match tx.try_send(Ok(response)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            dirty.insert(type_url);
                            break;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!(stream = %label, "stream cancelled by server shutdown");
                    break;
                }
                request = in_stream.next() => match request {
                    Some(Ok(request)) => {
                        if let Some(response) = machine.handle_request(&request) {
                            if tx.send(Ok(response)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Err(status)) => {
                        warn!(stream = %label, error = %status, "error receiving discovery request");
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                    None => {
                        info!(stream = %label, "stream closed by client");
                        break;
                    }
                },
                update = update_rx.recv() => match update {
                    Ok(update) => {
                        for response in machine.handle_update(&update) {
                            let type_url = response.type_url.clone();
                            match tx.try_send(Ok(response)) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    // Coalesce: remember the type, not the
                                    // payload; the flush sends the latest.
                                    dirty.insert(type_url);
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => return,
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(stream = %label, skipped, "lagged behind snapshot updates, resyncing");
                        for type_url in machine.subscribed_types() {
                            dirty.insert(type_url);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    ReceiverStream::new(rx)
}

/// Drive the delta machine against a gRPC request stream.
pub fn run_delta_loop<S>(
    cache: Arc<XdsCache>,
    mut in_stream: S,
    label: &'static str,
    token: CancellationToken,
) -> ReceiverStream<std::result::Result<DeltaDiscoveryResponse, Status>>
where
    S: futures::Stream<Item = std::result::Result<DeltaDiscoveryRequest, Status>>
        + Unpin
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let mut update_rx = cache.subscribe_updates();
    let mut machine = DeltaMachine::new(cache, label);

    tokio::spawn(async move {
        let mut dirty: BTreeSet<String> = BTreeSet::new();

        loop {
            while let Some(type_url) = dirty.iter().next().cloned() {
                dirty.remove(&type_url);
                if let Some(response) = machine.refresh_type(&type_url) {
                    match tx.try_send(Ok(response)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            dirty.insert(type_url);
                            break;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!(stream = %label, "delta stream cancelled by server shutdown");
                    break;
                }
                request = in_stream.next() => match request {
                    Some(Ok(request)) => {
                        if let Some(response) = machine.handle_request(&request) {
                            if tx.send(Ok(response)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Err(status)) => {
                        warn!(stream = %label, error = %status, "error receiving delta request");
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                    None => {
                        info!(stream = %label, "delta stream closed by client");
                        break;
                    }
                },
                update = update_rx.recv() => match update {
                    Ok(update) => {
                        for response in machine.handle_update(&update) {
                            let type_url = response.type_url.clone();
                            match tx.try_send(Ok(response)) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    dirty.insert(type_url);
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => return,
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(stream = %label, skipped, "lagged behind snapshot updates, resyncing");
                        let types: Vec<String> = machine.types.keys().cloned().collect();
                        dirty.extend(types);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::resources::{BuiltResource, CLUSTER_TYPE_URL, LISTENER_TYPE_URL};
    use envoy_types::pb::google::protobuf::Any;
    use envoy_types::pb::google::rpc::Status as RpcStatus;

    fn built(name: &str, payload: &[u8]) -> BuiltResource {
        BuiltResource {
            name: name.to_string(),
            resource: Any { type_url: CLUSTER_TYPE_URL.to_string(), value: payload.to_vec() },
        }
    }

    fn initial_request(type_url: &str) -> DiscoveryRequest {
        DiscoveryRequest { type_url: type_url.to_string(), ..Default::default() }
    }

    fn ack(type_url: &str, response: &DiscoveryResponse) -> DiscoveryRequest {
        DiscoveryRequest {
            type_url: type_url.to_string(),
            version_info: response.version_info.clone(),
            response_nonce: response.nonce.clone(),
            ..Default::default()
        }
    }

    fn nack(type_url: &str, response: &DiscoveryResponse) -> DiscoveryRequest {
        DiscoveryRequest {
            type_url: type_url.to_string(),
            version_info: response.version_info.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: Some(RpcStatus {
                code: 3,
                message: "invalid listener".to_string(),
                details: Vec::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn initial_request_gets_full_snapshot() {
        let cache = Arc::new(XdsCache::new());
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a"), built("c2", b"b")]);
        let mut machine = SotwMachine::new(cache, "test");

        let response = machine.handle_request(&initial_request(CLUSTER_TYPE_URL)).expect("response");
        assert_eq!(response.resources.len(), 2);
        assert_eq!(response.type_url, CLUSTER_TYPE_URL);

        // A pure ACK produces no further response.
        assert!(machine.handle_request(&ack(CLUSTER_TYPE_URL, &response)).is_none());
    }

    #[test]
    fn nack_is_not_resent_until_next_version() {
        let cache = Arc::new(XdsCache::new());
        cache.apply_type(LISTENER_TYPE_URL, vec![built("l1", b"v1")]);
        let mut machine = SotwMachine::new(cache.clone(), "test");

        let v1 = machine.handle_request(&initial_request(LISTENER_TYPE_URL)).expect("v1");

        // NACK of v1: no automatic resend.
        assert!(machine.handle_request(&nack(LISTENER_TYPE_URL, &v1)).is_none());

        // An unrelated no-op update also resends nothing.
        let noop = ResourceUpdate::default();
        assert!(machine.handle_update(&noop).is_empty());

        // The next cache change produces v2; the client ACK then advances.
        let update = cache
            .apply_type(LISTENER_TYPE_URL, vec![built("l1", b"v2")])
            .expect("cache update");
        let responses = machine.handle_update(&update);
        assert_eq!(responses.len(), 1);
        let v2 = &responses[0];
        assert!(v2.version_info.parse::<u64>().unwrap() > v1.version_info.parse::<u64>().unwrap());
        assert!(machine.handle_request(&ack(LISTENER_TYPE_URL, v2)).is_none());
    }

    #[test]
    fn changed_resource_names_trigger_immediate_response() {
        let cache = Arc::new(XdsCache::new());
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a"), built("c2", b"b")]);
        let mut machine = SotwMachine::new(cache, "test");

        let all = machine.handle_request(&initial_request(CLUSTER_TYPE_URL)).expect("response");
        assert_eq!(all.resources.len(), 2);

        // ACK that also narrows the subscription: answered immediately.
        let mut narrowed = ack(CLUSTER_TYPE_URL, &all);
        narrowed.resource_names = vec!["c1".to_string()];
        let response = machine.handle_request(&narrowed).expect("subscription change response");
        assert_eq!(response.resources.len(), 1);
    }

    #[test]
    fn responses_are_monotonic_per_type() {
        let cache = Arc::new(XdsCache::new());
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a")]);
        let mut machine = SotwMachine::new(cache.clone(), "test");

        let first = machine.handle_request(&initial_request(CLUSTER_TYPE_URL)).expect("first");
        let first_version: u64 = first.version_info.parse().unwrap();

        let mut versions = vec![first_version];
        for payload in [&b"b"[..], b"c", b"d"] {
            let update =
                cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", payload)]).expect("update");
            for response in machine.handle_update(&update) {
                versions.push(response.version_info.parse().unwrap());
            }
        }
        assert!(versions.windows(2).all(|w| w[0] < w[1]), "versions not monotonic: {versions:?}");
    }

    #[test]
    fn stale_nonce_is_ignored() {
        let cache = Arc::new(XdsCache::new());
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a")]);
        let mut machine = SotwMachine::new(cache, "test");

        let response = machine.handle_request(&initial_request(CLUSTER_TYPE_URL)).expect("first");
        let mut stale = ack(CLUSTER_TYPE_URL, &response);
        stale.response_nonce = "bogus".to_string();
        // Unknown nonce with unchanged names: no response, no state change.
        assert!(machine.handle_request(&stale).is_none());
    }

    fn delta_initial(type_url: &str) -> DeltaDiscoveryRequest {
        DeltaDiscoveryRequest { type_url: type_url.to_string(), ..Default::default() }
    }

    fn delta_ack(type_url: &str, response: &DeltaDiscoveryResponse) -> DeltaDiscoveryRequest {
        DeltaDiscoveryRequest {
            type_url: type_url.to_string(),
            response_nonce: response.nonce.clone(),
            ..Default::default()
        }
    }

    fn delta_nack(type_url: &str, response: &DeltaDiscoveryResponse) -> DeltaDiscoveryRequest {
        DeltaDiscoveryRequest {
            type_url: type_url.to_string(),
            response_nonce: response.nonce.clone(),
            error_detail: Some(RpcStatus {
                code: 3,
                message: "rejected".to_string(),
                details: Vec::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn delta_sends_only_changes_after_ack() {
        let cache = Arc::new(XdsCache::new());
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a"), built("c2", b"b")]);
        let mut machine = DeltaMachine::new(cache.clone(), "test");

        let initial = machine.handle_request(&delta_initial(CLUSTER_TYPE_URL)).expect("initial");
        assert_eq!(initial.resources.len(), 2);
        assert!(machine.handle_request(&delta_ack(CLUSTER_TYPE_URL, &initial)).is_none());

        // Change one resource: only that one is sent.
        let update = cache
            .apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a2"), built("c2", b"b")])
            .expect("update");
        let responses = machine.handle_update(&update);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].resources.len(), 1);
        assert_eq!(responses[0].resources[0].name, "c1");
        assert!(responses[0].removed_resources.is_empty());
    }

    #[test]
    fn delta_reports_removals_by_name() {
        let cache = Arc::new(XdsCache::new());
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a"), built("c2", b"b")]);
        let mut machine = DeltaMachine::new(cache.clone(), "test");

        let initial = machine.handle_request(&delta_initial(CLUSTER_TYPE_URL)).expect("initial");
        machine.handle_request(&delta_ack(CLUSTER_TYPE_URL, &initial));

        let update = cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a")]).expect("update");
        let responses = machine.handle_update(&update);
        assert_eq!(responses[0].removed_resources, vec!["c2".to_string()]);
        assert!(responses[0].resources.is_empty());
    }

    #[test]
    fn delta_nack_retains_old_versions_for_resend() {
        let cache = Arc::new(XdsCache::new());
        cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a")]);
        let mut machine = DeltaMachine::new(cache.clone(), "test");

        let initial = machine.handle_request(&delta_initial(CLUSTER_TYPE_URL)).expect("initial");
        machine.handle_request(&delta_ack(CLUSTER_TYPE_URL, &initial));

        // v2 is sent and NACKed; the client still holds v1.
        let update = cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a2")]).expect("update");
        let v2 = machine.handle_update(&update).pop().expect("v2 delta");
        assert!(machine.handle_request(&delta_nack(CLUSTER_TYPE_URL, &v2)).is_none());

        // The next change resends c1 because the NACK discarded the pending
        // bookkeeping.
        let update = cache.apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a3")]).expect("update");
        let v3 = machine.handle_update(&update).pop().expect("v3 delta");
        assert_eq!(v3.resources[0].name, "c1");
    }

    #[test]
    fn delta_initial_resource_versions_skip_known_resources() {
        let cache = Arc::new(XdsCache::new());
        let update = cache
            .apply_type(CLUSTER_TYPE_URL, vec![built("c1", b"a"), built("c2", b"b")])
            .expect("seed");
        let version = update.version;
        let mut machine = DeltaMachine::new(cache, "test");

        let mut request = delta_initial(CLUSTER_TYPE_URL);
        request.initial_resource_versions.insert("c1".to_string(), version.to_string());
        let response = machine.handle_request(&request).expect("response");
        // c1 is already held at the current version; only c2 is sent.
        assert_eq!(response.resources.len(), 1);
        assert_eq!(response.resources[0].name, "c2");
    }
}
