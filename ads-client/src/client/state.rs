//! Discovery protocol state machine.
//!
//! Tracks version/nonce per resource type, builds requests, and applies
//! responses to the [`AssignmentCache`]. The state machine never touches the
//! stream: every operation returns the requests it wants sent, and the worker
//! sends them in order. This keeps a single writer on the stream.

use std::collections::HashSet;

use crate::client::cache::AssignmentCache;
use crate::error::Error;
use crate::message::{DiscoveryRequest, DiscoveryResponse, ErrorDetail, Node, ResourceAny};
use crate::resource::{Cluster, ClusterLoadAssignment, Resource, ResourceType};

/// gRPC INVALID_ARGUMENT, carried on NACKs.
const NACK_STATUS_CODE: i32 = 3;

/// Protocol phase of one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Phase {
    /// No request sent yet.
    #[default]
    Uninitialized,
    /// A request is outstanding.
    AwaitingResponse,
    /// A response is being decoded and applied to the cache.
    Applying,
    /// A response was rejected; a NACK is being produced.
    Nacking,
}

/// Per-type protocol state.
#[derive(Debug, Clone, Default)]
struct TypeState {
    phase: Phase,
    /// Version from the last applied response.
    version_info: String,
    /// Nonce from the last processed response (applied or rejected).
    nonce: String,
    /// Names of the current subscription. Empty means all.
    resource_names: Vec<String>,
}

impl TypeState {
    fn transition(&mut self, resource_type: ResourceType, to: Phase) {
        tracing::trace!(%resource_type, from = ?self.phase, ?to, "phase transition");
        self.phase = to;
    }
}

/// A request the state machine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    pub(crate) resource_type: ResourceType,
    pub(crate) resource_names: Vec<String>,
    pub(crate) version_info: String,
    pub(crate) response_nonce: String,
    pub(crate) error_detail: Option<ErrorDetail>,
}

impl PendingRequest {
    /// Borrow this request as a wire-level [`DiscoveryRequest`] for `node`.
    pub(crate) fn as_request<'a>(&'a self, node: &'a Node) -> DiscoveryRequest<'a> {
        DiscoveryRequest {
            version_info: &self.version_info,
            node,
            resource_names: &self.resource_names,
            type_url: self.resource_type.type_url(),
            response_nonce: &self.response_nonce,
            error_detail: self.error_detail.clone(),
        }
    }

    pub(crate) fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}

/// What applying one response did.
#[derive(Debug, Default)]
pub(crate) struct Applied {
    /// Requests to send, in order.
    pub(crate) requests: Vec<PendingRequest>,
    /// Resources decoded and applied.
    pub(crate) accepted: usize,
    /// Resources skipped: undecodable, or naming a cluster the cache does not know.
    pub(crate) skipped: usize,
    /// Clusters removed because the response no longer listed them.
    pub(crate) removed: Vec<String>,
    /// Whether the response was rejected.
    pub(crate) nacked: bool,
}

/// CDS/EDS protocol state and the cache it feeds.
#[derive(Debug)]
pub(crate) struct DiscoveryState {
    cache: AssignmentCache,
    clusters: TypeState,
    endpoints: TypeState,
    remove_missing_clusters: bool,
}

impl DiscoveryState {
    pub(crate) fn new(cache: AssignmentCache, remove_missing_clusters: bool) -> Self {
        Self {
            cache,
            clusters: TypeState::default(),
            endpoints: TypeState::default(),
            remove_missing_clusters,
        }
    }

    fn type_state(&self, resource_type: ResourceType) -> &TypeState {
        match resource_type {
            ResourceType::Cluster => &self.clusters,
            ResourceType::Endpoint => &self.endpoints,
        }
    }

    fn type_state_mut(&mut self, resource_type: ResourceType) -> &mut TypeState {
        match resource_type {
            ResourceType::Cluster => &mut self.clusters,
            ResourceType::Endpoint => &mut self.endpoints,
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self, resource_type: ResourceType) -> Phase {
        self.type_state(resource_type).phase
    }

    pub(crate) fn version_info(&self, resource_type: ResourceType) -> &str {
        &self.type_state(resource_type).version_info
    }

    #[cfg(test)]
    pub(crate) fn nonce(&self, resource_type: ResourceType) -> &str {
        &self.type_state(resource_type).nonce
    }

    /// Build a request carrying the tracked version/nonce for `resource_type`.
    fn build_request(&mut self, resource_type: ResourceType) -> PendingRequest {
        let state = self.type_state_mut(resource_type);
        state.transition(resource_type, Phase::AwaitingResponse);
        PendingRequest {
            resource_type,
            resource_names: state.resource_names.clone(),
            version_info: state.version_info.clone(),
            response_nonce: state.nonce.clone(),
            error_detail: None,
        }
    }

    /// Subscribe to clusters. Empty `names` subscribes to all clusters.
    pub(crate) fn request_clusters(&mut self, names: Vec<String>) -> PendingRequest {
        self.clusters.resource_names = names;
        self.build_request(ResourceType::Cluster)
    }

    /// Subscribe to endpoints of every cluster currently in the cache.
    ///
    /// Returns `None` when no cluster is known, since an empty name list
    /// would subscribe to all assignments.
    pub(crate) fn request_endpoints(&mut self) -> Option<PendingRequest> {
        let names = self.cache.cluster_names();
        if names.is_empty() {
            return None;
        }
        self.endpoints.resource_names = names;
        Some(self.build_request(ResourceType::Endpoint))
    }

    /// Forget per-stream state and produce the requests that open a new stream.
    ///
    /// Nonces are scoped to a stream and are cleared; versions are kept so the
    /// server knows what this client already runs.
    pub(crate) fn restart(&mut self) -> Vec<PendingRequest> {
        for resource_type in ResourceType::ALL {
            let state = self.type_state_mut(resource_type);
            state.nonce.clear();
            state.transition(resource_type, Phase::Uninitialized);
        }

        let names = self.clusters.resource_names.clone();
        let mut requests = vec![self.request_clusters(names)];
        requests.extend(self.request_endpoints());
        requests
    }

    /// Apply a response of any type.
    ///
    /// Responses of unknown types are logged and otherwise ignored: no
    /// request is produced and no state changes.
    pub(crate) fn apply_response(&mut self, response: &DiscoveryResponse) -> Applied {
        match ResourceType::from_type_url(&response.type_url) {
            Some(ResourceType::Cluster) => self.apply_cluster_response(response),
            Some(ResourceType::Endpoint) => self.apply_endpoint_response(response),
            None => {
                tracing::warn!(
                    type_url = %response.type_url,
                    nonce = %response.nonce,
                    "ignoring discovery response of unknown type"
                );
                Applied::default()
            }
        }
    }

    /// Apply a CDS response: register clusters, ack, then re-scope EDS.
    pub(crate) fn apply_cluster_response(&mut self, response: &DiscoveryResponse) -> Applied {
        self.clusters
            .transition(ResourceType::Cluster, Phase::Applying);

        let (clusters, errors) = decode_all::<Cluster>(&response.resources);
        if rejects(&response.resources, &clusters) {
            return self.nack(ResourceType::Cluster, response, errors);
        }

        let mut applied = Applied {
            accepted: clusters.len(),
            skipped: errors.len(),
            ..Default::default()
        };

        let added = self
            .cache
            .register_clusters(clusters.iter().map(|c| c.name()));

        // An undecodable resource may have been a known cluster, so only a
        // fully decoded response is trusted to describe the complete set.
        if self.remove_missing_clusters && errors.is_empty() {
            let keep: HashSet<String> = clusters.iter().map(|c| c.name().to_string()).collect();
            applied.removed = self.cache.retain_clusters(&keep);
            if !applied.removed.is_empty() {
                tracing::info!(removed = ?applied.removed, "removed clusters no longer advertised");
            }
        }

        tracing::debug!(
            version = %response.version_info,
            nonce = %response.nonce,
            resources = response.resources.len(),
            accepted = applied.accepted,
            skipped = applied.skipped,
            added,
            "cluster discovery processed"
        );

        applied.requests.push(self.ack(ResourceType::Cluster, response));
        applied.requests.extend(self.request_endpoints());
        applied
    }

    /// Apply an EDS response: replace endpoint sets of known clusters, then ack.
    pub(crate) fn apply_endpoint_response(&mut self, response: &DiscoveryResponse) -> Applied {
        self.endpoints
            .transition(ResourceType::Endpoint, Phase::Applying);

        let (assignments, errors) = decode_all::<ClusterLoadAssignment>(&response.resources);
        if rejects(&response.resources, &assignments) {
            return self.nack(ResourceType::Endpoint, response, errors);
        }

        let decoded = assignments.len();
        let unknown = self.cache.replace_assignments(assignments);
        if !unknown.is_empty() {
            tracing::debug!(clusters = ?unknown, "skipping assignments for unknown clusters");
        }

        let applied = Applied {
            accepted: decoded - unknown.len(),
            skipped: errors.len() + unknown.len(),
            ..Default::default()
        };

        tracing::debug!(
            version = %response.version_info,
            nonce = %response.nonce,
            resources = response.resources.len(),
            accepted = applied.accepted,
            skipped = applied.skipped,
            "endpoint discovery processed"
        );

        Applied {
            requests: vec![self.ack(ResourceType::Endpoint, response)],
            ..applied
        }
    }

    /// Accept `response`: adopt its version and nonce and echo both.
    fn ack(&mut self, resource_type: ResourceType, response: &DiscoveryResponse) -> PendingRequest {
        let state = self.type_state_mut(resource_type);
        state.version_info = response.version_info.clone();
        state.nonce = response.nonce.clone();
        self.build_request(resource_type)
    }

    /// Reject `response`: keep the applied version, adopt only its nonce.
    fn nack(
        &mut self,
        resource_type: ResourceType,
        response: &DiscoveryResponse,
        errors: Vec<String>,
    ) -> Applied {
        let state = self.type_state_mut(resource_type);
        state.transition(resource_type, Phase::Nacking);
        state.nonce = response.nonce.clone();

        let message = format!(
            "none of {} resources could be decoded: {}",
            response.resources.len(),
            errors.join("; ")
        );
        tracing::warn!(
            %resource_type,
            version = %response.version_info,
            nonce = %response.nonce,
            kept_version = %state.version_info,
            error = %message,
            "rejecting discovery response"
        );

        let mut request = self.build_request(resource_type);
        request.error_detail = Some(ErrorDetail {
            code: NACK_STATUS_CODE,
            message,
        });

        Applied {
            requests: vec![request],
            skipped: errors.len(),
            nacked: true,
            ..Default::default()
        }
    }
}

/// A response is rejected only when it carries resources and none decode.
fn rejects<T>(resources: &[ResourceAny], decoded: &[T]) -> bool {
    !resources.is_empty() && decoded.is_empty()
}

/// Decode every resource as `T`, collecting failures instead of stopping.
fn decode_all<T: Resource>(resources: &[ResourceAny]) -> (Vec<T>, Vec<String>) {
    let mut decoded = Vec::with_capacity(resources.len());
    let mut errors = Vec::new();
    for (index, any) in resources.iter().enumerate() {
        match T::decode(any) {
            Ok(resource) => decoded.push(resource),
            Err(error) => {
                log_skipped(T::TYPE, index, &error);
                errors.push(format!("resource {index}: {error}"));
            }
        }
    }
    (decoded, errors)
}

fn log_skipped(resource_type: ResourceType, index: usize, error: &Error) {
    tracing::debug!(%resource_type, index, %error, "skipping undecodable resource");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::cache::ClusterStatus;
    use crate::resource::{CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, EndpointAddress};
    use crate::testutil::{cds_response, cluster_any, eds_response, garbage_any};

    fn state() -> (DiscoveryState, AssignmentCache) {
        let cache = AssignmentCache::new();
        (DiscoveryState::new(cache.clone(), true), cache)
    }

    #[test]
    fn test_initial_cluster_request_is_empty_wildcard() {
        let (mut state, _) = state();
        assert_eq!(state.phase(ResourceType::Cluster), Phase::Uninitialized);

        let request = state.request_clusters(Vec::new());
        assert_eq!(request.resource_type, ResourceType::Cluster);
        assert!(request.resource_names.is_empty());
        assert_eq!(request.version_info, "");
        assert_eq!(request.response_nonce, "");
        assert!(!request.is_nack());
        assert_eq!(state.phase(ResourceType::Cluster), Phase::AwaitingResponse);

        let node = Node::new("node-1");
        let wire = request.as_request(&node);
        assert_eq!(wire.type_url, CLUSTER_TYPE_URL);
        assert_eq!(wire.node.id, "node-1");
    }

    #[test]
    fn test_cluster_response_acks_then_requests_endpoints() {
        let (mut state, cache) = state();
        state.request_clusters(Vec::new());

        let applied = state.apply_response(&cds_response("v1", "n1", &["a", "b"]));
        assert!(!applied.nacked);
        assert_eq!(applied.accepted, 2);
        assert_eq!(cache.cluster_names(), vec!["a", "b"]);
        assert_eq!(cache.status("a"), ClusterStatus::AwaitingEndpoints);

        assert_eq!(applied.requests.len(), 2);
        let ack = &applied.requests[0];
        assert_eq!(ack.resource_type, ResourceType::Cluster);
        assert_eq!(ack.version_info, "v1");
        assert_eq!(ack.response_nonce, "n1");
        // The ack keeps the wildcard subscription.
        assert!(ack.resource_names.is_empty());

        let eds = &applied.requests[1];
        assert_eq!(eds.resource_type, ResourceType::Endpoint);
        assert_eq!(eds.resource_names, vec!["a", "b"]);
        assert_eq!(eds.version_info, "");
        assert_eq!(eds.response_nonce, "");
        assert_eq!(state.phase(ResourceType::Endpoint), Phase::AwaitingResponse);
    }

    #[test]
    fn test_partial_decode_failure_is_acked() {
        let (mut state, cache) = state();
        let mut response = cds_response("v1", "n1", &["good"]);
        response.resources.push(garbage_any(CLUSTER_TYPE_URL));
        // A well-formed resource of the wrong type counts as a failure too.
        response.resources.push(ResourceAny {
            type_url: ENDPOINT_TYPE_URL.to_string(),
            value: cluster_any("sneaky").value,
        });

        let applied = state.apply_response(&response);
        assert!(!applied.nacked);
        assert_eq!(applied.accepted, 1);
        assert_eq!(applied.skipped, 2);
        assert_eq!(cache.cluster_names(), vec!["good"]);
        assert_eq!(applied.requests[0].version_info, "v1");
        assert_eq!(applied.requests[0].response_nonce, "n1");
        assert!(!applied.requests[0].is_nack());
    }

    #[test]
    fn test_fully_undecodable_response_is_nacked() {
        let (mut state, cache) = state();
        state.apply_response(&cds_response("v1", "n1", &["a"]));

        let mut bad = cds_response("v2", "n2", &[]);
        bad.resources.push(garbage_any(CLUSTER_TYPE_URL));
        let applied = state.apply_response(&bad);

        assert!(applied.nacked);
        assert_eq!(applied.requests.len(), 1, "a nack issues no EDS request");
        let nack = &applied.requests[0];
        assert!(nack.is_nack());
        assert_eq!(nack.version_info, "v1");
        assert_eq!(nack.response_nonce, "n2");
        assert_eq!(nack.error_detail.as_ref().unwrap().code, NACK_STATUS_CODE);

        assert_eq!(state.version_info(ResourceType::Cluster), "v1");
        assert_eq!(state.nonce(ResourceType::Cluster), "n2");
        assert_eq!(state.phase(ResourceType::Cluster), Phase::AwaitingResponse);
        assert_eq!(cache.cluster_names(), vec!["a"]);
    }

    #[test]
    fn test_empty_cluster_response_is_acked_and_clears_clusters() {
        let (mut state, cache) = state();
        state.apply_response(&cds_response("v1", "n1", &["a"]));

        let applied = state.apply_response(&cds_response("v2", "n2", &[]));
        assert!(!applied.nacked);
        assert_eq!(applied.removed, vec!["a"]);
        assert!(cache.is_empty());
        // No clusters left, so no EDS request.
        assert_eq!(applied.requests.len(), 1);
        assert_eq!(applied.requests[0].version_info, "v2");
    }

    #[test]
    fn test_missing_clusters_removed_only_on_clean_response() {
        let (mut state, cache) = state();
        state.apply_response(&cds_response("v1", "n1", &["a", "b", "c"]));

        let mut dirty = cds_response("v2", "n2", &["a"]);
        dirty.resources.push(garbage_any(CLUSTER_TYPE_URL));
        let applied = state.apply_response(&dirty);
        assert!(applied.removed.is_empty());
        assert_eq!(cache.cluster_names(), vec!["a", "b", "c"]);

        let applied = state.apply_response(&cds_response("v3", "n3", &["a", "c"]));
        assert_eq!(applied.removed, vec!["b"]);
        assert_eq!(cache.cluster_names(), vec!["a", "c"]);
        assert_eq!(applied.requests[1].resource_names, vec!["a", "c"]);
    }

    #[test]
    fn test_removal_can_be_disabled() {
        let cache = AssignmentCache::new();
        let mut state = DiscoveryState::new(cache.clone(), false);
        state.apply_response(&cds_response("v1", "n1", &["a", "b"]));
        state.apply_response(&cds_response("v2", "n2", &["c"]));
        assert_eq!(cache.cluster_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cluster_response_keeps_existing_assignment() {
        let (mut state, cache) = state();
        state.apply_response(&cds_response("v1", "n1", &["a"]));
        state.apply_response(&eds_response("e1", "en1", &[("a", &["10.0.0.1:53"])]));

        state.apply_response(&cds_response("v2", "n2", &["a", "b"]));
        assert_eq!(cache.status("a"), ClusterStatus::Ready { endpoints: 1 });
        assert_eq!(cache.status("b"), ClusterStatus::AwaitingEndpoints);
    }

    #[test]
    fn test_endpoint_response_replaces_and_acks() {
        let (mut state, cache) = state();
        state.apply_response(&cds_response("v1", "n1", &["a"]));

        let applied = state.apply_response(&eds_response(
            "e1",
            "en1",
            &[("a", &["10.0.0.1:53", "10.0.0.2:53"])],
        ));
        assert_eq!(applied.accepted, 1);
        assert_eq!(applied.requests.len(), 1);
        let ack = &applied.requests[0];
        assert_eq!(ack.resource_type, ResourceType::Endpoint);
        assert_eq!(ack.version_info, "e1");
        assert_eq!(ack.response_nonce, "en1");
        assert_eq!(ack.resource_names, vec!["a"]);

        state.apply_response(&eds_response("e2", "en2", &[("a", &["10.0.0.3:53"])]));
        let current = cache.assignment("a").unwrap();
        assert_eq!(current.endpoints().len(), 1);
        assert_eq!(
            current.endpoints()[0].address,
            EndpointAddress::new("10.0.0.3", 53)
        );
    }

    #[test]
    fn test_endpoint_response_for_unknown_cluster_is_skipped() {
        let (mut state, cache) = state();
        state.apply_response(&cds_response("v1", "n1", &["a"]));

        let applied = state.apply_response(&eds_response(
            "e1",
            "en1",
            &[("a", &["10.0.0.1:53"]), ("zzz", &["10.9.9.9:53"])],
        ));
        assert!(!applied.nacked);
        assert_eq!(applied.accepted, 1);
        assert_eq!(applied.skipped, 1);
        assert_eq!(cache.status("zzz"), ClusterStatus::Unknown);
        assert_eq!(applied.requests[0].version_info, "e1");
    }

    #[test]
    fn test_endpoint_nack_keeps_version() {
        let (mut state, _) = state();
        state.apply_response(&cds_response("v1", "n1", &["a"]));
        state.apply_response(&eds_response("e1", "en1", &[("a", &["10.0.0.1:53"])]));

        let mut bad = eds_response("e2", "en2", &[]);
        bad.resources.push(garbage_any(ENDPOINT_TYPE_URL));
        let applied = state.apply_response(&bad);

        assert!(applied.nacked);
        let nack = &applied.requests[0];
        assert_eq!(nack.version_info, "e1");
        assert_eq!(nack.response_nonce, "en2");

        // The next accepted response echoes its own version and nonce.
        let applied =
            state.apply_response(&eds_response("e3", "en3", &[("a", &["10.0.0.2:53"])]));
        assert_eq!(applied.requests[0].version_info, "e3");
        assert_eq!(applied.requests[0].response_nonce, "en3");
    }

    #[test]
    fn test_eds_request_carries_tracked_endpoint_version() {
        let (mut state, _) = state();
        state.apply_response(&cds_response("v1", "n1", &["a"]));
        state.apply_response(&eds_response("e1", "en1", &[("a", &["10.0.0.1:53"])]));

        let applied = state.apply_response(&cds_response("v2", "n2", &["a", "b"]));
        let eds = &applied.requests[1];
        assert_eq!(eds.resource_names, vec!["a", "b"]);
        assert_eq!(eds.version_info, "e1");
        assert_eq!(eds.response_nonce, "en1");
    }

    #[test]
    fn test_unknown_type_changes_nothing() {
        let (mut state, cache) = state();
        state.request_clusters(Vec::new());
        let response = DiscoveryResponse {
            version_info: "x".to_string(),
            type_url: "type.googleapis.com/envoy.config.listener.v3.Listener".to_string(),
            nonce: "nx".to_string(),
            resources: vec![cluster_any("a")],
        };

        let applied = state.apply_response(&response);
        assert!(applied.requests.is_empty());
        assert!(!applied.nacked);
        assert!(cache.is_empty());
        for ty in ResourceType::ALL {
            assert_eq!(state.version_info(ty), "");
            assert_eq!(state.nonce(ty), "");
        }
        assert_eq!(state.phase(ResourceType::Cluster), Phase::AwaitingResponse);
        assert_eq!(state.phase(ResourceType::Endpoint), Phase::Uninitialized);
    }

    #[test]
    fn test_restart_clears_nonces_and_resubscribes() {
        let (mut state, _) = state();
        assert_eq!(state.restart().len(), 1, "no clusters known yet");

        state.apply_response(&cds_response("v1", "n1", &["a"]));
        state.apply_response(&eds_response("e1", "en1", &[("a", &["10.0.0.1:53"])]));

        let requests = state.restart();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].resource_type, ResourceType::Cluster);
        assert_eq!(requests[0].version_info, "v1");
        assert_eq!(requests[0].response_nonce, "");
        assert_eq!(requests[1].resource_type, ResourceType::Endpoint);
        assert_eq!(requests[1].version_info, "e1");
        assert_eq!(requests[1].response_nonce, "");
        assert_eq!(requests[1].resource_names, vec!["a"]);
    }
}
