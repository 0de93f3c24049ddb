//! Crate-owned xDS message types.
//!
//! These types are codegen-agnostic and serve as the interface between
//! the discovery logic and the codec layer. The codec converts these
//! to/from the wire format (prost/envoy-types).

use bytes::Bytes;

/// A discovery request to send to the ADS server.
///
/// Borrows from the protocol state that produced it, so building one never
/// copies the subscribed resource names.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest<'a> {
    /// The version_info provided in the most recent successfully applied
    /// response for this type, or empty for the first request.
    pub version_info: &'a str,
    /// The node making the request.
    pub node: &'a Node,
    /// List of resource names to subscribe to. Empty means all resources.
    pub resource_names: &'a [String],
    /// Type URL of the resource being requested.
    pub type_url: &'a str,
    /// The nonce from the most recent response processed for this type,
    /// or empty for the first request on a stream.
    pub response_nonce: &'a str,
    /// Error details if this is a NACK (negative acknowledgment).
    pub error_detail: Option<ErrorDetail>,
}

impl DiscoveryRequest<'_> {
    /// Returns true if this request rejects the response it answers.
    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}

/// A discovery response from the ADS server.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResponse {
    /// The version of the response data.
    pub version_info: String,
    /// The response resources wrapped as Any protos.
    pub resources: Vec<ResourceAny>,
    /// Type URL of the resources.
    pub type_url: String,
    /// Nonce for this response, to be echoed back in the next request.
    pub nonce: String,
}

/// A resource wrapped as google.protobuf.Any.
#[derive(Debug, Clone)]
pub struct ResourceAny {
    /// Type URL of the resource.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

/// Node identification for the client.
///
/// The id is opaque to this crate and forwarded verbatim on every request.
#[derive(Debug, Clone)]
pub struct Node {
    /// An opaque node identifier.
    pub id: String,
    /// The cluster the node belongs to.
    pub cluster: Option<String>,
    /// Free-form string identifying the client type.
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
}

impl Node {
    /// Create a new Node with the given identifier.
    ///
    /// The user agent defaults to this crate's name and version.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cluster: None,
            user_agent_name: env!("CARGO_PKG_NAME").to_string(),
            user_agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Set the user agent name and version.
    pub fn with_user_agent(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.user_agent_name = name.into();
        self.user_agent_version = version.into();
        self
    }
}

/// Error details for NACK requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}
