//! Provides abstraction for the xDS resources this client understands.

use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::ResourceAny;

pub mod cluster;
pub mod endpoint;

pub use cluster::Cluster;
pub use endpoint::{ClusterLoadAssignment, Endpoint, EndpointAddress, HealthStatus, Locality};

/// Type URL of Cluster resources.
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

/// Type URL of ClusterLoadAssignment resources.
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// The resource types carried on the aggregated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Cluster discovery (CDS).
    Cluster,
    /// Endpoint discovery (EDS).
    Endpoint,
}

impl ResourceType {
    /// All resource types, in the order they are subscribed on a new stream.
    pub const ALL: [ResourceType; 2] = [ResourceType::Cluster, ResourceType::Endpoint];

    /// The well-known type URL for this resource type.
    pub const fn type_url(self) -> &'static str {
        match self {
            ResourceType::Cluster => CLUSTER_TYPE_URL,
            ResourceType::Endpoint => ENDPOINT_TYPE_URL,
        }
    }

    /// Look up the resource type for a type URL.
    ///
    /// Returns `None` for type URLs this client does not handle.
    pub fn from_type_url(type_url: &str) -> Option<Self> {
        match type_url {
            CLUSTER_TYPE_URL => Some(ResourceType::Cluster),
            ENDPOINT_TYPE_URL => Some(ResourceType::Endpoint),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cluster => f.write_str("CDS"),
            ResourceType::Endpoint => f.write_str("EDS"),
        }
    }
}

/// Trait for decoded xDS resources.
///
/// # Validation
///
/// `decode_value` should parse the raw bytes and validate the result,
/// returning `Err` if either step fails. [`Resource::decode`] additionally
/// rejects resources whose Any wrapper names a different type.
pub trait Resource: Send + Sync + Clone + fmt::Debug + Sized + 'static {
    /// The resource type this resource is delivered as.
    const TYPE: ResourceType;

    /// Decode and validate a resource from its serialized bytes.
    fn decode_value(bytes: Bytes) -> Result<Self>;

    /// Returns the resource name.
    ///
    /// The resource name combined with the type URL uniquely identifies a resource.
    fn name(&self) -> &str;

    /// Decode a resource from its Any wrapper, checking the declared type first.
    fn decode(resource: &ResourceAny) -> Result<Self> {
        let expected = Self::TYPE.type_url();
        if resource.type_url != expected {
            return Err(Error::TypeMismatch {
                expected,
                actual: resource.type_url.clone(),
            });
        }
        Self::decode_value(resource.value.clone())
    }
}
