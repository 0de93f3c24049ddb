//! Cluster (CDS) resources.

use bytes::Bytes;
use envoy_types::pb::envoy::config::cluster::v3::Cluster as ClusterProto;
use prost::Message;

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceType};

/// A cluster known from cluster discovery.
///
/// Only the identity is tracked; endpoints arrive separately via EDS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    name: String,
}

impl Cluster {
    /// Create a cluster with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Resource for Cluster {
    const TYPE: ResourceType = ResourceType::Cluster;

    fn decode_value(bytes: Bytes) -> Result<Self> {
        let proto = ClusterProto::decode(bytes)?;
        if proto.name.is_empty() {
            return Err(Error::Validation("cluster name is empty".into()));
        }
        Ok(Self { name: proto.name })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
