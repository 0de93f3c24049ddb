//! A Rust implementation of an [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol)
//! Aggregated Discovery Service (ADS) client.
//!
//! The client opens one bidirectional ADS stream to a control plane, subscribes
//! to every cluster (CDS), then to the endpoint assignments (EDS) of the
//! clusters it learned. It keeps a local cache mapping cluster names to their
//! endpoints and answers [`AdsClient::select`] from that cache without ever
//! touching the network. It handles:
//! - ADS stream management (connection, read retries, reconnection)
//! - Version/nonce tracking and ACK/NACK
//! - Round-robin selection over healthy endpoints
//!
//! It does NOT implement:
//! - LDS or RDS
//! - Incremental (delta) xDS
//! - Load reporting or weighted/locality-aware load balancing
//!
//! # Example
//!
//! ```no_run
//! use ads_client::{AdsClient, ClientConfig, Node};
//!
//! # async fn run() -> ads_client::Result<()> {
//! let config = ClientConfig::new(Node::new("mycoredns"), "127.0.0.1:18000");
//! let client = AdsClient::connect(config).await?;
//!
//! // Empty until the control plane answered.
//! for cluster in client.cluster_names() {
//!     if let Some(endpoint) = client.select(&cluster) {
//!         println!("{cluster} -> {endpoint}");
//!     }
//! }
//!
//! client.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the use of the `tonic` transport. This enables the `rt-tokio` feature. Enabled by default.
//! - `rt-tokio`: Enables the use of the `tokio` runtime. Enabled by default.
//! - `tonic-tls-ring`, `tonic-tls-aws-lc`: TLS support for channels passed to [`TonicTransport::from_channel`].
//! - `test-util`: Exposes the in-memory transport used by this crate's tests.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod resource;
pub mod runtime;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use client::cache::{AssignmentCache, ClusterStatus};
pub use client::config::ClientConfig;
pub use client::retry::{Backoff, RetryPolicy};
pub use client::session::{AdsStream, Session};
pub use client::{AdsClient, AdsClientBuilder};
pub use codec::XdsCodec;
pub use codec::prost::ProstCodec;
pub use error::{Error, Result};
pub use message::{DiscoveryRequest, DiscoveryResponse, ErrorDetail, Node, ResourceAny};
pub use resource::{
    Cluster, ClusterLoadAssignment, Endpoint, EndpointAddress, HealthStatus, Locality, Resource,
    ResourceType,
};
pub use runtime::Runtime;
pub use transport::{Transport, TransportStream};

// Tokio runtime
#[cfg(feature = "rt-tokio")]
pub use runtime::tokio::TokioRuntime;

// Tonic transport
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::{TonicAdsStream, TonicTransport};
