//! Test utilities: an in-memory transport and discovery message builders.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use envoy_types::pb::envoy::config::cluster::v3::Cluster as ClusterProto;
use envoy_types::pb::envoy::config::core::v3::{Address, SocketAddress, address, socket_address};
use envoy_types::pb::envoy::config::endpoint::v3::{
    ClusterLoadAssignment as ClusterLoadAssignmentProto, Endpoint as EndpointProto, LbEndpoint,
    LocalityLbEndpoints, lb_endpoint::HostIdentifier,
};
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::{DiscoveryResponse, ResourceAny};
use crate::resource::{CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL};
use crate::transport::{Transport, TransportStream};

/// Create a connected pair of mock transport and the server side controlling it.
pub fn mock_transport() -> (MockTransport, MockServer) {
    let (streams_tx, streams_rx) = mpsc::unbounded_channel();
    let failures = Arc::new(AtomicUsize::new(0));
    (
        MockTransport {
            streams_tx,
            failures: Arc::clone(&failures),
        },
        MockServer {
            streams_rx,
            failures,
        },
    )
}

/// A [`Transport`] whose streams are driven by a [`MockServer`].
#[derive(Debug)]
pub struct MockTransport {
    streams_tx: mpsc::UnboundedSender<MockStreamHandle>,
    failures: Arc<AtomicUsize>,
}

/// The server side of a [`MockTransport`].
#[derive(Debug)]
pub struct MockServer {
    streams_rx: mpsc::UnboundedReceiver<MockStreamHandle>,
    failures: Arc<AtomicUsize>,
}

impl MockServer {
    /// Wait for the client to open its next stream.
    pub async fn next_stream(&mut self) -> MockStreamHandle {
        self.streams_rx
            .recv()
            .await
            .expect("mock transport dropped")
    }

    /// Make the next `count` stream opens fail.
    pub fn fail_next_streams(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    type Stream = MockStream;

    async fn new_stream(&self, initial_requests: Vec<Bytes>) -> Result<Self::Stream> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Stream("mock stream refused".into()));
        }

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let send_failures = Arc::new(AtomicUsize::new(0));
        for request in initial_requests {
            let _ = requests_tx.send(request);
        }

        self.streams_tx
            .send(MockStreamHandle {
                requests: requests_rx,
                responses: Some(responses_tx),
                send_failures: Arc::clone(&send_failures),
            })
            .map_err(|_| Error::Connection("mock server dropped".into()))?;

        Ok(MockStream {
            requests: requests_tx,
            responses: responses_rx,
            send_failures,
        })
    }
}

/// Client side of a mock stream.
#[derive(Debug)]
pub struct MockStream {
    requests: mpsc::UnboundedSender<Bytes>,
    responses: mpsc::UnboundedReceiver<Result<Bytes>>,
    send_failures: Arc<AtomicUsize>,
}

impl TransportStream for MockStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        let failing = self
            .send_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Stream("mock send failed".into()));
        }
        self.requests.send(request).map_err(|_| Error::StreamClosed)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.responses.recv().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }
}

/// Server side of a mock stream.
#[derive(Debug)]
pub struct MockStreamHandle {
    requests: mpsc::UnboundedReceiver<Bytes>,
    responses: Option<mpsc::UnboundedSender<Result<Bytes>>>,
    send_failures: Arc<AtomicUsize>,
}

impl MockStreamHandle {
    /// Make the client's next `count` sends fail. Failed requests are dropped.
    pub fn fail_next_sends(&self, count: usize) {
        self.send_failures.store(count, Ordering::SeqCst);
    }

    /// Wait for the next request the client sends, decoded.
    ///
    /// Returns `None` once the client dropped its side of the stream.
    pub async fn next_request(&mut self) -> Option<discovery::DiscoveryRequest> {
        let bytes = self.requests.recv().await?;
        Some(discovery::DiscoveryRequest::decode(bytes).expect("client sent garbage"))
    }

    /// Returns a request if one is already queued, without waiting.
    pub fn try_next_request(&mut self) -> Option<discovery::DiscoveryRequest> {
        let bytes = self.requests.try_recv().ok()?;
        Some(discovery::DiscoveryRequest::decode(bytes).expect("client sent garbage"))
    }

    /// Deliver a response to the client.
    pub fn respond(&self, response: &DiscoveryResponse) {
        self.send_raw(encode_response(response));
    }

    /// Deliver raw bytes to the client.
    pub fn send_raw(&self, bytes: Bytes) {
        if let Some(tx) = &self.responses {
            let _ = tx.send(Ok(bytes));
        }
    }

    /// Make the client's next read fail.
    pub fn fail_read(&self, message: &str) {
        if let Some(tx) = &self.responses {
            let _ = tx.send(Err(Error::Stream(message.to_string())));
        }
    }

    /// Close the server half; the client reads end-of-stream.
    pub fn close(&mut self) {
        self.responses = None;
    }
}

/// Encode a crate-owned response in its wire format.
pub fn encode_response(response: &DiscoveryResponse) -> Bytes {
    discovery::DiscoveryResponse {
        version_info: response.version_info.clone(),
        type_url: response.type_url.clone(),
        nonce: response.nonce.clone(),
        resources: response
            .resources
            .iter()
            .map(|r| Any {
                type_url: r.type_url.clone(),
                value: r.value.to_vec(),
            })
            .collect(),
        ..Default::default()
    }
    .encode_to_vec()
    .into()
}

/// A Cluster resource named `name`.
pub fn cluster_any(name: &str) -> ResourceAny {
    ResourceAny {
        type_url: CLUSTER_TYPE_URL.to_string(),
        value: ClusterProto {
            name: name.to_string(),
            ..Default::default()
        }
        .encode_to_vec()
        .into(),
    }
}

/// A ClusterLoadAssignment resource for `cluster` with one endpoint per address.
pub fn assignment_any(cluster: &str, addrs: &[&str]) -> ResourceAny {
    let lb_endpoints = addrs
        .iter()
        .map(|addr| {
            let addr: SocketAddr = addr.parse().expect("invalid socket address");
            LbEndpoint {
                host_identifier: Some(HostIdentifier::Endpoint(EndpointProto {
                    address: Some(Address {
                        address: Some(address::Address::SocketAddress(SocketAddress {
                            address: addr.ip().to_string(),
                            port_specifier: Some(socket_address::PortSpecifier::PortValue(
                                u32::from(addr.port()),
                            )),
                            ..Default::default()
                        })),
                        ..Default::default()
                    }),
                    ..Default::default()
                })),
                ..Default::default()
            }
        })
        .collect();

    ResourceAny {
        type_url: ENDPOINT_TYPE_URL.to_string(),
        value: ClusterLoadAssignmentProto {
            cluster_name: cluster.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints,
                ..Default::default()
            }],
            ..Default::default()
        }
        .encode_to_vec()
        .into(),
    }
}

/// A resource of the given type whose bytes do not decode.
pub fn garbage_any(type_url: &str) -> ResourceAny {
    ResourceAny {
        type_url: type_url.to_string(),
        value: Bytes::from_static(&[0xff, 0xff, 0xff]),
    }
}

/// A CDS response listing `clusters`.
pub fn cds_response(version: &str, nonce: &str, clusters: &[&str]) -> DiscoveryResponse {
    DiscoveryResponse {
        version_info: version.to_string(),
        type_url: CLUSTER_TYPE_URL.to_string(),
        nonce: nonce.to_string(),
        resources: clusters.iter().map(|name| cluster_any(name)).collect(),
    }
}

/// An EDS response with one assignment per `(cluster, addresses)` pair.
pub fn eds_response(
    version: &str,
    nonce: &str,
    assignments: &[(&str, &[&str])],
) -> DiscoveryResponse {
    DiscoveryResponse {
        version_info: version.to_string(),
        type_url: ENDPOINT_TYPE_URL.to_string(),
        nonce: nonce.to_string(),
        resources: assignments
            .iter()
            .map(|(cluster, addrs)| assignment_any(cluster, addrs))
            .collect(),
    }
}
