//! `tonic` based transport implementation.
//!
//! This transport uses tonic's low-level `Grpc` client with a `BytesCodec`
//! to send and receive raw bytes, allowing the codec layer to handle
//! serialization/deserialization independently.

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportStream};
use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint};
use tonic::{Status, Streaming};

/// The gRPC path for the ADS StreamAggregatedResources RPC.
const ADS_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

const ADS_CHANNEL_BUFFER_SIZE: usize = 16;

/// A codec that passes bytes through without serialization.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Normalizes a control-plane address into a URI tonic accepts.
///
/// Bare `host:port` addresses are treated as plaintext HTTP/2.
fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Factory for creating ADS streams using tonic.
#[derive(Clone, Debug)]
pub struct TonicTransport {
    channel: Channel,
}

impl TonicTransport {
    /// Create a transport from an existing tonic [`Channel`].
    ///
    /// Channel credentials are the caller's concern; build the channel with
    /// whatever TLS configuration the control plane requires.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tonic::transport::{Certificate, Channel, ClientTlsConfig};
    ///
    /// let tls = ClientTlsConfig::new()
    ///     .ca_certificate(Certificate::from_pem(ca_cert))
    ///     .domain_name("xds.example.com");
    ///
    /// let channel = Channel::from_static("https://xds.example.com:443")
    ///     .tls_config(tls)?
    ///     .connect()
    ///     .await?;
    ///
    /// let transport = TonicTransport::from_channel(channel);
    /// ```
    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    /// Connect to a control plane with default settings.
    ///
    /// `address` is either a full URI or a bare `host:port`. Fails with
    /// [`Error::Connection`] if the address is invalid or unreachable; no
    /// retries are attempted.
    pub async fn connect(address: impl AsRef<str>) -> Result<Self> {
        let uri = endpoint_uri(address.as_ref());
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| Error::Connection(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self { channel })
    }
}

impl Transport for TonicTransport {
    type Stream = TonicAdsStream;

    async fn new_stream(&self, initial_requests: Vec<Bytes>) -> Result<Self::Stream> {
        let mut grpc = Grpc::new(self.channel.clone());

        grpc.ready()
            .await
            .map_err(|e| Error::Stream(format!("channel not ready: {e}")))?;

        let (tx, rx) = mpsc::channel::<Bytes>(ADS_CHANNEL_BUFFER_SIZE);

        // Initial requests go first so the server has something to answer
        // before it sends response headers.
        let initial_stream = tokio_stream::iter(initial_requests);
        let channel_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let request_stream = initial_stream.chain(channel_stream);

        let path = PathAndQuery::from_static(ADS_PATH);

        let response = grpc
            .streaming(tonic::Request::new(request_stream), path, BytesCodec)
            .await
            .map_err(|status| Error::Stream(status.to_string()))?;

        Ok(TonicAdsStream {
            sender: tx,
            receiver: response.into_inner(),
        })
    }
}

/// A bidirectional ADS stream backed by tonic.
#[derive(Debug)]
pub struct TonicAdsStream {
    sender: mpsc::Sender<Bytes>,
    receiver: Streaming<Bytes>,
}

impl TransportStream for TonicAdsStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::StreamClosed)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.receiver.message().await {
            Ok(msg) => Ok(msg),
            Err(status) => Err(Error::Stream(status.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::XdsCodec;
    use crate::codec::prost::ProstCodec;
    use crate::message::Node;
    use crate::resource::{CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL};
    use envoy_types::pb::envoy::service::discovery::v3::{
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
    };
    use std::net::SocketAddr;
    use std::pin::Pin;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tokio_stream::{Stream, StreamExt as _};
    use tonic::{Request, Response};

    /// How the mock control plane treats a new stream.
    #[derive(Clone, Copy)]
    enum Behavior {
        /// Answer each request with an empty response of its type, nonce = node id + type.
        Answer,
        /// Refuse the stream before sending headers.
        Refuse,
    }

    struct MockControlPlane(Behavior);

    #[tonic::async_trait]
    impl AggregatedDiscoveryService for MockControlPlane {
        type StreamAggregatedResourcesStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;

        async fn stream_aggregated_resources(
            &self,
            request: Request<tonic::Streaming<DiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
            if let Behavior::Refuse = self.0 {
                return Err(Status::permission_denied("node not allowed"));
            }
            let mut inbound = request.into_inner();

            let outbound = async_stream::try_stream! {
                while let Some(request) = inbound.next().await {
                    let request = request?;
                    let node = request.node.map(|n| n.id).unwrap_or_default();
                    yield DiscoveryResponse {
                        version_info: "1".to_string(),
                        nonce: format!("{node}/{}", request.type_url),
                        type_url: request.type_url,
                        ..Default::default()
                    };
                }
            };

            Ok(Response::new(Box::pin(outbound)))
        }

        type DeltaAggregatedResourcesStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

        async fn delta_aggregated_resources(
            &self,
            _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
            Err(Status::unimplemented("delta xDS is not served"))
        }
    }

    async fn start_control_plane(behavior: Behavior) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(AggregatedDiscoveryServiceServer::new(MockControlPlane(
                    behavior,
                )))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        addr
    }

    fn request(node: &Node, type_url: &str) -> Bytes {
        let request = crate::message::DiscoveryRequest {
            version_info: "",
            node,
            resource_names: &[],
            type_url,
            response_nonce: "",
            error_detail: None,
        };
        ProstCodec.encode_request(&request).unwrap()
    }

    #[test]
    fn test_endpoint_uri() {
        assert_eq!(endpoint_uri("127.0.0.1:18000"), "http://127.0.0.1:18000");
        assert_eq!(endpoint_uri("[::1]:18000"), "http://[::1]:18000");
        assert_eq!(endpoint_uri("https://xds.example.com"), "https://xds.example.com");
    }

    #[tokio::test]
    async fn test_initial_and_later_requests_are_answered_in_order() {
        let addr = start_control_plane(Behavior::Answer).await;
        let transport = TonicTransport::connect(addr.to_string()).await.unwrap();
        let node = Node::new("coredns-1");

        let mut stream = transport
            .new_stream(vec![request(&node, CLUSTER_TYPE_URL)])
            .await
            .unwrap();

        let response = ProstCodec
            .decode_response(stream.recv().await.unwrap().unwrap())
            .unwrap();
        assert_eq!(response.type_url, CLUSTER_TYPE_URL);
        assert_eq!(response.nonce, format!("coredns-1/{CLUSTER_TYPE_URL}"));
        assert!(response.resources.is_empty());

        stream
            .send(request(&node, ENDPOINT_TYPE_URL))
            .await
            .unwrap();
        let response = ProstCodec
            .decode_response(stream.recv().await.unwrap().unwrap())
            .unwrap();
        assert_eq!(response.type_url, ENDPOINT_TYPE_URL);
    }

    #[tokio::test]
    async fn test_refused_stream_is_a_stream_error() {
        let addr = start_control_plane(Behavior::Refuse).await;
        let transport = TonicTransport::connect(addr.to_string()).await.unwrap();

        let err = transport
            .new_stream(vec![request(&Node::new("intruder"), CLUSTER_TYPE_URL)])
            .await
            .unwrap_err();
        match err {
            Error::Stream(message) => assert!(message.contains("node not allowed"), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        // Bind and immediately drop to get a port nothing listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = TonicTransport::connect(addr.to_string()).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_connect_invalid_address() {
        let err = TonicTransport::connect("not a uri").await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "{err:?}");
    }
}
