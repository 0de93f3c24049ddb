//! Provides abstraction for transport layers.

use crate::error::Result;
use bytes::Bytes;
use std::future::Future;

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// Factory for ADS streams over one channel to the control plane.
///
/// This abstraction allows for different transport implementations:
/// - Tonic-based gRPC transport
/// - In-memory mock transport for testing
pub trait Transport: Send + Sync + 'static {
    /// The stream type produced by this transport.
    type Stream: TransportStream;

    /// Opens a new bidirectional ADS stream on the channel.
    ///
    /// `initial_requests` are queued before the stream is polled, so servers
    /// that wait for a first request before sending headers do not stall.
    /// This may be called multiple times for reconnection.
    fn new_stream(
        &self,
        initial_requests: Vec<Bytes>,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// A bidirectional byte stream for ADS communication.
///
/// Raw byte transport: (de)serialization of DiscoveryRequest/DiscoveryResponse
/// is handled by the codec at the worker layer.
pub trait TransportStream: Send + 'static {
    /// Send serialized DiscoveryRequest bytes to the server.
    fn send(&mut self, request: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Receive serialized DiscoveryResponse bytes from the server.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Received a response.
    /// - `Ok(None)` - Stream closed normally.
    /// - `Err(_)` - Stream error (connection dropped, etc.)
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}
