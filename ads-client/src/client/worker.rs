//! ADS worker that manages the xDS stream.
//!
//! The worker runs as a background task, managing:
//! - The receive loop on the current ADS stream
//! - Read retries and stream re-establishment
//! - ACK/NACK of every processed response
//!
//! The worker is the only writer on the stream and the only writer of the
//! assignment cache. It stops once its session is closed.

use bytes::Bytes;

use crate::client::retry::{Backoff, RetryPolicy};
use crate::client::session::{AdsStream, Session};
use crate::client::state::{DiscoveryState, PendingRequest};
use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::message::Node;
use crate::resource::ResourceType;
use crate::runtime::Runtime;
use crate::transport::Transport;

/// Why a receive loop ended.
#[derive(Debug)]
enum StreamEnd {
    /// The session was closed; the worker should exit.
    Cancelled,
    /// The stream is unusable and a new one should be opened.
    Reconnect(Error),
}

/// The ADS worker drives the stream and feeds the assignment cache.
pub(crate) struct AdsWorker<T: Transport, C, R> {
    /// Session owning the channel and the cancellation token.
    session: Session<T>,
    /// Codec for encoding/decoding messages.
    codec: C,
    /// Runtime for sleeping between retries.
    runtime: R,
    /// Node identification.
    node: Node,
    /// Protocol state and the cache it writes.
    state: DiscoveryState,
    /// Policy for failed reads on one stream. A fresh backoff per stream.
    read_retry: RetryPolicy,
    /// Backoff between stream re-establishment attempts.
    reconnect: Backoff,
}

impl<T, C, R> std::fmt::Debug for AdsWorker<T, C, R>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdsWorker")
            .field("node", &self.node.id)
            .field("state", &self.state)
            .field("reconnect_attempts", &self.reconnect.attempts())
            .finish_non_exhaustive()
    }
}

impl<T, C, R> AdsWorker<T, C, R>
where
    T: Transport,
    C: XdsCodec,
    R: Runtime,
{
    /// Create a new worker.
    pub(crate) fn new(
        session: Session<T>,
        codec: C,
        runtime: R,
        node: Node,
        state: DiscoveryState,
        read_retry: RetryPolicy,
        reconnect_retry: RetryPolicy,
    ) -> Self {
        Self {
            session,
            codec,
            runtime,
            node,
            state,
            read_retry,
            reconnect: Backoff::new(reconnect_retry),
        }
    }

    /// Encode requests for the wire, dropping any that fail to encode.
    pub(crate) fn encode_all(&self, requests: &[PendingRequest]) -> Vec<Bytes> {
        requests
            .iter()
            .filter_map(|request| match self.encode(request) {
                Ok(bytes) => Some(bytes),
                Err(error) => {
                    tracing::warn!(
                        resource_type = %request.resource_type,
                        %error,
                        "failed to encode discovery request"
                    );
                    None
                }
            })
            .collect()
    }

    /// Open a stream on the worker's session.
    pub(crate) async fn open_stream(&self, initial: Vec<Bytes>) -> Result<AdsStream<T::Stream>> {
        self.session.open_stream(initial).await
    }

    fn encode(&self, request: &PendingRequest) -> Result<Bytes> {
        self.codec.encode_request(&request.as_request(&self.node))
    }

    /// Run the worker until the session is closed.
    ///
    /// `stream` is the stream opened when the client was built. Whenever it
    /// becomes unusable a new one is opened, backing off per the reconnect
    /// policy. The worker gives up once that policy runs out of attempts.
    pub(crate) async fn run(mut self, mut stream: AdsStream<T::Stream>) {
        loop {
            match self.receive_loop(&mut stream).await {
                StreamEnd::Cancelled => break,
                StreamEnd::Reconnect(error) => {
                    tracing::warn!(%error, "ADS stream lost, reconnecting");
                }
            }

            stream = match self.reopen().await {
                Some(stream) => stream,
                None => break,
            };
        }
        tracing::info!(node = %self.node.id, "ADS worker stopped");
    }

    /// Open a replacement stream, resubscribing everything currently tracked.
    ///
    /// Returns `None` if the session was closed or the reconnect policy gave up.
    async fn reopen(&mut self) -> Option<AdsStream<T::Stream>> {
        loop {
            let Some(delay) = self.reconnect.next_backoff() else {
                tracing::error!(
                    attempts = self.reconnect.attempts(),
                    "giving up re-establishing the ADS stream"
                );
                return None;
            };
            if self.sleep_or_cancelled(delay).await {
                return None;
            }

            let requests = self.state.restart();
            let initial = self.encode_all(&requests);
            match self.session.open_stream(initial).await {
                Ok(stream) => {
                    tracing::info!(
                        attempt = self.reconnect.attempts(),
                        cluster_version = %self.state.version_info(ResourceType::Cluster),
                        endpoint_version = %self.state.version_info(ResourceType::Endpoint),
                        "ADS stream re-established"
                    );
                    return Some(stream);
                }
                Err(Error::Cancelled) => return None,
                Err(error) => {
                    tracing::warn!(
                        %error,
                        attempt = self.reconnect.attempts(),
                        "failed to re-open the ADS stream"
                    );
                }
            }
        }
    }

    /// Receive and apply responses until the stream is lost or the session closes.
    async fn receive_loop(&mut self, stream: &mut AdsStream<T::Stream>) -> StreamEnd {
        let mut read_backoff = Backoff::new(self.read_retry.clone());
        loop {
            match stream.recv().await {
                Ok(Some(bytes)) => {
                    // A stream that delivers is healthy again.
                    read_backoff.reset();
                    self.reconnect.reset();
                    if let Err(Error::Cancelled) = self.handle_response(stream, bytes).await {
                        return StreamEnd::Cancelled;
                    }
                }
                Ok(None) => return StreamEnd::Reconnect(Error::StreamClosed),
                Err(Error::Cancelled) => return StreamEnd::Cancelled,
                Err(error) => {
                    let Some(delay) = read_backoff.next_backoff() else {
                        return StreamEnd::Reconnect(error);
                    };
                    tracing::warn!(
                        %error,
                        attempt = read_backoff.attempts(),
                        ?delay,
                        "failed to read from the ADS stream, retrying"
                    );
                    if self.sleep_or_cancelled(delay).await {
                        return StreamEnd::Cancelled;
                    }
                }
            }
        }
    }

    /// Decode, apply and answer one response.
    ///
    /// Only [`Error::Cancelled`] is returned. Every other failure is logged
    /// and the loop moves on to the next response.
    async fn handle_response(
        &mut self,
        stream: &mut AdsStream<T::Stream>,
        bytes: Bytes,
    ) -> Result<()> {
        let response = match self.codec.decode_response(bytes) {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, "failed to decode discovery response");
                return Ok(());
            }
        };

        let applied = self.state.apply_response(&response);
        tracing::trace!(
            type_url = %response.type_url,
            accepted = applied.accepted,
            skipped = applied.skipped,
            removed = applied.removed.len(),
            nacked = applied.nacked,
            "discovery response applied"
        );

        for request in &applied.requests {
            self.send(stream, request).await?;
        }
        Ok(())
    }

    async fn send(
        &self,
        stream: &mut AdsStream<T::Stream>,
        request: &PendingRequest,
    ) -> Result<()> {
        let bytes = match self.encode(request) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(
                    resource_type = %request.resource_type,
                    %error,
                    "failed to encode discovery request"
                );
                return Ok(());
            }
        };

        match stream.send(bytes).await {
            Ok(()) => {
                tracing::trace!(
                    resource_type = %request.resource_type,
                    version = %request.version_info,
                    nonce = %request.response_nonce,
                    resources = request.resource_names.len(),
                    nack = request.is_nack(),
                    "discovery request sent"
                );
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(error) => {
                tracing::warn!(
                    resource_type = %request.resource_type,
                    %error,
                    "failed to send discovery request"
                );
                Ok(())
            }
        }
    }

    /// Sleep for `delay`. Returns true if the session closed first.
    async fn sleep_or_cancelled(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.session.closed() => true,
            _ = self.runtime.sleep(delay) => false,
        }
    }
}
