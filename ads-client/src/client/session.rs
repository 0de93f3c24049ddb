//! Stream session management.
//!
//! A [`Session`] owns the transport channel to the control plane and the
//! cancellation token shared with the worker. Every [`AdsStream`] opened on
//! a session observes that token: once the session is closed, blocked reads
//! return [`Error::Cancelled`] and no further request is sent.

use bytes::Bytes;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportStream};

/// Owns the channel to the control plane.
#[derive(Debug)]
pub struct Session<T> {
    transport: T,
    cancel: CancellationToken,
}

#[cfg(feature = "transport-tonic")]
impl Session<crate::transport::tonic::TonicTransport> {
    /// Connect to the control plane at `address` with a plaintext channel.
    ///
    /// Fails with [`Error::Connection`] if the endpoint is unreachable. No
    /// retries are attempted.
    pub async fn connect(address: impl AsRef<str>) -> Result<Self> {
        let transport = crate::transport::tonic::TonicTransport::connect(address).await?;
        Ok(Self::new(transport))
    }
}

impl<T: Transport> Session<T> {
    /// Create a session over an already built transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            cancel: CancellationToken::new(),
        }
    }

    /// Open an ADS stream, queueing `initial_requests` ahead of anything else.
    ///
    /// Fails with [`Error::Cancelled`] if the session is closed before or
    /// while the stream opens.
    pub async fn open_stream(&self, initial_requests: Vec<Bytes>) -> Result<AdsStream<T::Stream>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let inner = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            stream = self.transport.new_stream(initial_requests) => stream?,
        };
        Ok(AdsStream {
            inner,
            cancel: self.cancel.clone(),
        })
    }

    /// Cancel every operation bound to this session.
    ///
    /// Safe to call more than once. The channel itself is released when the
    /// session is dropped, which the worker does as soon as it observes the
    /// cancellation.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Returns true once [`Session::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the session is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// A handle that closes this session when cancelled.
    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// An ADS stream bound to its session's cancellation.
#[derive(Debug)]
pub struct AdsStream<S> {
    inner: S,
    cancel: CancellationToken,
}

impl<S: TransportStream> AdsStream<S> {
    /// Send serialized request bytes.
    ///
    /// Fails with [`Error::Cancelled`] once the session is closed, including
    /// when the close happens while the send waits on a full transport queue.
    pub async fn send(&mut self, request: Bytes) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = self.inner.send(request) => result,
        }
    }

    /// Receive the next serialized response.
    ///
    /// Blocks until a response arrives, the stream fails or ends, or the
    /// session is closed, in which case it returns [`Error::Cancelled`].
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = self.inner.recv() => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock_transport;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_unblocks_recv() {
        let (transport, mut server) = mock_transport();
        let session = Session::new(transport);
        let mut stream = session.open_stream(Vec::new()).await.unwrap();
        let _handle = server.next_stream().await;

        let reader = tokio::spawn(async move { stream.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        session.close();
        session.close();
        assert!(session.is_closed());

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
    }

    /// A stream whose peer never drains the send queue.
    struct StalledStream;

    impl TransportStream for StalledStream {
        async fn send(&mut self, _request: Bytes) -> Result<()> {
            std::future::pending().await
        }

        async fn recv(&mut self) -> Result<Option<Bytes>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_close_unblocks_stalled_send() {
        let cancel = CancellationToken::new();
        let mut stream = AdsStream {
            inner: StalledStream,
            cancel: cancel.clone(),
        };

        let sender = tokio::spawn(async move { stream.send(Bytes::from_static(b"ack")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sender.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), sender)
            .await
            .expect("send still blocked after close")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
    }

    #[tokio::test]
    async fn test_closed_session_sends_nothing() {
        let (transport, mut server) = mock_transport();
        let session = Session::new(transport);
        let mut stream = session
            .open_stream(vec![Bytes::from_static(b"first")])
            .await
            .unwrap();
        let mut handle = server.next_stream().await;

        session.close();
        let result = stream.send(Bytes::from_static(b"second")).await;
        assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");

        // Only the initial request went out.
        assert!(handle.try_next_request().is_some());
        assert!(handle.try_next_request().is_none());

        let result = session.open_stream(Vec::new()).await;
        assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
    }

    #[tokio::test]
    async fn test_open_stream_error_is_reported() {
        let (transport, server) = mock_transport();
        server.fail_next_streams(1);
        let session = Session::new(transport);

        let result = session.open_stream(Vec::new()).await;
        assert!(matches!(result, Err(Error::Stream(_))), "{result:?}");
        assert!(session.open_stream(Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_recv_reports_end_of_stream() {
        let (transport, mut server) = mock_transport();
        let session = Session::new(transport);
        let mut stream = session.open_stream(Vec::new()).await.unwrap();
        let mut handle = server.next_stream().await;

        handle.send_raw(Bytes::from_static(b"payload"));
        handle.close();

        assert_eq!(
            stream.recv().await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
        assert_eq!(stream.recv().await.unwrap(), None);
    }
}
