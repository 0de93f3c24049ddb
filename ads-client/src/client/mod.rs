//! Client interface through which the user resolves clusters to endpoints.

use std::sync::Arc;

use tokio_util::sync::{CancellationToken, DropGuard};

use crate::client::cache::{AssignmentCache, ClusterStatus};
use crate::client::config::ClientConfig;
use crate::client::session::Session;
use crate::client::state::DiscoveryState;
use crate::client::worker::AdsWorker;
use crate::codec::XdsCodec;
use crate::error::Result;
use crate::resource::{ClusterLoadAssignment, EndpointAddress};
use crate::runtime::Runtime;
use crate::transport::Transport;

pub mod cache;
pub mod config;
pub mod retry;
pub mod session;
pub(crate) mod state;
pub(crate) mod worker;

/// Builder for [`AdsClient`].
#[derive(Debug)]
pub struct AdsClientBuilder<T, C, R> {
    config: ClientConfig,
    session: Session<T>,
    codec: C,
    runtime: R,
}

impl<T, C, R> AdsClientBuilder<T, C, R>
where
    T: Transport,
    C: XdsCodec,
    R: Runtime,
{
    /// Create a new builder with the given configuration, transport, codec, and runtime.
    pub fn new(config: ClientConfig, transport: T, codec: C, runtime: R) -> Self {
        Self::with_session(config, Session::new(transport), codec, runtime)
    }

    /// Create a new builder over an existing session.
    pub fn with_session(config: ClientConfig, session: Session<T>, codec: C, runtime: R) -> Self {
        Self {
            config,
            session,
            codec,
            runtime,
        }
    }

    /// Open the ADS stream and start the background worker.
    ///
    /// The stream is opened with a wildcard cluster subscription before this
    /// returns, so a control plane that refuses the stream fails the build
    /// rather than the worker. Once built, the worker reconnects on its own
    /// and runs until [`AdsClient::close`] is called or every handle is dropped.
    pub async fn build(self) -> Result<AdsClient> {
        let ClientConfig {
            node,
            server_uri,
            read_retry,
            reconnect_retry,
            remove_missing_clusters,
        } = self.config;

        let cache = AssignmentCache::new();
        let mut state = DiscoveryState::new(cache.clone(), remove_missing_clusters);
        let requests = state.restart();

        let cancel = self.session.cancellation_token();
        let worker = AdsWorker::new(
            self.session,
            self.codec,
            self.runtime.clone(),
            node,
            state,
            read_retry,
            reconnect_retry,
        );
        let initial = worker.encode_all(&requests);
        let stream = worker.open_stream(initial).await?;

        tracing::info!(server = %server_uri, "ADS stream established");
        self.runtime.spawn(worker.run(stream));

        Ok(AdsClient {
            cache,
            cancel: cancel.clone(),
            _guard: Arc::new(cancel.drop_guard()),
        })
    }
}

/// The ADS client.
///
/// This is a handle to the background worker that manages the ADS stream
/// and to the assignment cache it keeps current. Cloning this handle creates
/// a new reference to the same worker and cache.
///
/// When all `AdsClient` handles are dropped, the background worker shuts down.
#[derive(Clone, Debug)]
pub struct AdsClient {
    cache: AssignmentCache,
    cancel: CancellationToken,
    /// Cancels the session once the last handle is gone.
    _guard: Arc<DropGuard>,
}

impl AdsClient {
    /// Connect to the control plane named by `config` over tonic.
    ///
    /// Fails with [`Error::Connection`](crate::Error::Connection) if the server
    /// is unreachable and with [`Error::Stream`](crate::Error::Stream) if the
    /// ADS stream cannot be opened. No retries are attempted here.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn run() -> ads_client::Result<()> {
    /// use ads_client::{AdsClient, ClientConfig, Node};
    ///
    /// let config = ClientConfig::new(Node::new("mycoredns"), "http://127.0.0.1:18000");
    /// let client = AdsClient::connect(config).await?;
    ///
    /// if let Some(endpoint) = client.select("xds-cluster") {
    ///     println!("resolved to {endpoint}");
    /// }
    /// client.close();
    /// # Ok(())
    /// # }
    /// ```
    #[cfg(feature = "transport-tonic")]
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let session = Session::connect(&config.server_uri).await?;
        AdsClientBuilder::with_session(
            config,
            session,
            crate::codec::prost::ProstCodec,
            crate::runtime::tokio::TokioRuntime,
        )
        .build()
        .await
    }

    /// Create a new builder with the given configuration, transport, codec, and runtime.
    pub fn builder<T, C, R>(
        config: ClientConfig,
        transport: T,
        codec: C,
        runtime: R,
    ) -> AdsClientBuilder<T, C, R>
    where
        T: Transport,
        C: XdsCodec,
        R: Runtime,
    {
        AdsClientBuilder::new(config, transport, codec, runtime)
    }

    /// Pick one endpoint of `cluster_name`, rotating through healthy endpoints.
    ///
    /// Returns `None` if the cluster is unknown or has no endpoints yet.
    /// Never blocks on the network.
    pub fn select(&self, cluster_name: &str) -> Option<EndpointAddress> {
        self.cache.select(cluster_name)
    }

    /// The current endpoint assignment of `cluster_name`.
    pub fn assignment(&self, cluster_name: &str) -> Option<Arc<ClusterLoadAssignment>> {
        self.cache.assignment(cluster_name)
    }

    /// Names of every known cluster, sorted.
    pub fn cluster_names(&self) -> Vec<String> {
        self.cache.cluster_names()
    }

    /// Whether `cluster_name` is known and whether it has endpoints.
    pub fn status(&self, cluster_name: &str) -> ClusterStatus {
        self.cache.status(cluster_name)
    }

    /// A handle to the assignment cache this client keeps current.
    ///
    /// The handle stays readable after the client is closed.
    pub fn cache(&self) -> AssignmentCache {
        self.cache.clone()
    }

    /// Stop the worker and release the stream.
    ///
    /// A blocked receive returns immediately and nothing arriving afterwards
    /// is applied. The cache keeps its last contents. Safe to call more than
    /// once, from any clone.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("closing ADS client");
        }
        self.cancel.cancel();
    }

    /// Returns true once the client was closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
