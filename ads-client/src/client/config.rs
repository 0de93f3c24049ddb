//! Configuration for the ADS client.

use std::time::Duration;

use crate::client::retry::RetryPolicy;
use crate::message::Node;

/// Delay between failed reads on the same stream.
const DEFAULT_READ_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Failed reads tolerated on one stream before it is abandoned.
const DEFAULT_READ_RETRY_ATTEMPTS: usize = 3;

/// Configuration for the ADS client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Node identification sent to the control plane on every request.
    pub node: Node,

    /// URI (or bare `host:port`) of the control plane.
    pub server_uri: String,

    /// Backoff between failed reads on the same stream.
    ///
    /// When its attempts are exhausted the stream is abandoned and a new
    /// one is opened according to `reconnect_retry`.
    pub read_retry: RetryPolicy,

    /// Backoff between attempts to re-open the stream.
    pub reconnect_retry: RetryPolicy,

    /// Whether a CDS response that omits a previously known cluster removes it.
    pub remove_missing_clusters: bool,
}

impl ClientConfig {
    /// Create a new configuration with the given node identification and server.
    ///
    /// Failed reads are retried on the same stream every 10 seconds, up to
    /// 3 times. Re-opening the stream backs off exponentially from 1 second
    /// to 30 seconds with 20% jitter.
    ///
    /// # Example
    ///
    /// ```
    /// use ads_client::{ClientConfig, Node};
    ///
    /// let config = ClientConfig::new(Node::new("mycoredns"), "http://127.0.0.1:18000");
    /// assert!(config.remove_missing_clusters);
    /// ```
    pub fn new(node: Node, server_uri: impl Into<String>) -> Self {
        Self {
            node,
            server_uri: server_uri.into(),
            read_retry: default_read_retry(),
            reconnect_retry: default_reconnect_retry(),
            remove_missing_clusters: true,
        }
    }

    /// Set the policy for retrying failed reads on the same stream.
    ///
    /// # Example
    ///
    /// ```
    /// use ads_client::{ClientConfig, Node, RetryPolicy};
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::fixed(Duration::from_secs(1))
    ///     .unwrap()
    ///     .with_max_attempts(Some(5));
    ///
    /// let config = ClientConfig::new(Node::new("node"), "127.0.0.1:18000")
    ///     .with_read_retry(policy);
    /// ```
    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    /// Set the policy for re-opening the stream.
    pub fn with_reconnect_retry(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_retry = policy;
        self
    }

    /// Set whether clusters omitted from a CDS response are removed.
    pub fn with_remove_missing_clusters(mut self, remove: bool) -> Self {
        self.remove_missing_clusters = remove;
        self
    }
}

fn default_read_retry() -> RetryPolicy {
    RetryPolicy {
        initial_backoff: DEFAULT_READ_RETRY_DELAY,
        max_backoff: DEFAULT_READ_RETRY_DELAY,
        backoff_multiplier: 1.0,
        jitter: 0.0,
        max_attempts: Some(DEFAULT_READ_RETRY_ATTEMPTS),
    }
}

fn default_reconnect_retry() -> RetryPolicy {
    RetryPolicy {
        jitter: 0.2,
        ..RetryPolicy::default()
    }
}
