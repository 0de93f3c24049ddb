//! Example demonstrating ads-client usage.
//!
//! This example shows:
//! - How to create an `AdsClient` with the default tonic transport
//! - How to resolve clusters to endpoints from the local cache
//! - How to shut the client down
//!
//! # Configuration (environment variables)
//!
//! - `ADS_SERVER`: URI of the ADS management server (default: `http://localhost:18000`)
//! - `ADS_NODE_ID`: Node identifier sent to the server (default: `ads-client-example`)
//! - `ADS_CLUSTERS`: Comma-separated cluster names to resolve (default: every known cluster)
//! - `RUST_LOG`: Log filter (default: `info`)
//!
//! # Usage
//!
//! ```sh
//! # Resolve everything the control plane advertises
//! cargo run -p ads-client --example resolve
//!
//! # Resolve specific clusters against a custom server
//! ADS_SERVER=http://xds.example.com:18000 ADS_CLUSTERS=svc-a,svc-b \
//!   cargo run -p ads-client --example resolve
//! ```

use std::time::Duration;

use ads_client::{AdsClient, ClientConfig, ClusterStatus, Node};
use tracing_subscriber::EnvFilter;

struct Args {
    server: String,
    node_id: String,
    clusters: Vec<String>,
}

fn parse_args() -> Args {
    let server =
        std::env::var("ADS_SERVER").unwrap_or_else(|_| "http://localhost:18000".to_string());
    let node_id =
        std::env::var("ADS_NODE_ID").unwrap_or_else(|_| "ads-client-example".to_string());
    let clusters = std::env::var("ADS_CLUSTERS")
        .map(|list| {
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Args {
        server,
        node_id,
        clusters,
    }
}

#[tokio::main]
async fn main() -> ads_client::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();
    println!("Connecting to ADS server: {}", args.server);

    let config = ClientConfig::new(Node::new(args.node_id), args.server);
    let client = AdsClient::connect(config).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        let clusters = if args.clusters.is_empty() {
            client.cluster_names()
        } else {
            args.clusters.clone()
        };
        if clusters.is_empty() {
            println!("No clusters known yet");
            continue;
        }

        for cluster in &clusters {
            match (client.status(cluster), client.select(cluster)) {
                (_, Some(endpoint)) => println!("  {cluster:<24} -> {endpoint}"),
                (ClusterStatus::Unknown, None) => println!("  {cluster:<24} (unknown cluster)"),
                (_, None) => println!("  {cluster:<24} (no endpoints)"),
            }
        }
        println!();
    }

    client.close();
    println!("Exiting");
    Ok(())
}
