//! ClusterLoadAssignment (EDS) resources.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3::{
    HealthStatus as HealthStatusProto, address, socket_address,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    ClusterLoadAssignment as ClusterLoadAssignmentProto, LbEndpoint, lb_endpoint::HostIdentifier,
};
use prost::Message;

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceType};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EndpointHost {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

/// Represents a validated endpoint address extracted from xDS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    /// The IP address or hostname
    host: EndpointHost,
    /// The port number
    port: u16,
}

impl EndpointAddress {
    /// Build an address from a host string and port.
    ///
    /// Hosts that parse as IP addresses are stored as such, anything else is
    /// kept as a hostname.
    pub fn new(host: &str, port: u16) -> Self {
        let host = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => EndpointHost::Ipv4(ip),
            Ok(IpAddr::V6(ip)) => EndpointHost::Ipv6(ip),
            Err(_) => EndpointHost::Hostname(host.to_string()),
        };
        Self { host, port }
    }

    /// The IP address, if the endpoint was given as one.
    pub fn ip(&self) -> Option<IpAddr> {
        match &self.host {
            EndpointHost::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            EndpointHost::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            EndpointHost::Hostname(_) => None,
        }
    }

    /// The hostname, if the endpoint was not given as an IP address.
    pub fn hostname(&self) -> Option<&str> {
        match &self.host {
            EndpointHost::Hostname(name) => Some(name),
            _ => None,
        }
    }

    /// The port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The socket address, if the endpoint was given as an IP address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for EndpointAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4_addr) => Self {
                host: EndpointHost::Ipv4(*v4_addr.ip()),
                port: v4_addr.port(),
            },
            SocketAddr::V6(v6_addr) => Self {
                host: EndpointHost::Ipv6(*v6_addr.ip()),
                port: v6_addr.port(),
            },
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            EndpointHost::Ipv4(ip) => write!(f, "{ip}:{}", self.port),
            EndpointHost::Ipv6(ip) => write!(f, "[{ip}]:{}", self.port),
            EndpointHost::Hostname(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

/// Health status reported by the control plane for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// No health information.
    #[default]
    Unknown,
    /// Healthy.
    Healthy,
    /// Unhealthy.
    Unhealthy,
    /// Connection draining in progress.
    Draining,
    /// Health check timed out.
    Timeout,
    /// Degraded, but still able to serve.
    Degraded,
}

impl HealthStatus {
    /// Returns true if traffic may be sent to an endpoint in this state.
    pub fn is_serving(self) -> bool {
        !matches!(
            self,
            HealthStatus::Unhealthy | HealthStatus::Draining | HealthStatus::Timeout
        )
    }
}

impl From<i32> for HealthStatus {
    fn from(value: i32) -> Self {
        match HealthStatusProto::try_from(value) {
            Ok(HealthStatusProto::Healthy) => HealthStatus::Healthy,
            Ok(HealthStatusProto::Unhealthy) => HealthStatus::Unhealthy,
            Ok(HealthStatusProto::Draining) => HealthStatus::Draining,
            Ok(HealthStatusProto::Timeout) => HealthStatus::Timeout,
            Ok(HealthStatusProto::Degraded) => HealthStatus::Degraded,
            Ok(HealthStatusProto::Unknown) | Err(_) => HealthStatus::Unknown,
        }
    }
}

/// Locality information identifying where an endpoint is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locality {
    /// Region the endpoint is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// A single endpoint backing a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Where the endpoint can be reached.
    pub address: EndpointAddress,
    /// Load balancing weight, never zero.
    pub weight: u32,
    /// Health status as reported by the control plane.
    pub health: HealthStatus,
    /// Locality the endpoint belongs to, if the control plane provided one.
    pub locality: Option<Locality>,
}

impl Endpoint {
    /// Create an endpoint of unknown health with weight 1 and no locality.
    pub fn new(address: impl Into<EndpointAddress>) -> Self {
        Self {
            address: address.into(),
            weight: 1,
            health: HealthStatus::Unknown,
            locality: None,
        }
    }

    /// Set the health status.
    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }
}

/// The set of endpoints currently backing a named cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLoadAssignment {
    cluster_name: String,
    endpoints: Vec<Endpoint>,
}

impl ClusterLoadAssignment {
    /// Create an assignment for `cluster_name` with the given endpoints.
    pub fn new(cluster_name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            endpoints,
        }
    }

    /// The cluster this assignment belongs to.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// The endpoints, in the order the control plane listed them.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

impl Resource for ClusterLoadAssignment {
    const TYPE: ResourceType = ResourceType::Endpoint;

    fn decode_value(bytes: Bytes) -> Result<Self> {
        let proto = ClusterLoadAssignmentProto::decode(bytes)?;
        if proto.cluster_name.is_empty() {
            return Err(Error::Validation(
                "cluster load assignment has no cluster name".into(),
            ));
        }

        let mut endpoints = Vec::new();
        for locality_endpoints in proto.endpoints {
            let locality = locality_endpoints.locality.map(|l| Locality {
                region: l.region,
                zone: l.zone,
                sub_zone: l.sub_zone,
            });
            for lb_endpoint in locality_endpoints.lb_endpoints {
                match convert_lb_endpoint(lb_endpoint, locality.as_ref()) {
                    Some(endpoint) => endpoints.push(endpoint),
                    None => tracing::debug!(
                        cluster = %proto.cluster_name,
                        "skipping endpoint without a socket address"
                    ),
                }
            }
        }

        Ok(Self {
            cluster_name: proto.cluster_name,
            endpoints,
        })
    }

    fn name(&self) -> &str {
        &self.cluster_name
    }
}

fn convert_lb_endpoint(lb_endpoint: LbEndpoint, locality: Option<&Locality>) -> Option<Endpoint> {
    let HostIdentifier::Endpoint(endpoint) = lb_endpoint.host_identifier? else {
        return None;
    };
    let address::Address::SocketAddress(socket) = endpoint.address?.address? else {
        return None;
    };
    let port = match socket.port_specifier? {
        socket_address::PortSpecifier::PortValue(port) => u16::try_from(port).ok()?,
        socket_address::PortSpecifier::NamedPort(_) => return None,
    };
    if socket.address.is_empty() {
        return None;
    }

    let weight = lb_endpoint
        .load_balancing_weight
        .map(|w| w.value)
        .filter(|w| *w > 0)
        .unwrap_or(1);

    Some(Endpoint {
        address: EndpointAddress::new(&socket.address, port),
        weight,
        health: HealthStatus::from(lb_endpoint.health_status),
        locality: locality.cloned(),
    })
}
