use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::net::Ipv4Cidr;

/// The (runner id, subnet, VNI, tunnel endpoint) tuple pinning a runner
/// into the L3 routed overlay (§3 "Overlay Allocation", §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayAllocation {
    pub runner_id: u32,
    pub subnet: Ipv4Cidr,
    pub gateway_ip: std::net::Ipv4Addr,
    pub vni: u32,
    pub tunnel_endpoint: String,
    pub runner_physical_ip: String,
    /// Last time this allocation was touched by a registration or a
    /// rehydration pass; used to pick the LRU victim under pool pressure.
    pub last_active: DateTime<Utc>,
    /// Set when the allocation was rehydrated from a kernel interface on
    /// restart without yet seeing the owning runner reconnect.
    pub placeholder: bool,
}
