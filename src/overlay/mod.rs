//! Assigns each runner a subnet slice of the overlay CIDR, wires up the
//! host-side tunnel endpoint, and rehydrates allocations from surviving
//! kernel interfaces across a Host restart (§4.7).

pub mod netlink;

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::OverlaySubnetLayout;
use crate::error::{FleetError, Result};
use crate::metrics;
use crate::store::NodeRegistry;
use crate::types::OverlayAllocation;

pub use netlink::NetlinkGateway;

const ENDPOINT_PREFIX: &str = "fleetd-ovl-";

/// Base36 encoding of a runner id, matching the deterministic tunnel
/// endpoint naming scheme (§4.7).
pub fn endpoint_name(runner_id: u32) -> String {
    format!("{ENDPOINT_PREFIX}{}", to_base36(runner_id))
}

/// Decodes an endpoint name back to a runner id, if it matches the naming
/// pattern; used during startup rehydration.
pub fn decode_endpoint_name(name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(ENDPOINT_PREFIX)?;
    from_base36(suffix)
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

fn from_base36(s: &str) -> Option<u32> {
    let mut value: u32 = 0;
    for c in s.chars() {
        let digit = c.to_digit(36)?;
        value = value.checked_mul(36)?.checked_add(digit)?;
    }
    Some(value)
}

pub struct OverlayAllocator {
    nodes: Arc<NodeRegistry>,
    gateway: Arc<dyn NetlinkGateway>,
    layout: OverlaySubnetLayout,
    base_vni: u32,
    port: u16,
    host_reachable_addr: std::net::Ipv4Addr,
    /// Runner ids whose tunnel endpoint survived a Host restart but whose
    /// owning node row could not be matched by hostname or address during
    /// `rehydrate`. Held here, not on any `Node`, so `pick_runner_id` still
    /// treats them as claimed until the matching runner re-registers and
    /// `allocate` reclaims the entry in place (§4.7 "State recovery").
    reserved: dashmap::DashMap<u32, OverlayAllocation>,
}

impl OverlayAllocator {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        gateway: Arc<dyn NetlinkGateway>,
        layout: OverlaySubnetLayout,
        base_vni: u32,
        port: u16,
        host_reachable_addr: std::net::Ipv4Addr,
    ) -> Self {
        Self {
            nodes,
            gateway,
            layout,
            base_vni,
            port,
            host_reachable_addr,
            reserved: dashmap::DashMap::new(),
        }
    }

    /// `base + 1`, the host's address on the overlay's top-level CIDR
    /// (§4.7), independent of any per-runner subnet.
    pub fn host_global_ip(&self) -> std::net::Ipv4Addr {
        self.layout.overlay_cidr().nth(1)
    }

    fn gateway_ip(&self, subnet: &crate::types::Ipv4Cidr) -> std::net::Ipv4Addr {
        subnet.nth(1)
    }

    pub fn host_subnet_ip(&self, subnet: &crate::types::Ipv4Cidr) -> std::net::Ipv4Addr {
        let top = 1u32 << subnet.host_bits();
        subnet.nth(top.saturating_sub(2))
    }

    /// Assigns (or reuses) an allocation for a newly registering runner,
    /// brings up the host-side tunnel endpoint, and returns the allocation.
    pub async fn allocate(
        &self,
        hostname: &str,
        physical_address: &str,
    ) -> Result<OverlayAllocation> {
        if let Some(existing) = self.find_reusable(hostname, physical_address).await {
            return Ok(existing);
        }

        let runner_id = self.pick_runner_id().await?;
        let subnet = self.layout.runner_subnet(runner_id);
        let allocation = OverlayAllocation {
            runner_id,
            subnet,
            gateway_ip: self.gateway_ip(&subnet),
            vni: self.base_vni + runner_id,
            tunnel_endpoint: endpoint_name(runner_id),
            runner_physical_ip: physical_address.to_string(),
            last_active: Utc::now(),
            placeholder: false,
        };

        self.bring_up(&allocation).await?;
        metrics::OVERLAY_ALLOCATIONS_ACTIVE.inc();
        info!(hostname, runner_id, subnet = %subnet, "overlay allocation assigned");
        Ok(allocation)
    }

    async fn find_reusable(
        &self,
        hostname: &str,
        physical_address: &str,
    ) -> Option<OverlayAllocation> {
        if let Some(node) = self.nodes.get(hostname).await
            && let Some(alloc) = node.overlay
        {
            return Some(alloc);
        }
        if let Some(node) = self.nodes.find_by_address(physical_address).await {
            return node.overlay;
        }
        None
    }

    async fn pick_runner_id(&self) -> Result<u32> {
        let max = self.layout.max_runners();
        let nodes = self.nodes.snapshot().await;
        let mut used: std::collections::BTreeSet<u32> = nodes
            .iter()
            .filter_map(|n| n.overlay.as_ref().map(|o| o.runner_id))
            .collect();
        used.extend(self.reserved.iter().map(|e| *e.key()));

        for candidate in 1..=max {
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }

        metrics::OVERLAY_POOL_EXHAUSTED_TOTAL.inc();
        let node_lru = nodes
            .iter()
            .filter_map(|n| n.overlay.as_ref().map(|o| (Some(n.hostname.clone()), o.clone())))
            .filter(|(_, o)| o.placeholder || self.is_inactive(o));
        let reserved_lru = self
            .reserved
            .iter()
            .map(|e| (None::<String>, e.value().clone()));

        let lru = node_lru.chain(reserved_lru).min_by_key(|(_, o)| o.last_active);

        match lru {
            Some((hostname, overlay)) => {
                warn!(
                    reclaimed_from = hostname.as_deref().unwrap_or("<unrehydrated>"),
                    runner_id = overlay.runner_id,
                    "overlay pool exhausted; reclaiming LRU inactive allocation"
                );
                self.gateway.delete_interface(&overlay.tunnel_endpoint).await.ok();
                self.reserved.remove(&overlay.runner_id);
                Ok(overlay.runner_id)
            }
            None => Err(FleetError::ResourceExhaustion(
                "overlay runner-id pool is full and no inactive allocation to reclaim".into(),
            )),
        }
    }


    fn is_inactive(&self, overlay: &OverlayAllocation) -> bool {
        Utc::now().signed_duration_since(overlay.last_active) > chrono::Duration::hours(1)
    }

    async fn bring_up(&self, allocation: &OverlayAllocation) -> Result<()> {
        let local = self.host_reachable_addr;
        let remote: std::net::Ipv4Addr = allocation
            .runner_physical_ip
            .parse()
            .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);

        self.gateway
            .create_tunnel_endpoint(
                &allocation.tunnel_endpoint,
                allocation.vni,
                local,
                remote,
                self.port,
            )
            .await?;
        self.gateway
            .assign_address(
                &allocation.tunnel_endpoint,
                self.host_subnet_ip(&allocation.subnet),
                allocation.subnet.prefix_len(),
            )
            .await?;
        self.gateway
            .add_route(&allocation.subnet.to_string(), &allocation.tunnel_endpoint)
            .await?;
        self.gateway
            .enable_forwarding(&self.layout.overlay_cidr().to_string())
            .await?;
        self.gateway
            .trust_interface(&allocation.tunnel_endpoint)
            .await?;
        Ok(())
    }

    /// Tears down a node's overlay allocation and clears it from the node
    /// row, an explicit operator action distinct from the automatic LRU
    /// reclaim `pick_runner_id` performs under pool pressure.
    pub async fn release(&self, hostname: &str) -> Result<()> {
        let node = self
            .nodes
            .get(hostname)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("node {hostname} not found")))?;
        let Some(overlay) = node.overlay else {
            return Ok(());
        };
        self.gateway.delete_interface(&overlay.tunnel_endpoint).await.ok();
        self.nodes
            .update(hostname, |n| {
                n.overlay = None;
                Ok(())
            })
            .await?;
        metrics::OVERLAY_ALLOCATIONS_ACTIVE.dec();
        info!(hostname, runner_id = overlay.runner_id, "overlay allocation released");
        Ok(())
    }

    /// Enumerates surviving tunnel endpoints on process startup, rehydrating
    /// a placeholder allocation for each one whose name decodes to a valid
    /// runner id and whose VNI is consistent with it; anything else is
    /// torn down (§4.7 "State recovery on restart").
    ///
    /// Rehydrated entries whose runner_id isn't already claimed by a known
    /// `Node` are also stashed in `self.reserved`, so a concurrent new
    /// registration can't be handed the same runner_id/subnet/VNI before the
    /// real owner re-registers and reclaims it through `allocate`.
    pub async fn rehydrate(&self) -> Result<Vec<OverlayAllocation>> {
        let discovered = self.gateway.list_tunnel_endpoints(ENDPOINT_PREFIX).await?;
        let mut rehydrated = Vec::new();
        let known_runner_ids: std::collections::BTreeSet<u32> = self
            .nodes
            .snapshot()
            .await
            .iter()
            .filter_map(|n| n.overlay.as_ref().map(|o| o.runner_id))
            .collect();

        for endpoint in discovered {
            let Some(runner_id) = decode_endpoint_name(&endpoint.name) else {
                warn!(name = %endpoint.name, "non-conforming tunnel endpoint; deleting");
                self.gateway.delete_interface(&endpoint.name).await.ok();
                continue;
            };
            let expected_vni = self.base_vni + runner_id;
            if endpoint.vni != Some(expected_vni) {
                warn!(
                    name = %endpoint.name,
                    expected_vni,
                    found_vni = ?endpoint.vni,
                    "tunnel endpoint VNI mismatch; deleting"
                );
                self.gateway.delete_interface(&endpoint.name).await.ok();
                continue;
            }

            let subnet = self.layout.runner_subnet(runner_id);
            let allocation = OverlayAllocation {
                runner_id,
                subnet,
                gateway_ip: self.gateway_ip(&subnet),
                vni: expected_vni,
                tunnel_endpoint: endpoint.name,
                runner_physical_ip: String::new(),
                last_active: Utc::now(),
                placeholder: true,
            };
            if !known_runner_ids.contains(&runner_id) {
                self.reserved.insert(runner_id, allocation.clone());
            }
            rehydrated.push(allocation);
        }

        info!(count = rehydrated.len(), "rehydrated overlay allocations from kernel state");
        Ok(rehydrated)
    }
}
