//! Brings up this runner's side of the overlay tunnel (§4.7): the spoke
//! mirrors the Host's hub setup in `overlay::OverlayAllocator::bring_up`,
//! but binds the VXLAN endpoint locally, routes only the default path back
//! to the hub, and presents the result to the container runtime as a named
//! network rather than assigning the gateway address itself.

use std::net::Ipv4Addr;

use tracing::info;

use crate::error::Result;
use crate::overlay::NetlinkGateway;
use crate::transport::OverlayRegistration;

pub const BRIDGE_NAME: &str = "fleetd-ovl-br0";

/// Extracts the bare IPv4 host portion of a `host:port` or `ip` address
/// string, falling back to unspecified if it can't be parsed (loopback/demo
/// setups where the runner's own reachable address isn't a routable IP).
fn host_ipv4(address: &str) -> Ipv4Addr {
    let host = address.split(':').next().unwrap_or(address);
    host.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// Sets up the spoke side of the overlay for this registration: a VXLAN
/// endpoint tunneling to the Host, bridged locally so the container runtime
/// can attach workloads to `BRIDGE_NAME` and reach the Host via
/// `register.gateway_ip`.
pub async fn setup_spoke(
    gateway: &dyn NetlinkGateway,
    host_physical_address: &str,
    register: &OverlayRegistration,
    own_address: &str,
) -> Result<()> {
    let endpoint = crate::overlay::endpoint_name(register.runner_id);
    let local_addr = host_ipv4(own_address);
    let remote_addr = host_ipv4(host_physical_address);

    gateway
        .create_tunnel_endpoint(
            &endpoint,
            register.vni,
            local_addr,
            remote_addr,
            register.overlay_port,
        )
        .await?;
    gateway.attach_to_bridge(&endpoint, BRIDGE_NAME).await?;
    gateway
        .add_route(&register.subnet, &endpoint)
        .await?;
    gateway.trust_interface(&endpoint).await?;

    info!(
        endpoint = %endpoint,
        subnet = %register.subnet,
        gateway_ip = %register.gateway_ip,
        "overlay spoke endpoint up"
    );
    Ok(())
}
