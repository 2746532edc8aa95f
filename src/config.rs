//! Manages process configuration: loading from TOML, resolving defaults, and
//! validation. A `default_*()` free function per field, a `Default` impl
//! built from those functions, and a `Config::validate` pass that rejects
//! nonsensical combinations at startup (fatal-bootstrap, not first-use).

use std::fs;
use std::net::Ipv4Addr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::types::Ipv4Cidr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Parsed form of `BASE/NETWORK_PREFIX/NODE_BITS/SUBNET_BITS` (§4.7). The
/// three numerics must sum to 32.
#[derive(Debug, Clone)]
pub struct OverlaySubnetLayout {
    pub base: Ipv4Addr,
    pub network_prefix: u8,
    pub node_bits: u8,
    pub subnet_bits: u8,
}

impl OverlaySubnetLayout {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 4 {
            return Err(anyhow!(
                "overlay_subnet must be BASE/NETWORK_PREFIX/NODE_BITS/SUBNET_BITS, got '{s}'"
            ));
        }
        let base: Ipv4Addr = parts[0]
            .parse()
            .with_context(|| format!("invalid overlay base address '{}'", parts[0]))?;
        let network_prefix: u8 = parts[1].parse().context("invalid network prefix")?;
        let node_bits: u8 = parts[2].parse().context("invalid node bits")?;
        let subnet_bits: u8 = parts[3].parse().context("invalid subnet bits")?;
        if network_prefix as u16 + node_bits as u16 + subnet_bits as u16 != 32 {
            return Err(anyhow!(
                "overlay_subnet components must sum to 32, got {network_prefix}+{node_bits}+{subnet_bits}"
            ));
        }
        Ok(Self {
            base,
            network_prefix,
            node_bits,
            subnet_bits,
        })
    }

    pub fn overlay_cidr(&self) -> Ipv4Cidr {
        Ipv4Cidr::new(self.base, self.network_prefix)
    }

    pub fn max_runners(&self) -> u32 {
        (1u32 << self.node_bits) - 1
    }

    /// `base + (runner_id << SUBNET_BITS)`, with the combined prefix of the
    /// runner's own subnet.
    pub fn runner_subnet(&self, runner_id: u32) -> Ipv4Cidr {
        self.overlay_cidr()
            .subnet(runner_id, self.network_prefix + self.node_bits)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `BASE/NETWORK_PREFIX/NODE_BITS/SUBNET_BITS`.
    #[serde(default = "default_overlay_subnet")]
    pub subnet: String,
    #[serde(default = "default_overlay_base_vni")]
    pub base_vni: u32,
    #[serde(default = "default_overlay_port")]
    pub port: u16,
    #[serde(default = "default_overlay_mtu")]
    pub mtu: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            subnet: default_overlay_subnet(),
            base_vni: default_overlay_base_vni(),
            port: default_overlay_port(),
            mtu: default_overlay_mtu(),
        }
    }
}

impl OverlayConfig {
    pub fn layout(&self) -> Result<OverlaySubnetLayout> {
        OverlaySubnetLayout::parse(&self.subnet)
    }
}

/// The Host process: central scheduler, node registry, status authority,
/// IP reservation issuer, overlay hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub auth_enabled: bool,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_factor")]
    pub heartbeat_timeout_factor: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_dispatch_timeout_command_secs")]
    pub dispatch_timeout_command_secs: u64,
    #[serde(default = "default_dispatch_timeout_vps_secs")]
    pub dispatch_timeout_vps_secs: u64,
    #[serde(default = "default_suspicion_threshold")]
    pub suspicion_threshold: u32,
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
    #[serde(default = "default_reservation_sweep_interval_secs")]
    pub reservation_sweep_interval_secs: u64,

    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,

    /// Process secret used to HMAC-sign IP reservation tokens. Must be set
    /// explicitly in production; a random one is generated if absent so a
    /// single process stays internally consistent across its own lifetime.
    #[serde(default)]
    pub reservation_hmac_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            auth_enabled: default_true(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_factor: default_heartbeat_timeout_factor(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            dispatch_timeout_command_secs: default_dispatch_timeout_command_secs(),
            dispatch_timeout_vps_secs: default_dispatch_timeout_vps_secs(),
            suspicion_threshold: default_suspicion_threshold(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
            reservation_sweep_interval_secs: default_reservation_sweep_interval_secs(),
            overlay: OverlayConfig::default(),
            metrics: MetricsConfig::default(),
            storage: StorageConfig::default(),
            reservation_hmac_secret: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(anyhow!("heartbeat_interval_secs cannot be 0"));
        }
        if self.heartbeat_timeout_factor == 0 {
            return Err(anyhow!("heartbeat_timeout_factor cannot be 0"));
        }
        if self.suspicion_threshold == 0 {
            return Err(anyhow!("suspicion_threshold cannot be 0"));
        }
        if self.overlay.enabled {
            self.overlay
                .layout()
                .context("invalid overlay_subnet configuration")?;
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs * self.heartbeat_timeout_factor)
    }
}

/// The Runner Agent process: workload executor, heartbeat sender, overlay
/// spoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub hostname: String,
    #[serde(default = "default_agent_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_agent_port")]
    pub port: u16,
    pub host_url: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Overrides auto-detected capacity; `None` entries are filled in from
    /// `sysinfo` at registration time.
    #[serde(default)]
    pub cores_override: Option<u32>,
    #[serde(default)]
    pub memory_bytes_override: Option<u64>,
    /// Overrides NUMA topology detection (read from `/sys/devices/system/node`
    /// when absent); set explicitly on hosts where sysfs isn't trustworthy.
    #[serde(default)]
    pub numa_override: Option<Vec<crate::types::NumaNode>>,
    #[serde(default)]
    pub gpu_indices: Vec<u32>,
    #[serde(default)]
    pub vfio_eligible_gpu_indices: Vec<u32>,
    #[serde(default)]
    pub vm_capable: bool,
    #[serde(default = "default_shared_storage_path")]
    pub shared_storage_path: String,
    #[serde(default = "default_local_temp_path")]
    pub local_temp_path: String,
}

impl AgentConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read agent config file at '{path}'"))?;
        let config: AgentConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(anyhow!("hostname cannot be empty"));
        }
        if self.host_url.trim().is_empty() {
            return Err(anyhow!("host_url cannot be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7070
}
fn default_agent_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_agent_port() -> u16 {
    7071
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_db_path() -> String {
    "fleetd.db".to_string()
}
fn default_heartbeat_interval_secs() -> u64 {
    5
}
fn default_heartbeat_timeout_factor() -> u64 {
    6
}
fn default_cleanup_interval_secs() -> u64 {
    10
}
fn default_dispatch_timeout_command_secs() -> u64 {
    30
}
fn default_dispatch_timeout_vps_secs() -> u64 {
    60
}
fn default_suspicion_threshold() -> u32 {
    3
}
fn default_reservation_ttl_secs() -> u64 {
    300
}
fn default_reservation_sweep_interval_secs() -> u64 {
    60
}
fn default_overlay_subnet() -> String {
    "10.128.0.0/9/9/14".to_string()
}
fn default_overlay_base_vni() -> u32 {
    100
}
fn default_overlay_port() -> u16 {
    4789
}
fn default_overlay_mtu() -> u32 {
    1450
}
fn default_shared_storage_path() -> String {
    "/shared".to_string()
}
fn default_local_temp_path() -> String {
    "/local_temp".to_string()
}
