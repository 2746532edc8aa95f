//! Interface to the VM hypervisor collaborator. Out of scope per this
//! crate's design: create/stop/query a VM by id, qcow2 overlay disks, and a
//! guest-side phone-home are all implemented by the collaborator. This
//! module specifies only the shape fleetd consumes.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    pub name: String,
    pub base_image: String,
    pub disk_size_bytes: u64,
    pub cores: u32,
    pub memory_bytes: u64,
    pub network: String,
    pub reserved_ip: Option<Ipv4Addr>,
    pub ssh_port: Option<u16>,
    pub numa_node: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Stopped,
    NotFound,
}

#[async_trait]
pub trait VmHypervisor: Send + Sync {
    async fn create(&self, req: &CreateVmRequest) -> Result<String>;

    async fn stop(&self, vm_id: &str) -> Result<()>;

    async fn query(&self, vm_id: &str) -> Result<VmState>;

    /// Restores the VM from its most recent qcow2 snapshot, if snapshotting
    /// is configured for this environment.
    async fn restore_snapshot(&self, vm_id: &str) -> Result<()>;
}
