use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::overlay::OverlayAllocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Liveness {
    Online,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDescriptor {
    pub index: u32,
    pub vfio_eligible: bool,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNode {
    pub id: u32,
    pub cpu_indices: Vec<u32>,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub cores: u32,
    pub memory_bytes: u64,
    pub gpus: Vec<GpuDescriptor>,
    pub numa: Vec<NumaNode>,
}

/// A registered runner. `hostname` is the primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub address: String,
    pub capacity: NodeCapacity,
    pub last_heartbeat: DateTime<Utc>,
    pub liveness: Liveness,
    pub vm_capable: bool,
    pub runner_version: String,
    pub overlay: Option<OverlayAllocation>,
    /// Static, operator-set informational tags (rack, zone, ...). Never
    /// used as a hard scheduling constraint.
    pub labels: BTreeMap<String, String>,
}

impl Node {
    pub fn declared_gpu_indices(&self) -> std::collections::BTreeSet<u32> {
        self.capacity.gpus.iter().map(|g| g.index).collect()
    }

    pub fn has_numa_node(&self, id: u32) -> bool {
        self.capacity.numa.iter().any(|n| n.id == id)
    }
}
