//! Parses the `node[:numa_id][::gpu_spec]` target syntax (§4.3).

use std::collections::BTreeSet;

use crate::error::{FleetError, Result};
use crate::types::GpuRequest;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSpec {
    /// `None` means "auto-select a node".
    pub node: Option<String>,
    pub numa_node: Option<u32>,
    pub gpu: GpuRequest,
}

pub fn parse_target(raw: &str) -> Result<TargetSpec> {
    let (head, gpu_part) = match raw.split_once("::") {
        Some((h, g)) => (h, Some(g)),
        None => (raw, None),
    };

    let (node_part, numa_part) = match head.split_once(':') {
        Some((n, numa)) => (n, Some(numa)),
        None => (head, None),
    };

    let node = if node_part.is_empty() {
        None
    } else {
        Some(node_part.to_string())
    };

    let numa_node = match numa_part {
        Some(s) if !s.is_empty() => Some(s.parse::<u32>().map_err(|_| {
            FleetError::ClientInput(format!("invalid numa_id '{s}' in target '{raw}'"))
        })?),
        _ => None,
    };

    let gpu = match gpu_part {
        None => GpuRequest::None,
        Some(s) if s.is_empty() => GpuRequest::None,
        Some(s) if s.contains(',') => {
            let mut indices = BTreeSet::new();
            for part in s.split(',') {
                let idx: u32 = part.trim().parse().map_err(|_| {
                    FleetError::ClientInput(format!("invalid gpu index '{part}' in target '{raw}'"))
                })?;
                indices.insert(idx);
            }
            GpuRequest::Indices(indices)
        }
        Some(s) => {
            let count: u32 = s
                .trim()
                .parse()
                .map_err(|_| FleetError::ClientInput(format!("invalid gpu spec '{s}' in target '{raw}'")))?;
            GpuRequest::Count(count)
        }
    };

    Ok(TargetSpec {
        node,
        numa_node,
        gpu,
    })
}
