//! Closed-schema data model shared by the Host and the Runner Agent.
//!
//! Every field named in the design is represented by an explicit Rust type;
//! there are no free-form dynamic maps at the API boundary. Structured
//! columns that the store keeps as serialized text (argument lists, env
//! maps, gpu index sets, mount lists, NUMA topology) round-trip through
//! `encode`/`decode_or_default` pairs defined alongside each type, so a
//! corrupted row degrades to an empty value instead of poisoning a query.

pub mod net;
pub mod node;
pub mod overlay;
pub mod reservation;
pub mod task;

pub use net::Ipv4Cidr;
pub use node::{GpuDescriptor, Liveness, Node, NodeCapacity, NumaNode};
pub use overlay::OverlayAllocation;
pub use reservation::IpReservation;
pub use task::{
    ApprovalState, BindMount, GpuRequest, PrincipalTier, ResourceRequest, Task, TaskId, TaskKind,
    TaskStatus, VpsBackend,
};

/// Decodes a JSON-serialized column, returning the type's default on any
/// parse failure rather than propagating an error. Used for every
/// "JSON-ish" column in the Task Store and Node Registry.
pub fn decode_or_default<T>(raw: &str) -> T
where
    T: Default + serde::de::DeserializeOwned,
{
    if raw.is_empty() {
        return T::default();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

/// Encodes a value as the JSON text stored in a column.
pub fn encode<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
