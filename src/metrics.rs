//! Prometheus metrics for the Host and the Runner Agent.
//!
//! Registered once, globally, via `lazy_static`.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
};

lazy_static! {
    pub static ref TASKS_SUBMITTED_TOTAL: Counter = register_counter!(
        "fleetd_tasks_submitted_total",
        "Total number of tasks submitted."
    )
    .unwrap();
    pub static ref TASKS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "fleetd_tasks_by_status",
        "Current number of tasks in each status.",
        &["status"]
    )
    .unwrap();
    pub static ref SCHEDULING_LATENCY_SECONDS: Histogram = register_histogram!(
        "fleetd_scheduling_latency_seconds",
        "Time from PENDING to ASSIGNING for a task."
    )
    .unwrap();
    pub static ref SCHEDULER_SWEEPS_TOTAL: Counter = register_counter!(
        "fleetd_scheduler_sweeps_total",
        "Total number of scheduler tick sweeps performed."
    )
    .unwrap();
    pub static ref LIVENESS_SWEEPS_TOTAL: Counter = register_counter!(
        "fleetd_liveness_sweeps_total",
        "Total number of liveness monitor sweeps performed."
    )
    .unwrap();
    pub static ref NODES_MARKED_OFFLINE_TOTAL: Counter = register_counter!(
        "fleetd_nodes_marked_offline_total",
        "Total number of times a node transitioned ONLINE -> OFFLINE."
    )
    .unwrap();
    pub static ref TASKS_MARKED_LOST_TOTAL: Counter = register_counter!(
        "fleetd_tasks_marked_lost_total",
        "Total number of tasks transitioned to LOST by the liveness monitor."
    )
    .unwrap();
    pub static ref DISPATCH_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "fleetd_dispatch_failures_total",
        "Total number of failed dispatch RPCs, labeled by RPC kind.",
        &["rpc"]
    )
    .unwrap();
    pub static ref SUSPICION_REQUEUES_TOTAL: Counter = register_counter!(
        "fleetd_suspicion_requeues_total",
        "Total number of tasks reverted from ASSIGNING to PENDING by the suspicion protocol."
    )
    .unwrap();
    pub static ref OVERLAY_ALLOCATIONS_ACTIVE: Gauge = register_gauge!(
        "fleetd_overlay_allocations_active",
        "Current number of active (non-placeholder) overlay allocations."
    )
    .unwrap();
    pub static ref OVERLAY_POOL_EXHAUSTED_TOTAL: Counter = register_counter!(
        "fleetd_overlay_pool_exhausted_total",
        "Total number of times the overlay runner-id pool was full at allocation time."
    )
    .unwrap();
    pub static ref IP_RESERVATIONS_ACTIVE: Gauge = register_gauge!(
        "fleetd_ip_reservations_active",
        "Current number of unexpired IP reservations."
    )
    .unwrap();
    pub static ref NODES_ONLINE: Gauge =
        register_gauge!("fleetd_nodes_online", "Current number of ONLINE nodes.").unwrap();
}

pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
