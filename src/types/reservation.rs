use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A short-lived, in-memory pre-commitment of a container ip on a
/// specific runner (§3 "IP Reservation", §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpReservation {
    pub ip: Ipv4Addr,
    pub runner_id: u32,
    pub expires_at: DateTime<Utc>,
}
