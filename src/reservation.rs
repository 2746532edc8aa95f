//! Issues and validates the self-contained IP reservation tokens used to
//! pre-commit a container address before any worker in a distributed job
//! starts (§4.8).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{FleetError, Result};
use crate::metrics;
use crate::store::NodeRegistry;
use crate::types::IpReservation;

type HmacSha256 = Hmac<Sha256>;
const SIGNATURE_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReservationPayload {
    ip: Ipv4Addr,
    runner: u32,
    exp: i64,
}

pub struct ReservationManager {
    nodes: Arc<NodeRegistry>,
    active: DashMap<Ipv4Addr, IpReservation>,
    secret: Vec<u8>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl ReservationManager {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        secret: impl Into<Vec<u8>>,
        ttl: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            nodes,
            active: DashMap::new(),
            secret: secret.into(),
            ttl,
            sweep_interval,
        }
    }

    /// Picks a free address from `hostname`'s overlay subnet (excluding the
    /// gateway and the host's address on that subnet), reserves it for the
    /// configured TTL, and returns a signed token.
    pub async fn reserve(&self, hostname: &str) -> Result<String> {
        self.sweep_expired();

        let node = self
            .nodes
            .get(hostname)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("node {hostname} not found")))?;
        let overlay = node.overlay.ok_or_else(|| {
            FleetError::Precondition(format!("node {hostname} has no overlay allocation"))
        })?;

        let reserved_offsets: std::collections::HashSet<u32> = self
            .active
            .iter()
            .filter(|e| overlay.subnet.contains(*e.key()))
            .map(|e| u32::from(*e.key()) - overlay.subnet.base_u32())
            .collect();

        let top = 1u32 << overlay.subnet.host_bits();
        let excluded = [0u32, 1, top.saturating_sub(2), top.saturating_sub(1)];

        let offset = (2..top.saturating_sub(2))
            .find(|o| !excluded.contains(o) && !reserved_offsets.contains(o))
            .ok_or_else(|| {
                FleetError::ResourceExhaustion(format!(
                    "no free addresses left in {hostname}'s overlay subnet"
                ))
            })?;
        let ip = overlay.subnet.nth(offset);

        let expires_at = Utc::now() + chrono::Duration::from_std(self.ttl).unwrap();
        self.active.insert(
            ip,
            IpReservation {
                ip,
                runner_id: overlay.runner_id,
                expires_at,
            },
        );
        metrics::IP_RESERVATIONS_ACTIVE.set(self.active.len() as f64);

        let token = self.sign(&ReservationPayload {
            ip,
            runner: overlay.runner_id,
            exp: expires_at.timestamp(),
        });
        info!(hostname, %ip, "issued IP reservation token");
        Ok(token)
    }

    /// Decodes and verifies a token, checking expiry and that the
    /// (ip, runner) pair still matches a live reservation.
    pub fn validate(&self, token: &str) -> Result<IpReservation> {
        let payload = self.verify_and_decode(token)?;

        if payload.exp <= Utc::now().timestamp() {
            return Err(FleetError::ClientInput("reservation token expired".into()));
        }

        let entry = self
            .active
            .get(&payload.ip)
            .ok_or_else(|| FleetError::ClientInput("reservation no longer active".into()))?;
        if entry.runner_id != payload.runner {
            return Err(FleetError::ClientInput(
                "reservation token does not match current allocation".into(),
            ));
        }

        Ok(entry.clone())
    }

    /// Called once the scheduler has committed the task carrying this
    /// reservation, or when the task finishes, to free the address early.
    pub fn release(&self, ip: Ipv4Addr) {
        if self.active.remove(&ip).is_some() {
            metrics::IP_RESERVATIONS_ACTIVE.set(self.active.len() as f64);
        }
    }

    /// Releases a reservation by its token rather than its address, used by
    /// the client-facing release endpoint (which only ever sees the token).
    pub fn release_token(&self, token: &str) -> Result<()> {
        let reservation = self.validate(token)?;
        self.release(reservation.ip);
        Ok(())
    }

    /// Snapshot of every currently active reservation, for the client-facing
    /// listing endpoint.
    pub fn list(&self) -> Vec<IpReservation> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        let before = self.active.len();
        self.active.retain(|_, r| r.expires_at > now);
        let removed = before - self.active.len();
        if removed > 0 {
            debug!(removed, "swept expired IP reservations");
            metrics::IP_RESERVATIONS_ACTIVE.set(self.active.len() as f64);
        }
    }

    fn sign(&self, payload: &ReservationPayload) -> String {
        let payload_bytes = serde_json::to_vec(payload).expect("payload always serializes");
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(&payload_bytes);
        let sig = mac.finalize().into_bytes();

        let mut buf = payload_bytes;
        buf.extend_from_slice(&sig);
        BASE64.encode(buf)
    }

    fn verify_and_decode(&self, token: &str) -> Result<ReservationPayload> {
        let raw = BASE64
            .decode(token)
            .map_err(|_| FleetError::ClientInput("malformed reservation token".into()))?;
        if raw.len() <= SIGNATURE_LEN {
            return Err(FleetError::ClientInput("malformed reservation token".into()));
        }
        let (payload_bytes, sig_bytes) = raw.split_at(raw.len() - SIGNATURE_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(payload_bytes);
        mac.verify_slice(sig_bytes)
            .map_err(|_| FleetError::ClientInput("reservation token signature invalid".into()))?;

        serde_json::from_slice(payload_bytes)
            .map_err(|_| FleetError::ClientInput("malformed reservation token payload".into()))
    }

    pub async fn run_sweeper(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep_expired(),
                _ = shutdown_rx.recv() => {
                    info!("reservation sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Liveness, Node, NodeCapacity, OverlayAllocation};

    async fn node_with_overlay(hostname: &str, runner_id: u32) -> Node {
        let layout = crate::config::OverlaySubnetLayout::parse("10.128.0.0/9/9/14").unwrap();
        let subnet = layout.runner_subnet(runner_id);
        Node {
            hostname: hostname.into(),
            address: format!("{hostname}.local"),
            capacity: NodeCapacity::default(),
            last_heartbeat: Utc::now(),
            liveness: Liveness::Online,
            vm_capable: false,
            runner_version: "t".into(),
            overlay: Some(OverlayAllocation {
                runner_id,
                subnet,
                gateway_ip: subnet.nth(1),
                vni: 100 + runner_id,
                tunnel_endpoint: "fleetd-ovl-x".into(),
                runner_physical_ip: "10.0.0.5".into(),
                last_active: Utc::now(),
                placeholder: false,
            }),
            labels: Default::default(),
        }
    }

    #[tokio::test]
    async fn p_reservation_round_trips_and_checks_liveness() {
        let conn = crate::store::open_in_memory().unwrap();
        let nodes = Arc::new(NodeRegistry::load(conn).unwrap());
        nodes.upsert(node_with_overlay("r1", 2).await).await.unwrap();

        let manager = ReservationManager::new(
            nodes,
            b"test-secret".to_vec(),
            Duration::from_secs(300),
            Duration::from_secs(60),
        );
        let token = manager.reserve("r1").await.unwrap();
        let reservation = manager.validate(&token).unwrap();
        assert_eq!(reservation.runner_id, 2);
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let conn = crate::store::open_in_memory().unwrap();
        let nodes = Arc::new(NodeRegistry::load(conn).unwrap());
        nodes.upsert(node_with_overlay("r1", 2).await).await.unwrap();
        let manager = ReservationManager::new(
            nodes,
            b"test-secret".to_vec(),
            Duration::from_secs(300),
            Duration::from_secs(60),
        );
        let token = manager.reserve("r1").await.unwrap();
        let mut tampered = token.clone();
        tampered.push('A');
        assert!(manager.validate(&tampered).is_err());
    }

    #[tokio::test]
    async fn released_reservation_fails_validation() {
        let conn = crate::store::open_in_memory().unwrap();
        let nodes = Arc::new(NodeRegistry::load(conn).unwrap());
        nodes.upsert(node_with_overlay("r1", 2).await).await.unwrap();
        let manager = ReservationManager::new(
            nodes,
            b"test-secret".to_vec(),
            Duration::from_secs(300),
            Duration::from_secs(60),
        );
        let token = manager.reserve("r1").await.unwrap();
        let reservation = manager.validate(&token).unwrap();
        manager.release(reservation.ip);
        assert!(manager.validate(&token).is_err());
    }
}
