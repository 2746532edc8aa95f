//! Spawns the Host's independent background loops (§5): scheduler sweep,
//! dispatcher sweep, liveness sweep, and the reservation sweeper.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::HostState;

pub fn spawn_all(state: &HostState, shutdown_tx: &broadcast::Sender<()>) {
    let scheduler = state.scheduler.clone();
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let assigned = scheduler.tick().await;
                    if !assigned.is_empty() {
                        debug!(count = assigned.len(), "scheduler assigned tasks this tick");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("scheduler loop shutting down");
                    break;
                }
            }
        }
    });

    let dispatcher = state.dispatcher.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        dispatcher.run(shutdown_rx).await;
    });

    let liveness = state.liveness.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        liveness.run(shutdown_rx).await;
    });

    let reservations = state.reservations.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        reservations.run_sweeper(shutdown_rx).await;
    });

    info!("all Host background loops spawned");
}
