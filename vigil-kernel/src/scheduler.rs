//! Broadcast scheduler: the fixed-interval timers driving fan-out.
//!
//! Three independent timers run for the gateway's whole lifetime,
//! regardless of how many sessions exist:
//! - every heartbeat interval: `heartbeat` to reporters (they answer with
//!   round-trip latency) and the full `machines` snapshot to clients;
//! - every eviction interval: wholesale snapshot clear, so machines that
//!   stopped reporting silently disappear from the next broadcast;
//! - every N hours: a fleet-wide `runSpeedtest` command to reporters.

use crate::config::KernelConfig;
use crate::events::OutboundEvent;
use crate::registry::{ConnectionRegistry, ROOM_CLIENTS, ROOM_REPORTERS};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, info};

pub fn epoch_ms() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

pub struct BroadcastScheduler {
    handles: Vec<JoinHandle<()>>,
}

impl BroadcastScheduler {
    /// Spawn the three timers. They hold a reference to the registry and
    /// nothing else; a slow session degrades only itself.
    pub fn start(registry: Arc<ConnectionRegistry>, cfg: &KernelConfig) -> Self {
        info!(
            heartbeat_secs = cfg.heartbeat_interval_secs,
            evict_secs = cfg.snapshot_evict_secs,
            speedtest_hours = cfg.speedtest_interval_hours,
            "starting broadcast scheduler"
        );

        let heartbeat = {
            let registry = registry.clone();
            let period = Duration::from_secs(cfg.heartbeat_interval_secs);
            tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    registry.broadcast(ROOM_REPORTERS, &OutboundEvent::Heartbeat(epoch_ms()));
                    registry
                        .broadcast(ROOM_CLIENTS, &OutboundEvent::Machines(registry.snapshot_all()));
                }
            })
        };

        // eviction and speedtest wait a full period before their first
        // fire; an immediate tick would wipe fresh data / trigger a
        // fleet-wide speedtest on every restart
        let eviction = {
            let registry = registry.clone();
            let period = Duration::from_secs(cfg.snapshot_evict_secs);
            // anchor the first tick at construction, not at first poll
            let first_tick = Instant::now() + period;
            tokio::spawn(async move {
                let mut ticker = interval_at(first_tick, period);
                loop {
                    ticker.tick().await;
                    debug!("evicting machine snapshot map");
                    registry.snapshot_clear();
                }
            })
        };

        let speedtest = {
            let registry = registry.clone();
            let period = Duration::from_secs(cfg.speedtest_interval_hours * 3600);
            let first_tick = Instant::now() + period;
            tokio::spawn(async move {
                let mut ticker = interval_at(first_tick, period);
                loop {
                    ticker.tick().await;
                    info!("requesting fleet-wide speedtest");
                    registry.broadcast(ROOM_REPORTERS, &OutboundEvent::RunSpeedtest);
                }
            })
        };

        Self { handles: vec![heartbeat, eviction, speedtest] }
    }

    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BroadcastScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
