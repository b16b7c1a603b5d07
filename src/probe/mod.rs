//! Path probing.
//!
//! The ICMP transport and the tunnel device inventory live outside this
//! crate and are reached through the [`Pinger`] and [`DeviceInventory`]
//! traits. [`probe_devices`] runs one task per tunnel interface and waits
//! for every one of them; [`ProbeScheduler`] drives probe rounds and route
//! commits on fixed intervals.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::events::{StatusEvent, StatusSink};
use crate::metrics::PathMetricStore;
use crate::router::Router;

/// Sends probes through one tunnel interface.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Probe every target `count` times and report the tallies.
    async fn ping(&self, ifname: &str, targets: &[IpAddr], count: u32) -> Result<PathMetricStore>;
}

/// Source of the tunnel devices to probe.
pub trait DeviceInventory: Send + Sync {
    fn devices(&self) -> Result<Vec<TunnelDevice>>;
}

/// One remote peer of a tunnel device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelPeer {
    pub public_key: String,
    pub allowed_ips: Vec<IpNet>,
}

/// A tunnel interface and its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDevice {
    pub ifname: String,
    pub public_key: String,
    pub peers: Vec<TunnelPeer>,
}

impl TunnelDevice {
    /// Addresses to probe: the first allowed IP of every peer.
    pub fn probe_targets(&self) -> Vec<IpAddr> {
        self.peers
            .iter()
            .filter_map(|p| p.allowed_ips.first())
            .map(IpNet::addr)
            .collect()
    }
}

/// Inventory with a fixed, replaceable device list.
#[derive(Debug, Default)]
pub struct StaticInventory {
    devices: RwLock<Vec<TunnelDevice>>,
}

impl StaticInventory {
    pub fn new(devices: Vec<TunnelDevice>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    pub fn set_devices(&self, devices: Vec<TunnelDevice>) {
        *self.devices.write() = devices;
    }
}

impl DeviceInventory for StaticInventory {
    fn devices(&self) -> Result<Vec<TunnelDevice>> {
        Ok(self.devices.read().clone())
    }
}

/// Probe all devices concurrently and merge the results.
///
/// Every interface gets `timeout` to answer. Targets of an interface that
/// failed or timed out are reported as fully lost.
pub async fn probe_devices(
    pinger: Arc<dyn Pinger>,
    devices: &[TunnelDevice],
    count: u32,
    timeout: Duration,
) -> PathMetricStore {
    let mut tasks = JoinSet::new();

    for device in devices {
        let targets = device.probe_targets();
        if targets.is_empty() {
            continue;
        }

        let pinger = Arc::clone(&pinger);
        let ifname = device.ifname.clone();
        tasks.spawn(async move {
            let result = match tokio::time::timeout(timeout, pinger.ping(&ifname, &targets, count)).await {
                Ok(result) => result,
                Err(_) => Err(Error::ProbeTimeout(ifname.clone())),
            };
            (ifname, targets, result)
        });
    }

    let spawned = tasks.len();
    let mut store = PathMetricStore::new();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, _, Ok(result))) => store.append(&result),
            Ok((ifname, targets, Err(e))) => {
                warn!(interface = %ifname, error = %e, "Probe failed");
                for target in targets {
                    for _ in 0..count {
                        store.record_sent(target);
                    }
                }
            }
            Err(e) => error!(error = %e, "Probe task failed"),
        }
    }

    debug!(interfaces = spawned, targets = store.len(), "Probe round complete");
    store
}

/// Periodic probing and route commits.
///
/// Router calls reach the [`RouteAdapter`](crate::netcfg::RouteAdapter),
/// which may block, so they run on the blocking pool.
pub struct ProbeScheduler {
    router: Arc<Router>,
    inventory: Arc<dyn DeviceInventory>,
    pinger: Arc<dyn Pinger>,
    sink: Arc<dyn StatusSink>,
    config: ProbeConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProbeScheduler {
    pub fn new(
        router: Arc<Router>,
        inventory: Arc<dyn DeviceInventory>,
        pinger: Arc<dyn Pinger>,
        sink: Arc<dyn StatusSink>,
        config: ProbeConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            router,
            inventory,
            pinger,
            sink,
            config,
            shutdown_tx,
        }
    }

    /// Run one probe round and feed it to the router.
    pub async fn run_once(&self) -> Result<PathMetricStore> {
        let devices = self.inventory.devices()?;
        if devices.is_empty() {
            return Ok(PathMetricStore::new());
        }

        let store = probe_devices(
            Arc::clone(&self.pinger),
            &devices,
            self.config.count,
            self.config.timeout,
        )
        .await;

        // Route adapters may shell out, keep them off the runtime workers
        let router = Arc::clone(&self.router);
        let store = tokio::task::spawn_blocking(move || {
            router.ping_process(&store);
            store
        })
        .await
        .map_err(|e| Error::Internal(format!("ping processing task failed: {e}")))?;

        let quality = store.quality_report();
        if !quality.is_empty() {
            self.sink.emit(StatusEvent::PeerQuality(quality));
        }

        Ok(store)
    }

    /// Start the probe and apply loops.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut probe_ticker = tokio::time::interval(this.config.interval);
            let mut apply_ticker = tokio::time::interval(this.config.apply_interval);
            probe_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            apply_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval = ?this.config.interval,
                apply_interval = ?this.config.apply_interval,
                "Probe scheduler started"
            );

            loop {
                tokio::select! {
                    _ = probe_ticker.tick() => {
                        if let Err(e) = this.run_once().await {
                            warn!(error = %e, "Probe round failed");
                        }
                    }
                    _ = apply_ticker.tick() => {
                        let router = Arc::clone(&this.router);
                        match tokio::task::spawn_blocking(move || router.apply()).await {
                            Ok(report) if !report.is_empty() => {
                                debug!(
                                    routes = report.route_status.len(),
                                    changes = report.peer_active.len(),
                                    passes = report.passes,
                                    "Routes applied"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Apply task failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Probe scheduler stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the loops started by [`ProbeScheduler::start`].
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
