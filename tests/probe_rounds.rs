//! Probe Round Tests
//!
//! Runs the probe scheduler against a scripted pinger and an in-memory
//! routing table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::RwLock;

use sdnroute::config::{ProbeConfig, RouterConfig};
use sdnroute::events::{BroadcastSink, StatusEvent};
use sdnroute::metrics::{PathMetricStore, PeerStatus};
use sdnroute::netcfg::MemoryRouteTable;
use sdnroute::probe::{Pinger, ProbeScheduler, StaticInventory, TunnelDevice, TunnelPeer};
use sdnroute::{ConnectionId, Error, GroupId, NetworkPath, Result, Router};

// ============================================================================
// Scripted pinger
// ============================================================================

/// Answers with a fixed rtt per interface; interfaces without one fail.
#[derive(Default)]
struct ScriptedPinger {
    rtt: RwLock<HashMap<String, f32>>,
}

impl ScriptedPinger {
    fn set(&self, ifname: &str, rtt: f32) {
        self.rtt.write().insert(ifname.to_string(), rtt);
    }
}

#[async_trait]
impl Pinger for ScriptedPinger {
    async fn ping(&self, ifname: &str, targets: &[IpAddr], count: u32) -> Result<PathMetricStore> {
        let Some(rtt) = self.rtt.read().get(ifname).copied() else {
            return Err(Error::Probe {
                ifname: ifname.into(),
                reason: "interface down".into(),
            });
        };

        let mut store = PathMetricStore::new();
        for target in targets {
            for _ in 0..count {
                store.record_sent(*target);
                store.record_reply(*target, rtt);
            }
        }
        Ok(store)
    }
}

// ============================================================================
// Helpers
// ============================================================================

const LAN: &str = "192.168.1.0/24";

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn device(ifname: &str, peer: &str) -> TunnelDevice {
    TunnelDevice {
        ifname: ifname.into(),
        public_key: format!("{ifname}-key"),
        peers: vec![TunnelPeer {
            public_key: format!("{peer}-key"),
            allowed_ips: vec![net(&format!("{peer}/32")), net(LAN)],
        }],
    }
}

struct Setup {
    scheduler: Arc<ProbeScheduler>,
    router: Arc<Router>,
    table: Arc<MemoryRouteTable>,
    pinger: Arc<ScriptedPinger>,
    sink: BroadcastSink,
}

fn setup() -> Setup {
    let table = Arc::new(MemoryRouteTable::new());
    let sink = BroadcastSink::new(64);
    let router = Arc::new(Router::new(
        RouterConfig {
            window_size: 4,
            ..RouterConfig::default()
        },
        table.clone(),
        Arc::new(sink.clone()),
    ));

    for (conn, gw) in [(1, "10.0.0.1"), (2, "10.0.0.2")] {
        let path = NetworkPath::new(
            format!("wg{conn}"),
            format!("peer-{conn}"),
            gw.parse().unwrap(),
            ConnectionId(conn),
            GroupId(1),
        );
        router.route_add(&path, &[net(&format!("{gw}/32")), net(LAN)]);
    }

    let inventory = Arc::new(StaticInventory::new(vec![
        device("wg1", "10.0.0.1"),
        device("wg2", "10.0.0.2"),
    ]));
    let pinger = Arc::new(ScriptedPinger::default());

    let scheduler = Arc::new(ProbeScheduler::new(
        router.clone(),
        inventory,
        pinger.clone(),
        Arc::new(sink.clone()),
        ProbeConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1),
            apply_interval: Duration::from_secs(10),
            count: 3,
        },
    ));

    Setup {
        scheduler,
        router,
        table,
        pinger,
        sink,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_run_once_feeds_router() {
    let s = setup();
    s.router.apply();
    assert_eq!(s.table.route_via(&net(LAN)).as_deref(), Some("wg1"));

    s.pinger.set("wg1", 90.0);
    s.pinger.set("wg2", 30.0);
    let mut rx = s.sink.subscribe();

    let store = s.scheduler.run_once().await.unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(s.table.route_via(&net(LAN)).as_deref(), Some("wg2"));

    assert!(matches!(rx.recv().await.unwrap(), StatusEvent::PeerActiveData(_)));
    match rx.recv().await.unwrap() {
        StatusEvent::PeerQuality(quality) => {
            assert_eq!(quality.len(), 2);
            assert!(quality.iter().all(|q| q.status == PeerStatus::Connected));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_dead_interface_loses_traffic() {
    let s = setup();
    s.router.apply();
    s.pinger.set("wg1", 10.0);
    s.pinger.set("wg2", 50.0);
    s.scheduler.run_once().await.unwrap();
    assert_eq!(s.table.route_via(&net(LAN)).as_deref(), Some("wg1"));

    // wg1 stops answering: its targets are reported as lost
    s.pinger.rtt.write().remove("wg1");
    let mut rx = s.sink.subscribe();
    let store = s.scheduler.run_once().await.unwrap();

    assert_eq!(store.get(&"10.0.0.1".parse().unwrap()).unwrap().loss(), 1.0);
    assert_eq!(s.table.route_via(&net(LAN)).as_deref(), Some("wg2"));

    let _ = rx.recv().await.unwrap();
    match rx.recv().await.unwrap() {
        StatusEvent::PeerQuality(quality) => {
            let lost = quality.iter().find(|q| q.address.to_string() == "10.0.0.1").unwrap();
            assert!(matches!(lost.status, PeerStatus::Offline(_)));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_loop_until_shutdown() {
    let s = setup();
    s.pinger.set("wg1", 40.0);
    s.pinger.set("wg2", 40.0);

    let handle = s.scheduler.start();
    tokio::time::sleep(Duration::from_secs(31)).await;

    // the apply ticker committed the pending routes
    assert_eq!(s.table.len(), 3);
    assert!(s.router.has_route(&net(LAN)));

    s.scheduler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
