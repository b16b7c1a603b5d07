//! Per-address probe statistics.

use std::collections::btree_map::{self, BTreeMap};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::quality::PathQuality;

/// Probe tallies for one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PathSample {
    /// Probes transmitted.
    tx: u64,
    /// Replies received.
    rx: u64,
    /// Round-trip time of the most recent reply (ms).
    rtt: f32,
    /// Average round-trip time over all received replies (ms).
    avg_rtt: f32,
}

impl PathSample {
    /// Build a sample from raw tallies.
    pub fn from_parts(tx: u64, rx: u64, rtt: f32, avg_rtt: f32) -> Self {
        Self { tx, rx, rtt, avg_rtt }
    }

    pub fn tx(&self) -> u64 {
        self.tx
    }

    pub fn rx(&self) -> u64 {
        self.rx
    }

    /// Most recent single-probe round-trip time (ms).
    pub fn rtt(&self) -> f32 {
        self.rtt
    }

    /// Average round-trip time (ms), zero when nothing was received.
    pub fn latency(&self) -> f32 {
        if self.rx > 0 {
            self.avg_rtt
        } else {
            0.0
        }
    }

    /// Packet loss ratio in `[0, 1]`.
    ///
    /// No transmitted probes means no data, which is reported as zero loss.
    /// Receive counters may run ahead of transmit counters on duplicated
    /// replies, so the ratio is clamped.
    pub fn loss(&self) -> f32 {
        if self.tx == 0 {
            return 0.0;
        }
        let ratio = self.rx as f64 / self.tx as f64;
        (1.0 - ratio).clamp(0.0, 1.0) as f32
    }

    /// A sample without transmitted probes carries no information.
    pub fn is_valid(&self) -> bool {
        self.tx > 0
    }

    fn record_sent(&mut self) {
        self.tx = self.tx.saturating_add(1);
    }

    fn record_reply(&mut self, rtt_ms: f32) {
        self.rx = self.rx.saturating_add(1);
        self.rtt = rtt_ms;
        let n = self.rx as f64;
        self.avg_rtt = ((f64::from(self.avg_rtt) * (n - 1.0) + f64::from(rtt_ms)) / n) as f32;
    }

    /// Merge another sample into this one.
    ///
    /// Counters are summed, the latest rtt is taken from `other`, and the
    /// averages are combined weighted by their received counts.
    fn merge(&mut self, other: &PathSample) {
        let rx_total = self.rx.saturating_add(other.rx);

        if other.rx > 0 {
            if self.rx == 0 {
                self.avg_rtt = other.avg_rtt;
            } else {
                let weighted = f64::from(self.avg_rtt) * self.rx as f64
                    + f64::from(other.avg_rtt) * other.rx as f64;
                self.avg_rtt = (weighted / rx_total as f64) as f32;
            }
        }

        self.tx = self.tx.saturating_add(other.tx);
        self.rx = rx_total;
        self.rtt = other.rtt;
    }
}

/// Address keyed probe statistics, filled by one or more probe rounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathMetricStore {
    entries: BTreeMap<IpAddr, PathSample>,
}

impl PathMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address. Registering it again keeps the existing tallies.
    pub fn add(&mut self, addr: IpAddr) {
        self.entries.entry(addr).or_default();
    }

    pub fn get(&self, addr: &IpAddr) -> Option<&PathSample> {
        self.entries.get(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite the tallies of one address.
    pub fn insert(&mut self, addr: IpAddr, sample: PathSample) {
        self.entries.insert(addr, sample);
    }

    /// Count one transmitted probe.
    pub fn record_sent(&mut self, addr: IpAddr) {
        self.entries.entry(addr).or_default().record_sent();
    }

    /// Count one received reply with its round-trip time.
    pub fn record_reply(&mut self, addr: IpAddr, rtt_ms: f32) {
        self.entries.entry(addr).or_default().record_reply(rtt_ms);
    }

    /// Traverse all address/sample pairs once.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.entries.iter(),
        }
    }

    /// Merge all entries of `other` into this store.
    pub fn append(&mut self, other: &PathMetricStore) {
        for (addr, sample) in &other.entries {
            self.entries.entry(*addr).or_default().merge(sample);
        }
    }

    /// Start a new measurement cycle.
    ///
    /// Entries and their counters are kept so the next round keeps
    /// accumulating; only the latest single-probe rtt is cleared.
    pub fn reset(&mut self) {
        for sample in self.entries.values_mut() {
            sample.rtt = 0.0;
        }
    }

    /// Drop every entry.
    pub fn flush(&mut self) {
        self.entries.clear();
    }

    /// Quality summary of every valid sample, in address order.
    pub fn quality_report(&self) -> Vec<PathQuality> {
        self.iter()
            .filter_map(|(addr, sample)| {
                if sample.is_valid() {
                    Some(PathQuality::from_sample(addr, sample))
                } else {
                    tracing::warn!(address = %addr, "Invalid ping stats");
                    None
                }
            })
            .collect()
    }
}

/// One-shot iterator over a [`PathMetricStore`].
pub struct Iter<'a> {
    inner: btree_map::Iter<'a, IpAddr, PathSample>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (IpAddr, &'a PathSample);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(addr, sample)| (*addr, sample))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<'a> IntoIterator for &'a PathMetricStore {
    type Item = (IpAddr, &'a PathSample);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut store = PathMetricStore::new();
        assert_eq!(store.len(), 0);

        store.add(ip("127.0.0.1"));
        store.add(ip("127.0.0.1"));
        store.add(ip("127.0.0.1"));
        assert_eq!(store.len(), 1);

        for i in 2..=222u8 {
            store.add(IpAddr::from([127, 0, 0, i]));
        }
        assert_eq!(store.len(), 222);
    }

    #[test]
    fn test_add_keeps_tallies() {
        let mut store = PathMetricStore::new();
        store.record_sent(ip("10.0.0.1"));
        store.record_reply(ip("10.0.0.1"), 20.0);
        store.add(ip("10.0.0.1"));

        let sample = store.get(&ip("10.0.0.1")).unwrap();
        assert_eq!((sample.tx(), sample.rx()), (1, 1));
    }

    #[test]
    fn test_reset_and_flush() {
        let mut store = PathMetricStore::new();
        for i in 1..=10u8 {
            let addr = IpAddr::from([10, 0, 0, i]);
            store.record_sent(addr);
            store.record_reply(addr, 10.0);
        }

        store.reset();
        assert_eq!(store.len(), 10);
        let sample = store.get(&ip("10.0.0.1")).unwrap();
        assert_eq!(sample.tx(), 1);
        assert_eq!(sample.rx(), 1);
        assert_eq!(sample.rtt(), 0.0);
        assert_eq!(sample.latency(), 10.0);

        store.flush();
        assert!(store.is_empty());
    }

    #[test]
    fn test_record_running_average() {
        let mut store = PathMetricStore::new();
        let addr = ip("10.0.0.1");
        for rtt in [10.0, 20.0, 30.0] {
            store.record_sent(addr);
            store.record_reply(addr, rtt);
        }
        store.record_sent(addr);

        let sample = store.get(&addr).unwrap();
        assert_eq!(sample.tx(), 4);
        assert_eq!(sample.rx(), 3);
        assert_eq!(sample.rtt(), 30.0);
        assert!((sample.latency() - 20.0).abs() < 1e-4);
        assert!((sample.loss() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_append() {
        let mut data = PathMetricStore::new();
        data.insert(ip("192.168.1.1"), PathSample::from_parts(1, 1, 100.0, 100.0));
        data.insert(ip("192.168.1.2"), PathSample::from_parts(1, 0, 0.0, 0.0));

        let mut more = PathMetricStore::new();
        more.insert(ip("192.168.1.1"), PathSample::from_parts(2, 2, 400.0, 40.0));
        more.insert(ip("192.168.1.2"), PathSample::from_parts(1, 1, 111.0, 111.0));
        more.insert(ip("10.10.0.2"), PathSample::from_parts(1, 1, 102.0, 102.0));

        data.append(&more);

        assert_eq!(data.len(), 3);
        assert_eq!(
            data.get(&ip("192.168.1.1")),
            Some(&PathSample::from_parts(3, 3, 400.0, 60.0))
        );
        assert_eq!(
            data.get(&ip("192.168.1.2")),
            Some(&PathSample::from_parts(2, 1, 111.0, 111.0))
        );
        assert_eq!(
            data.get(&ip("10.10.0.2")),
            Some(&PathSample::from_parts(1, 1, 102.0, 102.0))
        );
        assert_eq!(data.get(&ip("10.200.200.200")), None);
    }

    #[test]
    fn test_append_counters_commute() {
        let a = PathSample::from_parts(5, 4, 10.0, 12.0);
        let b = PathSample::from_parts(7, 3, 30.0, 20.0);

        let mut ab = PathMetricStore::new();
        ab.insert(ip("10.0.0.1"), a);
        let mut other = PathMetricStore::new();
        other.insert(ip("10.0.0.1"), b);
        ab.append(&other);

        let mut ba = PathMetricStore::new();
        ba.insert(ip("10.0.0.1"), b);
        let mut other = PathMetricStore::new();
        other.insert(ip("10.0.0.1"), a);
        ba.append(&other);

        let x = ab.get(&ip("10.0.0.1")).unwrap();
        let y = ba.get(&ip("10.0.0.1")).unwrap();
        assert_eq!((x.tx(), x.rx()), (12, 7));
        assert_eq!((x.tx(), x.rx()), (y.tx(), y.rx()));
        assert!((x.latency() - y.latency()).abs() < 1e-4);
    }

    #[test]
    fn test_loss_corner_cases() {
        let max = u64::MAX;
        let cases = [
            (0, 0),
            (1, 1),
            (1, 0),
            (0, 1),
            (2, 1),
            (1, 2),
            (222, 125),
            (111, 225),
            (max, 0),
            (max, 10),
            (0, max),
            (100, max),
            (max / 2, max),
            (max, max / 2),
            (max / 2, max / 2),
            (max - 1, max),
            (max, max - 1),
            (max - 1, max - 1),
            (max, max),
        ];

        for (tx, rx) in cases {
            let loss = PathSample::from_parts(tx, rx, 0.0, 0.0).loss();
            assert!((0.0..=1.0).contains(&loss), "loss {loss} (tx: {tx}, rx: {rx})");
        }

        assert_eq!(PathSample::from_parts(0, 5, 0.0, 0.0).loss(), 0.0);
        assert_eq!(PathSample::from_parts(4, 0, 0.0, 0.0).loss(), 1.0);
        assert_eq!(PathSample::from_parts(2, 1, 0.0, 0.0).loss(), 0.5);
    }

    #[test]
    fn test_loss_random_counters() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let tx: u64 = rng.gen();
            let rx: u64 = rng.gen();
            let loss = PathSample::from_parts(tx, rx, 0.0, 0.0).loss();
            assert!((0.0..=1.0).contains(&loss), "loss {loss} (tx: {tx}, rx: {rx})");
        }
    }

    #[test]
    fn test_iter_is_one_shot() {
        let mut store = PathMetricStore::new();
        store.add(ip("10.0.0.1"));
        store.add(ip("10.0.0.2"));

        let mut iter = store.iter();
        assert_eq!(iter.by_ref().count(), 2);
        assert!(iter.next().is_none());

        // a fresh traversal sees everything again
        let addrs: Vec<_> = store.iter().map(|(addr, _)| addr).collect();
        assert_eq!(addrs, vec![ip("10.0.0.1"), ip("10.0.0.2")]);
    }

    #[test]
    fn test_quality_report_skips_invalid() {
        let mut store = PathMetricStore::new();
        store.add(ip("10.0.0.1"));
        store.insert(ip("10.0.0.2"), PathSample::from_parts(4, 4, 12.0, 10.0));

        let report = store.quality_report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].address, ip("10.0.0.2"));
    }
}
