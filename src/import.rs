//! Import engine: reconciles connected interface prefixes into the RIB.
//!
//! A timer-driven poller by design: every tick each rule's interface list
//! is scanned and the difference against the advertised set is submitted as
//! adds and withdraws. The fixed cadence is also the retry policy; a failed
//! submission leaves the advertised set untouched so the next tick retries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::kernel::Kernel;
use crate::rib::{Path, PathSource};
use crate::scanner::connected_routes;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// One import scope: a VRF (or "" for the global table) and the literal
/// interface names to scan for it. Selectors are pre-expanded; the engine
/// never sees glob patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRule {
    pub vrf: String,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportStats {
    pub imported: u64,
    pub withdrawn: u64,
    pub errors: u64,
    pub last_import: Option<DateTime<Utc>>,
    pub last_withdraw: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_msg: Option<String>,
}

pub struct ImportEngine {
    kernel: Arc<dyn Kernel>,
    rib: Arc<dyn PathSource>,
    rules: RwLock<Vec<ImportRule>>,
    /// vrf -> prefix -> path currently advertised into the RIB. The mutex
    /// also serializes whole scan cycles.
    advertised: Mutex<HashMap<String, HashMap<String, Path>>>,
    stats: RwLock<ImportStats>,
    scan_interval: Duration,
}

impl ImportEngine {
    pub fn new(
        kernel: Arc<dyn Kernel>,
        rib: Arc<dyn PathSource>,
        rules: Vec<ImportRule>,
        scan_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            rib,
            rules: RwLock::new(rules),
            advertised: Mutex::new(HashMap::new()),
            stats: RwLock::new(ImportStats::default()),
            scan_interval,
        })
    }

    /// Replace the rule set. Interface lists are never mutated in place.
    pub fn set_rules(&self, rules: Vec<ImportRule>) {
        *self.rules.write().unwrap() = rules;
    }

    pub fn rules(&self) -> Vec<ImportRule> {
        self.rules.read().unwrap().clone()
    }

    pub fn stats(&self) -> ImportStats {
        self.stats.read().unwrap().clone()
    }

    /// Run the scanner until shutdown. The first tick fires immediately.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(engine.scan_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.rescan().await,
                    _ = shutdown.changed() => {
                        debug!("import scanner exiting");
                        return;
                    }
                }
            }
        })
    }

    /// Scan every rule now. Also invoked on VRF lifecycle events and rule
    /// replacement.
    pub async fn rescan(&self) {
        let rules = self.rules.read().unwrap().clone();
        for rule in rules {
            self.scan_rule(&rule).await;
        }
    }

    async fn scan_rule(&self, rule: &ImportRule) {
        // Interface I/O happens before any state is looked at
        let mut current: HashMap<String, Path> = HashMap::new();
        for interface in &rule.interfaces {
            match connected_routes(self.kernel.as_ref(), interface).await {
                Ok(routes) => {
                    for route in routes {
                        let path = Path::connected(route.prefix, interface);
                        current.insert(path.prefix().to_string(), path);
                    }
                }
                Err(err) => {
                    // Skip this interface; the rest of the scan proceeds
                    warn!(
                        "failed to scan interface {} for vrf {:?}: {}",
                        interface, rule.vrf, err
                    );
                }
            }
        }

        let mut advertised = self.advertised.lock().await;
        let known = advertised.entry(rule.vrf.clone()).or_default();
        let adds: Vec<Path> = current
            .iter()
            .filter(|(prefix, _)| !known.contains_key(*prefix))
            .map(|(_, path)| path.clone())
            .collect();
        let withdraws: Vec<Path> = known
            .iter()
            .filter(|(prefix, _)| !current.contains_key(*prefix))
            .map(|(prefix, path)| {
                debug!(
                    "withdrawing connected route {} from vrf {:?}",
                    prefix, rule.vrf
                );
                path.clone_as_withdraw()
            })
            .collect();

        if !adds.is_empty() {
            if let Err(err) = self.rib.add_paths(&rule.vrf, adds.clone()).await {
                self.record_error(format!("add paths failed for vrf {:?}: {}", rule.vrf, err));
                warn!("failed to add connected routes for vrf {:?}: {}", rule.vrf, err);
                return;
            }
        }
        if !withdraws.is_empty() {
            if let Err(err) = self.rib.add_paths(&rule.vrf, withdraws.clone()).await {
                self.record_error(format!(
                    "withdraw paths failed for vrf {:?}: {}",
                    rule.vrf, err
                ));
                warn!(
                    "failed to withdraw connected routes for vrf {:?}: {}",
                    rule.vrf, err
                );
                return;
            }
        }

        advertised.insert(rule.vrf.clone(), current);

        if !adds.is_empty() || !withdraws.is_empty() {
            let mut stats = self.stats.write().unwrap();
            if !adds.is_empty() {
                stats.imported += adds.len() as u64;
                stats.last_import = Some(Utc::now());
            }
            if !withdraws.is_empty() {
                stats.withdrawn += withdraws.len() as u64;
                stats.last_withdraw = Some(Utc::now());
            }
        }
    }

    fn record_error(&self, msg: String) {
        let mut stats = self.stats.write().unwrap();
        stats.errors += 1;
        stats.last_error = Some(Utc::now());
        stats.last_error_msg = Some(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use ipnetwork::IpNetwork;

    use crate::kernel::mock::MockKernel;
    use crate::kernel::LinkKind;
    use crate::rib::memory::MemoryRib;

    fn addr(s: &str) -> (IpNetwork, std::net::IpAddr) {
        let net: IpNetwork = s.parse().unwrap();
        (net, net.ip())
    }

    fn global_rule(interfaces: &[&str]) -> ImportRule {
        ImportRule {
            vrf: String::new(),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_global_import() {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_link(2, "test-eth0", LinkKind::Device, None);
        kernel.set_addresses(
            "test-eth0",
            vec![addr("192.168.100.1/24"), addr("fd00:100::1/64")],
        );
        let rib = Arc::new(MemoryRib::new());
        let engine = ImportEngine::new(
            kernel as Arc<dyn Kernel>,
            rib.clone() as Arc<dyn PathSource>,
            vec![global_rule(&["test-eth0"])],
            DEFAULT_SCAN_INTERVAL,
        );

        engine.rescan().await;

        assert!(rib.contains("", "192.168.100.0/24"));
        assert!(rib.contains("", "fd00:100::/64"));
        // Both paths are tagged as locally-originated from the interface
        for path in rib.paths_in("") {
            let peer = path.peer().unwrap();
            assert_eq!(peer.interface, "test-eth0");
            assert!(peer.netlink_sourced);
            assert!(path.nexthop().is_unspecified());
        }
        assert_eq!(engine.stats().imported, 2);

        // A second scan with unchanged interfaces submits nothing
        let calls = rib.add_calls.load(Ordering::SeqCst);
        engine.rescan().await;
        assert_eq!(rib.add_calls.load(Ordering::SeqCst), calls);
        assert_eq!(engine.stats().imported, 2);
    }

    #[tokio::test]
    async fn test_vrf_import() {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_link(3, "test-eth1", LinkKind::Device, None);
        kernel.set_addresses("test-eth1", vec![addr("192.168.101.1/24")]);
        let rib = Arc::new(MemoryRib::new());
        let engine = ImportEngine::new(
            kernel as Arc<dyn Kernel>,
            rib.clone() as Arc<dyn PathSource>,
            vec![ImportRule {
                vrf: "test-vrf".to_string(),
                interfaces: vec!["test-eth1".to_string()],
            }],
            DEFAULT_SCAN_INTERVAL,
        );

        engine.rescan().await;

        assert!(rib.contains("test-vrf", "192.168.101.0/24"));
        assert!(!rib.contains("", "192.168.101.0/24"));
    }

    #[tokio::test]
    async fn test_withdraw_on_disappearance() {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_link(2, "test-eth0", LinkKind::Device, None);
        kernel.set_addresses(
            "test-eth0",
            vec![addr("192.168.100.1/24"), addr("192.168.200.1/24")],
        );
        let rib = Arc::new(MemoryRib::new());
        let engine = ImportEngine::new(
            kernel.clone() as Arc<dyn Kernel>,
            rib.clone() as Arc<dyn PathSource>,
            vec![global_rule(&["test-eth0"])],
            DEFAULT_SCAN_INTERVAL,
        );

        engine.rescan().await;
        assert!(rib.contains("", "192.168.200.0/24"));

        // One address is removed from the interface
        kernel.set_addresses("test-eth0", vec![addr("192.168.100.1/24")]);
        engine.rescan().await;

        assert!(rib.contains("", "192.168.100.0/24"));
        assert!(!rib.contains("", "192.168.200.0/24"));
        let stats = engine.stats();
        assert_eq!(stats.imported, 2);
        assert_eq!(stats.withdrawn, 1);
    }

    #[tokio::test]
    async fn test_missing_interface_is_skipped() {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_link(2, "test-eth0", LinkKind::Device, None);
        kernel.set_addresses("test-eth0", vec![addr("192.168.100.1/24")]);
        let rib = Arc::new(MemoryRib::new());
        let engine = ImportEngine::new(
            kernel as Arc<dyn Kernel>,
            rib.clone() as Arc<dyn PathSource>,
            vec![global_rule(&["missing0", "test-eth0"])],
            DEFAULT_SCAN_INTERVAL,
        );

        engine.rescan().await;

        // The lookup failure on missing0 does not abort the scan
        assert!(rib.contains("", "192.168.100.0/24"));
        assert_eq!(engine.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_submission_error_retries_next_cycle() {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_link(2, "test-eth0", LinkKind::Device, None);
        kernel.set_addresses("test-eth0", vec![addr("192.168.100.1/24")]);
        let rib = Arc::new(MemoryRib::new());
        let engine = ImportEngine::new(
            kernel as Arc<dyn Kernel>,
            rib.clone() as Arc<dyn PathSource>,
            vec![global_rule(&["test-eth0"])],
            DEFAULT_SCAN_INTERVAL,
        );

        rib.fail_adds.store(true, Ordering::SeqCst);
        engine.rescan().await;
        let stats = engine.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.imported, 0);
        assert!(stats.last_error_msg.is_some());
        assert!(!rib.contains("", "192.168.100.0/24"));

        // advertised was left untouched, so the next cycle resubmits
        rib.fail_adds.store(false, Ordering::SeqCst);
        engine.rescan().await;
        assert!(rib.contains("", "192.168.100.0/24"));
        assert_eq!(engine.stats().imported, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_task() {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_link(2, "test-eth0", LinkKind::Device, None);
        kernel.set_addresses("test-eth0", vec![addr("192.168.100.1/24")]);
        let rib = Arc::new(MemoryRib::new());
        let engine = ImportEngine::new(
            kernel.clone() as Arc<dyn Kernel>,
            rib.clone() as Arc<dyn PathSource>,
            vec![global_rule(&["test-eth0"])],
            DEFAULT_SCAN_INTERVAL,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = engine.start(shutdown_rx);

        // First tick is immediate
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rib.contains("", "192.168.100.0/24"));

        // A new address appears and is picked up on a later tick
        kernel.set_addresses(
            "test-eth0",
            vec![addr("192.168.100.1/24"), addr("192.168.200.1/24")],
        );
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rib.contains("", "192.168.200.0/24"));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
