//! Export engine: observes best-path updates from the RIB and installs or
//! withdraws kernel routes, honoring community filters and VRF mappings.
//!
//! Shared state follows a copy-under-lock discipline: no lock is held
//! across a kernel or RIB call, and updates re-lock to commit.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::VrfConfig;
use crate::error::Error;
use crate::kernel::{Kernel, KernelRoute, LinkKind};
use crate::rib::{Afi, Community, LargeCommunity, Path, PathSource};

/// Linux route protocol for BGP routes; the default distinguishing id.
pub const RTPROT_BGP: u8 = 186;

/// Default metric for exported routes.
pub const DEFAULT_METRIC: u32 = 20;

/// Default dampening interval to prevent flapping.
pub const DEFAULT_DAMPENING_INTERVAL: Duration = Duration::from_millis(100);

/// A rule for exporting BGP routes to Linux routing tables.
///
/// Empty community sets match every non-withdraw path; a non-empty set
/// matches when the path carries any listed value (disjunction across and
/// within the standard and large sets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRule {
    pub name: String,
    pub communities: Vec<Community>,
    pub large_communities: Vec<LargeCommunity>,
    /// Target VRF; empty = global kernel table.
    pub vrf: String,
    /// Linux routing table id; 0 = main table.
    pub table_id: u32,
    pub metric: u32,
    pub validate_nexthop: bool,
}

impl ExportRule {
    /// A match-all rule targeting the main table.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            communities: Vec::new(),
            large_communities: Vec::new(),
            vrf: String::new(),
            table_id: 0,
            metric: DEFAULT_METRIC,
            validate_nexthop: true,
        }
    }
}

/// Per-VRF export configuration, bound to a kernel VRF device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfExportBinding {
    /// BGP daemon VRF name.
    pub vrf_name: String,
    /// Target Linux VRF name (default: same as `vrf_name`).
    pub linux_vrf: String,
    /// Target Linux table id; 0 = look up from the kernel VRF device.
    pub linux_table_id: u32,
    pub metric: u32,
    pub validate_nexthop: bool,
    /// Optional community filters; empty = match all.
    pub communities: Vec<Community>,
    pub large_communities: Vec<LargeCommunity>,
}

/// Tracking record for a route this engine installed.
#[derive(Debug, Clone)]
pub struct ExportedRoute {
    pub route: KernelRoute,
    pub rule_name: String,
    pub exported_at: DateTime<Utc>,
}

struct DampenEntry {
    path: Path,
    timer: JoinHandle<()>,
    updated_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportStats {
    pub exported: u64,
    pub withdrawn: u64,
    pub errors: u64,
    pub nexthop_validations: u64,
    pub nexthop_failures: u64,
    pub dampened_updates: u64,
    pub last_export: Option<DateTime<Utc>>,
    pub last_withdraw: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_msg: Option<String>,
}

/// Does a path pass a pair of community filters?
fn matches_filters(
    path: &Path,
    communities: &[Community],
    large_communities: &[LargeCommunity],
) -> bool {
    if communities.is_empty() && large_communities.is_empty() {
        return true;
    }
    if path
        .communities()
        .iter()
        .any(|community| communities.contains(community))
    {
        return true;
    }
    path.large_communities()
        .iter()
        .any(|community| large_communities.contains(community))
}

pub struct ExportEngine {
    kernel: Arc<dyn Kernel>,
    rib: Arc<dyn PathSource>,
    protocol: u8,
    dampening_interval: Duration,
    rules: RwLock<Vec<ExportRule>>,
    vrf_bindings: RwLock<HashMap<String, VrfExportBinding>>,
    rd_to_vrf: RwLock<HashMap<String, String>>,
    /// vrf -> prefix -> record; "" keys the global table.
    exported: RwLock<HashMap<String, HashMap<String, ExportedRoute>>>,
    pending: Mutex<HashMap<String, DampenEntry>>,
    stats: RwLock<ExportStats>,
    /// Serializes update processing, reconfiguration and flush against each
    /// other; the data locks above are only ever held briefly.
    op_lock: tokio::sync::Mutex<()>,
}

impl ExportEngine {
    /// Create the engine and purge stale kernel routes from previous runs.
    ///
    /// `protocol` 0 is rejected: without a distinguishing id the startup
    /// cleanup would delete routes this engine never installed.
    pub async fn new(
        kernel: Arc<dyn Kernel>,
        rib: Arc<dyn PathSource>,
        protocol: u8,
        dampening_interval: Duration,
    ) -> Result<Arc<Self>, Error> {
        if protocol == 0 {
            return Err(Error::ConfigInvalid(
                "route-protocol 0 would make exported routes indistinguishable".to_string(),
            ));
        }
        let engine = Arc::new(Self {
            kernel,
            rib,
            protocol,
            dampening_interval,
            rules: RwLock::new(Vec::new()),
            vrf_bindings: RwLock::new(HashMap::new()),
            rd_to_vrf: RwLock::new(HashMap::new()),
            exported: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            stats: RwLock::new(ExportStats::default()),
            op_lock: tokio::sync::Mutex::new(()),
        });
        engine.cleanup_stale_routes().await;
        Ok(engine)
    }

    /// Remove routes carrying our protocol id that were left behind by a
    /// previous run. Strictly precedes the first subscription dispatch.
    async fn cleanup_stale_routes(&self) {
        info!(
            "cleaning up stale kernel routes from previous runs (protocol {})",
            self.protocol
        );

        // The main table plus every VRF table discovered from the links
        let mut tables = vec![0u32];
        match self.kernel.list_links().await {
            Ok(links) => tables.extend(
                links
                    .iter()
                    .filter(|link| link.kind == LinkKind::Vrf)
                    .filter_map(|link| link.table_id),
            ),
            Err(err) => warn!("failed to list links during stale-route cleanup: {}", err),
        }

        let mut cleaned = 0usize;
        for table_id in tables {
            for family in [Afi::Ipv4, Afi::Ipv6] {
                let routes = match self.kernel.routes_in_table(table_id, family).await {
                    Ok(routes) => routes,
                    Err(err) => {
                        warn!("failed to list routes in table {}: {}", table_id, err);
                        continue;
                    }
                };
                for route in routes.iter().filter(|r| r.protocol == self.protocol) {
                    debug!(
                        "deleting stale route {} (table {}, metric {})",
                        route.destination, route.table_id, route.metric
                    );
                    match self.kernel.route_delete(route).await {
                        Ok(()) => cleaned += 1,
                        Err(err) => warn!(
                            "failed to delete stale route {}: {}",
                            route.destination, err
                        ),
                    }
                }
            }
        }
        if cleaned > 0 {
            info!("cleaned up {} stale routes", cleaned);
        }
    }

    /// Rebuild the RD-to-VRF map and per-VRF export bindings from the
    /// daemon's VRF configuration. Bindings with table id 0 are resolved
    /// against the kernel VRF device; on lookup failure the binding targets
    /// the main table.
    pub async fn configure_vrfs(&self, vrfs: &[VrfConfig]) {
        let mut rd_map = HashMap::new();
        let mut bindings = HashMap::new();

        for vrf in vrfs {
            if let Some(rd) = vrf.rd {
                rd_map.insert(rd.to_string(), vrf.name.clone());
            }
            let Some(binding) = &vrf.export else {
                continue;
            };
            let mut binding = binding.clone();
            if binding.linux_table_id == 0 {
                match self.lookup_vrf_table(&binding.linux_vrf).await {
                    Ok(table_id) => binding.linux_table_id = table_id,
                    Err(err) => warn!(
                        "failed to look up table id for Linux VRF {} ({}), targeting the main table",
                        binding.linux_vrf, err
                    ),
                }
            }
            info!(
                "configured VRF export {} -> linux vrf {} (table {}, metric {}, validate-nexthop {})",
                vrf.name,
                binding.linux_vrf,
                binding.linux_table_id,
                binding.metric,
                binding.validate_nexthop
            );
            bindings.insert(vrf.name.clone(), binding);
        }

        *self.rd_to_vrf.write().unwrap() = rd_map;
        *self.vrf_bindings.write().unwrap() = bindings;
    }

    async fn lookup_vrf_table(&self, vrf_name: &str) -> Result<u32, Error> {
        let links = self.kernel.list_links().await?;
        links
            .iter()
            .find(|link| link.kind == LinkKind::Vrf && link.name == vrf_name)
            .and_then(|link| link.table_id)
            .ok_or_else(|| Error::NotFound(format!("VRF {} not found in Linux", vrf_name)))
    }

    /// Replace all rules with a new set (for dynamic reconfiguration).
    pub fn set_rules(&self, rules: Vec<ExportRule>) {
        *self.rules.write().unwrap() = rules;
    }

    pub fn rules(&self) -> Vec<ExportRule> {
        self.rules.read().unwrap().clone()
    }

    pub fn vrf_bindings(&self) -> HashMap<String, VrfExportBinding> {
        self.vrf_bindings.read().unwrap().clone()
    }

    pub fn stats(&self) -> ExportStats {
        self.stats.read().unwrap().clone()
    }

    /// Deep copy of the tracked routes: vrf -> prefix -> record.
    pub fn list_exported(&self) -> HashMap<String, HashMap<String, ExportedRoute>> {
        self.exported.read().unwrap().clone()
    }

    /// Run the subscription consumer until the stream closes or shutdown is
    /// signalled. Dampening timers re-enter `process_update` on their own
    /// tasks.
    pub fn start(
        self: &Arc<Self>,
        mut updates: mpsc::Receiver<Path>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(path) => engine.schedule_update(path).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("export subscription consumer exiting");
            engine.stop_pending_timers();
        })
    }

    /// Route an update through the dampener. A pending entry for the same
    /// prefix is superseded by the newer path, preserving per-prefix order.
    pub async fn schedule_update(self: &Arc<Self>, path: Path) {
        if self.dampening_interval.is_zero() {
            self.process_update(path).await;
            return;
        }

        let prefix = path.prefix().to_string();
        let mut pending = self.pending.lock().unwrap();
        if let Some(entry) = pending.get_mut(&prefix) {
            entry.timer.abort();
            debug!(
                "superseding pending update for {} ({}ms since last)",
                prefix,
                entry.updated_at.elapsed().as_millis()
            );
            entry.path = path;
            entry.updated_at = Instant::now();
            entry.timer = self.spawn_dampen_timer(prefix);
            drop(pending);
            self.stats.write().unwrap().dampened_updates += 1;
        } else {
            let timer = self.spawn_dampen_timer(prefix.clone());
            pending.insert(
                prefix,
                DampenEntry {
                    path,
                    timer,
                    updated_at: Instant::now(),
                },
            );
        }
    }

    fn spawn_dampen_timer(self: &Arc<Self>, prefix: String) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let delay = self.dampening_interval;
        tokio::spawn(async move {
            sleep(delay).await;
            let entry = engine.pending.lock().unwrap().remove(&prefix);
            if let Some(entry) = entry {
                engine.process_update(entry.path).await;
            }
        })
    }

    fn stop_pending_timers(&self) {
        let mut pending = self.pending.lock().unwrap();
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }

    /// Process one best-path update: withdrawal fan-out, or dispatch to the
    /// global-rule loop (unicast) or the per-VRF binding path (VPN). This is
    /// the only place that branches on the NLRI tag.
    pub async fn process_update(&self, path: Path) {
        let _serialized = self.op_lock.lock().await;
        if path.is_withdraw() {
            let prefix = path.prefix().to_string();
            let vrfs: Vec<String> = {
                let exported = self.exported.read().unwrap();
                exported
                    .iter()
                    .filter(|(_, routes)| routes.contains_key(&prefix))
                    .map(|(vrf, _)| vrf.clone())
                    .collect()
            };
            debug!("processing withdrawal of {} from {:?}", prefix, vrfs);
            for vrf in vrfs {
                self.withdraw(&prefix, &vrf).await;
            }
            return;
        }

        if path.is_vpn() {
            if let Some(rule) = self.binding_rule_for(&path) {
                // Failures are counted and logged inside install
                self.install(&path, &rule).await.ok();
            }
        } else {
            let rules = self.rules.read().unwrap().clone();
            for rule in rules {
                if matches_filters(&path, &rule.communities, &rule.large_communities) {
                    self.install(&path, &rule).await.ok();
                }
            }
        }
    }

    /// Synthesize an export rule from the VRF binding a VPN path resolves
    /// to, or None when the path is unbound or filtered out.
    fn binding_rule_for(&self, path: &Path) -> Option<ExportRule> {
        let rd = path.rd()?;
        let vrf_name = self
            .rd_to_vrf
            .read()
            .unwrap()
            .get(&rd.to_string())
            .cloned()?;
        let binding = self.vrf_bindings.read().unwrap().get(&vrf_name).cloned()?;
        if !matches_filters(path, &binding.communities, &binding.large_communities) {
            return None;
        }
        Some(ExportRule {
            name: format!("{}-vrf-export", vrf_name),
            communities: Vec::new(),
            large_communities: Vec::new(),
            vrf: binding.linux_vrf,
            table_id: binding.linux_table_id,
            metric: binding.metric,
            validate_nexthop: binding.validate_nexthop,
        })
    }

    async fn nexthop_reachable(&self, nexthop: IpAddr, table_id: u32) -> bool {
        self.stats.write().unwrap().nexthop_validations += 1;

        let routes = match self.kernel.route_to(nexthop).await {
            Ok(routes) if !routes.is_empty() => routes,
            _ => {
                self.stats.write().unwrap().nexthop_failures += 1;
                return false;
            }
        };
        // When exporting to a specific table, the nexthop must resolve there
        if table_id > 0 && !routes.iter().any(|route| route.table_id == table_id) {
            self.stats.write().unwrap().nexthop_failures += 1;
            return false;
        }
        true
    }

    /// Install a path into the kernel according to a rule. Idempotent: an
    /// identical tracked route that is still present in the kernel is a
    /// no-op; a tracked route whose parameters drifted is deleted first.
    pub async fn install(&self, path: &Path, rule: &ExportRule) -> Result<(), Error> {
        let prefix = path.prefix();
        let prefix_key = prefix.to_string();

        let nexthop = path.nexthop();
        if nexthop.is_unspecified() {
            return Err(Error::NoNexthop(prefix_key));
        }

        if rule.validate_nexthop && !self.nexthop_reachable(nexthop, rule.table_id).await {
            debug!(
                "nexthop validation failed for {} via {} (rule {}, vrf {:?})",
                prefix_key, nexthop, rule.name, rule.vrf
            );
            return Err(Error::NexthopUnreachable(format!(
                "{} via {}",
                prefix_key, nexthop
            )));
        }

        let existing = {
            let exported = self.exported.read().unwrap();
            exported
                .get(&rule.vrf)
                .and_then(|routes| routes.get(&prefix_key))
                .cloned()
        };
        if let Some(info) = existing {
            if info.rule_name == rule.name {
                let tracked = &info.route;
                if tracked.table_id == rule.table_id
                    && tracked.metric == rule.metric
                    && tracked.gateway == Some(nexthop)
                {
                    if self.kernel_has(tracked).await {
                        return Ok(());
                    }
                    // Tracked route vanished out-of-band; fall through and
                    // re-install to restore it
                    info!(
                        "tracked route {} missing from kernel table {}, re-installing",
                        prefix_key, tracked.table_id
                    );
                } else {
                    info!(
                        "route parameters changed for {} (rule {}): metric {} -> {}, table {} -> {}",
                        prefix_key,
                        rule.name,
                        tracked.metric,
                        rule.metric,
                        tracked.table_id,
                        rule.table_id
                    );
                    if let Err(err) = self.kernel.route_delete(&info.route).await {
                        warn!(
                            "failed to delete old route for {} during parameter change: {}",
                            prefix_key, err
                        );
                    }
                    if let Some(routes) = self.exported.write().unwrap().get_mut(&rule.vrf) {
                        routes.remove(&prefix_key);
                    }
                }
            }
        }

        let mut route = KernelRoute {
            destination: prefix,
            gateway: Some(nexthop),
            table_id: rule.table_id,
            metric: rule.metric,
            protocol: self.protocol,
            link_index: None,
            onlink: false,
        };
        if !rule.validate_nexthop {
            // The kernel must accept the nexthop even if no connected route
            // covers it; VRF targets additionally need the device index
            route.onlink = true;
            if !rule.vrf.is_empty() {
                match self.kernel.link_by_name(&rule.vrf).await {
                    Ok(link) => route.link_index = Some(link.index),
                    Err(err) => warn!(
                        "failed to look up VRF link {} for onlink route: {}",
                        rule.vrf, err
                    ),
                }
            }
        }

        if let Err(err) = self.kernel.route_replace(&route).await {
            self.record_error(format!("route replace failed for {}: {}", prefix_key, err));
            warn!(
                "failed to export {} via {} (rule {}, vrf {:?}): {}",
                prefix_key, nexthop, rule.name, rule.vrf, err
            );
            return Err(Error::KernelInstall(format!("{}: {}", prefix_key, err)));
        }

        info!(
            "exported {} via {} (rule {}, vrf {:?}, table {}, metric {})",
            prefix_key, nexthop, rule.name, rule.vrf, rule.table_id, rule.metric
        );
        self.exported
            .write()
            .unwrap()
            .entry(rule.vrf.clone())
            .or_default()
            .insert(
                prefix_key,
                ExportedRoute {
                    route,
                    rule_name: rule.name.clone(),
                    exported_at: Utc::now(),
                },
            );
        {
            let mut stats = self.stats.write().unwrap();
            stats.exported += 1;
            stats.last_export = Some(Utc::now());
        }
        Ok(())
    }

    async fn kernel_has(&self, route: &KernelRoute) -> bool {
        match self
            .kernel
            .routes_in_table(route.table_id, family_of(&route.destination))
            .await
        {
            Ok(routes) => routes
                .iter()
                .any(|r| r.destination == route.destination && r.protocol == route.protocol),
            // A failed dump must not trigger a reinstall storm
            Err(_) => true,
        }
    }

    /// Remove a tracked route from the kernel and from tracking. Tracking is
    /// cleared even when the kernel delete fails, so the map never leaks.
    pub async fn withdraw(&self, prefix: &str, vrf: &str) {
        let info = {
            let exported = self.exported.read().unwrap();
            exported
                .get(vrf)
                .and_then(|routes| routes.get(prefix))
                .cloned()
        };
        let Some(info) = info else {
            return; // not exported, nothing to do
        };

        if let Err(err) = self.kernel.route_delete(&info.route).await {
            self.record_error(format!("route delete failed for {}: {}", prefix, err));
            warn!(
                "failed to withdraw {} from vrf {:?}: {}",
                prefix, vrf, err
            );
        }

        {
            let mut exported = self.exported.write().unwrap();
            if let Some(routes) = exported.get_mut(vrf) {
                routes.remove(prefix);
                if routes.is_empty() {
                    exported.remove(vrf);
                }
            }
        }
        {
            let mut stats = self.stats.write().unwrap();
            stats.withdrawn += 1;
            stats.last_withdraw = Some(Utc::now());
        }
        info!("withdrew {} from vrf {:?}", prefix, vrf);
    }

    /// Re-evaluate the whole RIB against a new rule set: replace the rules
    /// and VRF bindings, install everything that now matches (idempotency
    /// makes repeated installs cheap), then withdraw every tracked route the
    /// new rules no longer produce.
    pub async fn reconfigure(
        &self,
        rules: Vec<ExportRule>,
        vrfs: &[VrfConfig],
    ) -> Result<(), Error> {
        let _serialized = self.op_lock.lock().await;
        self.set_rules(rules);
        self.configure_vrfs(vrfs).await;

        let paths = self.rib.enumerate_paths().await?;
        info!("re-evaluating {} paths against new export rules", paths.len());

        let mut should_export: HashMap<String, HashSet<String>> = HashMap::new();
        for path in paths.iter().filter(|path| !path.is_withdraw()) {
            if path.is_vpn() {
                if let Some(rule) = self.binding_rule_for(path) {
                    should_export
                        .entry(rule.vrf.clone())
                        .or_default()
                        .insert(path.prefix().to_string());
                    self.install(path, &rule).await.ok();
                }
            } else {
                let rules = self.rules.read().unwrap().clone();
                for rule in rules {
                    if matches_filters(path, &rule.communities, &rule.large_communities) {
                        should_export
                            .entry(rule.vrf.clone())
                            .or_default()
                            .insert(path.prefix().to_string());
                        self.install(path, &rule).await.ok();
                    }
                }
            }
        }

        let stale: Vec<(String, String)> = {
            let exported = self.exported.read().unwrap();
            exported
                .iter()
                .flat_map(|(vrf, routes)| {
                    routes.keys().filter_map(|prefix| {
                        let kept = should_export
                            .get(vrf)
                            .map(|prefixes| prefixes.contains(prefix))
                            .unwrap_or(false);
                        (!kept).then(|| (vrf.clone(), prefix.clone()))
                    })
                })
                .collect()
        };
        for (vrf, prefix) in stale {
            info!(
                "withdrawing {} from vrf {:?}: no longer matches any rule",
                prefix, vrf
            );
            self.withdraw(&prefix, &vrf).await;
        }

        info!("route re-evaluation complete");
        Ok(())
    }

    /// Delete every tracked route and clear the map. Used for operational
    /// teardown; tracking is cleared regardless of per-route failures.
    pub async fn flush(&self) -> usize {
        let _serialized = self.op_lock.lock().await;
        let routes: Vec<KernelRoute> = {
            let exported = self.exported.read().unwrap();
            exported
                .values()
                .flat_map(|routes| routes.values().map(|info| info.route.clone()))
                .collect()
        };
        for route in &routes {
            if let Err(err) = self.kernel.route_delete(route).await {
                warn!("failed to delete {} during flush: {}", route.destination, err);
            }
        }
        self.exported.write().unwrap().clear();
        info!("flushed {} exported routes", routes.len());
        routes.len()
    }

    fn record_error(&self, msg: String) {
        let mut stats = self.stats.write().unwrap();
        stats.errors += 1;
        stats.last_error = Some(Utc::now());
        stats.last_error_msg = Some(msg);
    }
}

fn family_of(prefix: &ipnetwork::IpNetwork) -> Afi {
    match prefix {
        ipnetwork::IpNetwork::V4(_) => Afi::Ipv4,
        ipnetwork::IpNetwork::V6(_) => Afi::Ipv6,
    }
}
