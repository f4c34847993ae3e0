//! Wiring for the two redistribution engines: construction from
//! configuration, task lifecycle, dynamic reconfiguration.

use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{self, NetlinkConfig};
use crate::error::Error;
use crate::export::ExportEngine;
use crate::import::{ImportEngine, ImportRule, DEFAULT_SCAN_INTERVAL};
use crate::kernel::Kernel;
use crate::rib::PathSource;

/// The redistribution subsystem: whichever of the import and export engines
/// the configuration enables, plus their long-running tasks.
///
/// Failure to construct the kernel adapter or the export engine is fatal for
/// the subsystem only; the daemon decides whether to carry on without it.
pub struct Redistributor {
    config: RwLock<NetlinkConfig>,
    kernel: Arc<dyn Kernel>,
    rib: Arc<dyn PathSource>,
    import: Option<Arc<ImportEngine>>,
    export: Option<Arc<ExportEngine>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Redistributor {
    pub async fn new(
        config: NetlinkConfig,
        kernel: Arc<dyn Kernel>,
        rib: Arc<dyn PathSource>,
    ) -> Result<Self, Error> {
        let (shutdown_tx, _) = watch::channel(false);

        let import_rules = build_import_rules(&config, kernel.as_ref()).await;
        let import = if import_rules.is_empty() {
            None
        } else {
            Some(ImportEngine::new(
                kernel.clone(),
                rib.clone(),
                import_rules,
                DEFAULT_SCAN_INTERVAL,
            ))
        };

        let export = if config.export.enabled {
            let engine = ExportEngine::new(
                kernel.clone(),
                rib.clone(),
                config.export.route_protocol,
                config.export.dampening_interval,
            )
            .await?;
            engine.set_rules(config.export.rules.clone());
            engine.configure_vrfs(&config.vrfs).await;
            Some(engine)
        } else {
            None
        };

        Ok(Self {
            config: RwLock::new(config),
            kernel,
            rib,
            import,
            export,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the import scanner and the export subscription consumer.
    pub async fn start(&self) -> Result<(), Error> {
        let mut tasks = Vec::new();
        if let Some(import) = &self.import {
            tasks.push(import.start(self.shutdown_tx.subscribe()));
            info!("netlink import scanner started");
        }
        if let Some(export) = &self.export {
            let updates = self.rib.subscribe().await?;
            tasks.push(export.start(updates, self.shutdown_tx.subscribe()));
            info!("netlink export consumer started");
        }
        self.tasks.lock().unwrap().extend(tasks);
        Ok(())
    }

    /// Signal both tasks to stop and wait for them. Pending dampener timers
    /// are stopped by the export consumer on its way out.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send(true).ok();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.await.ok();
        }
        info!("netlink redistribution stopped");
    }

    /// Apply a new configuration: import rules are re-resolved and a rescan
    /// is triggered; the export engine re-evaluates the whole RIB against
    /// the new rules and bindings.
    pub async fn reconfigure(&self, new: NetlinkConfig) -> Result<(), Error> {
        if let Some(import) = &self.import {
            import.set_rules(build_import_rules(&new, self.kernel.as_ref()).await);
            import.rescan().await;
        }
        if let Some(export) = &self.export {
            export
                .reconfigure(new.export.rules.clone(), &new.vrfs)
                .await?;
        }
        *self.config.write().unwrap() = new;
        Ok(())
    }

    /// Trigger an immediate import scan (VRF lifecycle events).
    pub async fn rescan(&self) {
        if let Some(import) = &self.import {
            import.rescan().await;
        }
    }

    /// Operational teardown of every exported route.
    pub async fn flush(&self) -> usize {
        match &self.export {
            Some(export) => export.flush().await,
            None => 0,
        }
    }

    pub fn config(&self) -> NetlinkConfig {
        self.config.read().unwrap().clone()
    }

    pub fn import(&self) -> Option<&Arc<ImportEngine>> {
        self.import.as_ref()
    }

    pub fn export(&self) -> Option<&Arc<ExportEngine>> {
        self.export.as_ref()
    }
}

/// Collect the configured import scopes and expand their interface
/// selectors against the current kernel links.
async fn build_import_rules(config: &NetlinkConfig, kernel: &dyn Kernel) -> Vec<ImportRule> {
    let mut scopes: Vec<(String, Vec<String>)> = Vec::new();
    if config.import.enabled {
        scopes.push((config.import.vrf.clone(), config.import.interfaces.clone()));
    }
    for vrf in &config.vrfs {
        if let Some(import) = &vrf.import {
            scopes.push((vrf.name.clone(), import.interfaces.clone()));
        }
    }
    if scopes.is_empty() {
        return Vec::new();
    }

    let links = match kernel.list_links().await {
        Ok(links) => links,
        Err(err) => {
            warn!("failed to list links while resolving interface selectors: {}", err);
            Vec::new()
        }
    };
    scopes
        .into_iter()
        .map(|(vrf, selectors)| ImportRule {
            vrf,
            interfaces: config::resolve_interfaces(&selectors, &links),
        })
        .collect()
}
