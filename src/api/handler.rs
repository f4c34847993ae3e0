use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::core::RpcResult;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use log::info;

use super::{
    ApiServer, ExportRuleInfo, ExportRuleSet, ExportedRouteInfo, NetlinkStatus, VrfExportRuleInfo,
    VrfImportStatus,
};
use crate::export::ExportStats;
use crate::import::ImportStats;
use crate::service::Redistributor;
use crate::utils::format_time_as_elapsed;

/// Management surface over the redistribution engines.
pub struct NetlinkApi {
    service: Arc<Redistributor>,
}

impl NetlinkApi {
    pub fn new(service: Arc<Redistributor>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl ApiServer for NetlinkApi {
    async fn show_netlink(&self) -> RpcResult<NetlinkStatus> {
        let config = self.service.config();
        Ok(NetlinkStatus {
            import_enabled: config.import.enabled,
            import_vrf: config.import.vrf,
            import_interfaces: config.import.interfaces,
            vrf_imports: config
                .vrfs
                .iter()
                .filter_map(|vrf| {
                    vrf.import.as_ref().map(|import| VrfImportStatus {
                        vrf: vrf.name.clone(),
                        interfaces: import.interfaces.clone(),
                    })
                })
                .collect(),
            export_enabled: config.export.enabled,
        })
    }

    async fn show_export_rules(&self) -> RpcResult<ExportRuleSet> {
        let Some(export) = self.service.export() else {
            return Ok(ExportRuleSet {
                rules: Vec::new(),
                vrf_rules: Vec::new(),
            });
        };
        let rules = export
            .rules()
            .iter()
            .map(|rule| ExportRuleInfo {
                name: rule.name.clone(),
                vrf: rule.vrf.clone(),
                table_id: rule.table_id,
                metric: rule.metric,
                validate_nexthop: rule.validate_nexthop,
                community_list: rule.communities.iter().map(|c| c.to_string()).collect(),
                large_community_list: rule
                    .large_communities
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            })
            .collect();
        let mut vrf_rules: Vec<VrfExportRuleInfo> = export
            .vrf_bindings()
            .into_values()
            .map(|binding| VrfExportRuleInfo {
                vrf: binding.vrf_name.clone(),
                linux_vrf: binding.linux_vrf.clone(),
                linux_table_id: binding.linux_table_id,
                metric: binding.metric,
                validate_nexthop: binding.validate_nexthop,
                community_list: binding.communities.iter().map(|c| c.to_string()).collect(),
                large_community_list: binding
                    .large_communities
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            })
            .collect();
        vrf_rules.sort_by(|a, b| a.vrf.cmp(&b.vrf));
        Ok(ExportRuleSet { rules, vrf_rules })
    }

    async fn show_routes_exported(&self, vrf: Option<String>) -> RpcResult<Vec<ExportedRouteInfo>> {
        let Some(export) = self.service.export() else {
            return Ok(Vec::new());
        };
        let mut routes: Vec<ExportedRouteInfo> = export
            .list_exported()
            .into_iter()
            .filter(|(name, _)| match &vrf {
                Some(wanted) => name == wanted,
                None => true,
            })
            .flat_map(|(vrf, entries)| {
                entries.into_iter().map(move |(prefix, record)| ExportedRouteInfo {
                    prefix,
                    nexthop: record.route.gateway,
                    vrf: vrf.clone(),
                    table_id: record.route.table_id,
                    metric: record.route.metric,
                    rule_name: record.rule_name,
                    exported_at: record.exported_at.timestamp(),
                    age: format_time_as_elapsed(record.exported_at),
                })
            })
            .collect();
        routes.sort_by(|a, b| (&a.vrf, &a.prefix).cmp(&(&b.vrf, &b.prefix)));
        Ok(routes)
    }

    async fn show_import_stats(&self) -> RpcResult<ImportStats> {
        Ok(self
            .service
            .import()
            .map(|import| import.stats())
            .unwrap_or_default())
    }

    async fn show_export_stats(&self) -> RpcResult<ExportStats> {
        Ok(self
            .service
            .export()
            .map(|export| export.stats())
            .unwrap_or_default())
    }

    async fn flush_exported(&self) -> RpcResult<u64> {
        Ok(self.service.flush().await as u64)
    }
}

/// Mount the management API on an HTTP JSON-RPC server.
pub async fn serve(
    api: NetlinkApi,
    socket: SocketAddr,
) -> Result<ServerHandle, jsonrpsee::core::Error> {
    info!("Starting JSON-RPC server on {}...", socket);
    let server = ServerBuilder::default().build(socket).await?;
    server.start(api.into_rpc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::config::NetlinkConfig;
    use crate::kernel::mock::MockKernel;
    use crate::kernel::{Kernel, KernelRoute, LinkKind};
    use crate::rib::memory::MemoryRib;
    use crate::rib::{Nlri, Path, PathSource};

    const CONFIG: &str = r#"
[netlink.import]
enabled = true
interface-list = ["test-eth0"]

[netlink.export]
enabled = true
dampening-interval = 0

[[netlink.export.rules]]
name = "g"
metric = 100
"#;

    async fn service() -> (Arc<MockKernel>, Arc<MemoryRib>, Arc<Redistributor>) {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_link(2, "test-eth0", LinkKind::Device, None);
        kernel.seed_route(KernelRoute {
            destination: "192.168.100.0/24".parse().unwrap(),
            gateway: None,
            table_id: 0,
            metric: 0,
            protocol: 2,
            link_index: Some(2),
            onlink: false,
        });
        let rib = Arc::new(MemoryRib::new());
        let config = NetlinkConfig::from_toml(CONFIG).unwrap();
        let service = Redistributor::new(
            config,
            kernel.clone() as Arc<dyn Kernel>,
            rib.clone() as Arc<dyn PathSource>,
        )
        .await
        .unwrap();
        (kernel, rib, Arc::new(service))
    }

    #[tokio::test]
    async fn test_show_netlink() {
        let (_, _, service) = service().await;
        let api = NetlinkApi::new(service);
        let status = api.show_netlink().await.unwrap();
        assert!(status.import_enabled);
        assert_eq!(status.import_interfaces, vec!["test-eth0"]);
        assert!(status.export_enabled);
        assert!(status.vrf_imports.is_empty());
    }

    #[tokio::test]
    async fn test_show_rules_and_exported_routes() {
        let (kernel, _, service) = service().await;
        let export = service.export().unwrap().clone();
        export
            .process_update(Path::new(
                Nlri::Unicast("10.1.0.0/24".parse().unwrap()),
                "192.168.100.1".parse().unwrap(),
            ))
            .await;
        assert!(kernel.route_at("10.1.0.0/24", 0).is_some());

        let api = NetlinkApi::new(service);
        let rules = api.show_export_rules().await.unwrap();
        assert_eq!(rules.rules.len(), 1);
        assert_eq!(rules.rules[0].name, "g");
        assert_eq!(rules.rules[0].metric, 100);

        let routes = api.show_routes_exported(None).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].prefix, "10.1.0.0/24");
        assert_eq!(routes[0].metric, 100);
        assert_eq!(routes[0].rule_name, "g");

        // VRF filter with no matches
        let routes = api
            .show_routes_exported(Some("blue".to_string()))
            .await
            .unwrap();
        assert!(routes.is_empty());

        let stats = api.show_export_stats().await.unwrap();
        assert_eq!(stats.exported, 1);
    }

    #[tokio::test]
    async fn test_flush_exported() {
        let (kernel, _, service) = service().await;
        let export = service.export().unwrap();
        export
            .process_update(Path::new(
                Nlri::Unicast("10.1.0.0/24".parse().unwrap()),
                "192.168.100.1".parse().unwrap(),
            ))
            .await;
        let deletes = kernel.delete_calls.load(Ordering::SeqCst);

        let api = NetlinkApi::new(service.clone());
        assert_eq!(api.flush_exported().await.unwrap(), 1);
        assert!(kernel.delete_calls.load(Ordering::SeqCst) > deletes);
        assert!(export.list_exported().is_empty());
    }
}
