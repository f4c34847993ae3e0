mod handler;

pub use handler::{serve, NetlinkApi};

use std::net::IpAddr;

use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};

use crate::export::ExportStats;
use crate::import::ImportStats;

#[rpc(server)]
pub trait Api {
    #[method(name = "show_netlink")]
    async fn show_netlink(&self) -> RpcResult<NetlinkStatus>;
    #[method(name = "show_netlink_export_rules")]
    async fn show_export_rules(&self) -> RpcResult<ExportRuleSet>;
    #[method(name = "show_routes_exported")]
    async fn show_routes_exported(&self, vrf: Option<String>) -> RpcResult<Vec<ExportedRouteInfo>>;
    #[method(name = "show_netlink_import_stats")]
    async fn show_import_stats(&self) -> RpcResult<ImportStats>;
    #[method(name = "show_netlink_export_stats")]
    async fn show_export_stats(&self) -> RpcResult<ExportStats>;
    #[method(name = "flush_exported")]
    async fn flush_exported(&self) -> RpcResult<u64>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetlinkStatus {
    pub import_enabled: bool,
    /// Scope of the global scanner ("" = default table).
    pub import_vrf: String,
    pub import_interfaces: Vec<String>,
    pub vrf_imports: Vec<VrfImportStatus>,
    pub export_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VrfImportStatus {
    pub vrf: String,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportRuleSet {
    pub rules: Vec<ExportRuleInfo>,
    pub vrf_rules: Vec<VrfExportRuleInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportRuleInfo {
    pub name: String,
    pub vrf: String,
    pub table_id: u32,
    pub metric: u32,
    pub validate_nexthop: bool,
    pub community_list: Vec<String>,
    pub large_community_list: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VrfExportRuleInfo {
    pub vrf: String,
    pub linux_vrf: String,
    pub linux_table_id: u32,
    pub metric: u32,
    pub validate_nexthop: bool,
    pub community_list: Vec<String>,
    pub large_community_list: Vec<String>,
}

/// One entry of the exported-route listing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportedRouteInfo {
    pub prefix: String,
    pub nexthop: Option<IpAddr>,
    /// Target VRF; "" = global table.
    pub vrf: String,
    pub table_id: u32,
    pub metric: u32,
    pub rule_name: String,
    pub exported_at: i64,
    pub age: String,
}
