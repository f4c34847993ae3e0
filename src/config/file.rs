use std::fs::File;
use std::io::Read;

use serde::Deserialize;

use crate::error::Error;

struct Defaults {}

impl Defaults {
    fn route_protocol() -> u8 {
        crate::export::RTPROT_BGP
    }

    fn dampening_interval() -> u64 {
        100 // milliseconds
    }

    fn metric() -> u32 {
        crate::export::DEFAULT_METRIC
    }

    fn validate_nexthop() -> bool {
        true
    }
}

/// Config (toml) representation of the redistribution settings
#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct ConfigSpec {
    #[serde(default)]
    pub(super) netlink: NetlinkSpec,
    #[serde(default)]
    pub(super) vrfs: Vec<VrfSpec>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct NetlinkSpec {
    #[serde(default)]
    pub(super) import: ImportSpec,
    #[serde(default)]
    pub(super) export: ExportSpec,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct ImportSpec {
    #[serde(default)]
    pub(super) enabled: bool,

    // Scope for the global scanner ("" = default kernel table)
    #[serde(default)]
    pub(super) vrf: String,

    // Interface names; glob patterns are expanded before the engine sees them
    #[serde(default)]
    pub(super) interface_list: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct ExportSpec {
    #[serde(default)]
    pub(super) enabled: bool,

    // Kernel route-protocol id marking our routes; 0 is rejected downstream
    #[serde(default = "Defaults::route_protocol")]
    pub(super) route_protocol: u8,

    // Milliseconds; 0 disables dampening
    #[serde(default = "Defaults::dampening_interval")]
    pub(super) dampening_interval: u64,

    #[serde(default)]
    pub(super) rules: Vec<ExportRuleSpec>,
}

impl Default for ExportSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            route_protocol: Defaults::route_protocol(),
            dampening_interval: Defaults::dampening_interval(),
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct ExportRuleSpec {
    pub(super) name: String,

    #[serde(default)]
    pub(super) community_list: Vec<String>,

    #[serde(default)]
    pub(super) large_community_list: Vec<String>,

    // Target VRF name; empty = global kernel table
    #[serde(default)]
    pub(super) vrf: String,

    // Linux table id; 0 = main table
    #[serde(default)]
    pub(super) table_id: u32,

    #[serde(default = "Defaults::metric")]
    pub(super) metric: u32,

    #[serde(default = "Defaults::validate_nexthop")]
    pub(super) validate_nexthop: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct VrfSpec {
    pub(super) name: String,

    #[serde(default)]
    pub(super) rd: Option<String>,

    #[serde(default)]
    pub(super) netlink_import: Option<VrfImportSpec>,

    #[serde(default)]
    pub(super) netlink_export: Option<VrfExportSpec>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct VrfImportSpec {
    #[serde(default)]
    pub(super) enabled: bool,

    #[serde(default)]
    pub(super) interface_list: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(super) struct VrfExportSpec {
    #[serde(default)]
    pub(super) enabled: bool,

    // Target Linux VRF; defaults to the VRF name
    #[serde(default)]
    pub(super) linux_vrf: String,

    // 0 = look up from the kernel VRF device at activation
    #[serde(default)]
    pub(super) linux_table_id: u32,

    #[serde(default = "Defaults::metric")]
    pub(super) metric: u32,

    #[serde(default = "Defaults::validate_nexthop")]
    pub(super) validate_nexthop: bool,

    #[serde(default)]
    pub(super) community_list: Vec<String>,

    #[serde(default)]
    pub(super) large_community_list: Vec<String>,
}

impl ConfigSpec {
    pub(super) fn from_file(path: &str) -> Result<Self, Error> {
        let mut file = File::open(path)
            .map_err(|err| Error::ConfigInvalid(format!("{}: {}", path, err)))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|err| Error::ConfigInvalid(format!("{}: {}", path, err)))?;
        Self::from_toml(&contents)
    }

    pub(super) fn from_toml(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents).map_err(|err| Error::ConfigInvalid(err.to_string()))
    }
}
