//! Runtime configuration for the redistribution subsystem.
//!
//! The `file` layer deserializes the operator's TOML; this layer validates
//! it: community strings are parsed (unparsable entries are skipped with a
//! warning), RDs are typed, and per-VRF export settings become kernel-ready
//! bindings. Glob interface selectors stay unexpanded here; they are
//! resolved against the kernel link list when the import rules are built.

mod file;

use std::convert::TryFrom;
use std::time::Duration;

use log::{debug, warn};

use crate::error::Error;
use crate::export::{ExportRule, VrfExportBinding};
use crate::kernel::Link;
use crate::rib::{Community, LargeCommunity, RouteDistinguisher};

#[derive(Debug, Clone, Default)]
pub struct NetlinkConfig {
    pub import: ImportConfig,
    pub export: ExportConfig,
    pub vrfs: Vec<VrfConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportConfig {
    pub enabled: bool,
    /// Scope for the global scanner; "" = default kernel table.
    pub vrf: String,
    /// Interface selectors, possibly containing glob patterns.
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub enabled: bool,
    pub route_protocol: u8,
    pub dampening_interval: Duration,
    pub rules: Vec<ExportRule>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            route_protocol: crate::export::RTPROT_BGP,
            dampening_interval: crate::export::DEFAULT_DAMPENING_INTERVAL,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VrfConfig {
    pub name: String,
    pub rd: Option<RouteDistinguisher>,
    /// Present when netlink-import is enabled for this VRF.
    pub import: Option<VrfImportConfig>,
    /// Present when netlink-export is enabled for this VRF.
    pub export: Option<VrfExportBinding>,
}

#[derive(Debug, Clone)]
pub struct VrfImportConfig {
    pub interfaces: Vec<String>,
}

/// Parse a TOML config file into a validated NetlinkConfig
pub fn from_file(path: &str) -> Result<NetlinkConfig, Error> {
    let spec = file::ConfigSpec::from_file(path)?;
    Ok(NetlinkConfig::from_spec(spec))
}

impl NetlinkConfig {
    pub fn from_toml(contents: &str) -> Result<Self, Error> {
        let spec = file::ConfigSpec::from_toml(contents)?;
        Ok(Self::from_spec(spec))
    }

    fn from_spec(spec: file::ConfigSpec) -> Self {
        let rules = spec
            .netlink
            .export
            .rules
            .iter()
            .map(|rule| ExportRule {
                name: rule.name.clone(),
                communities: parse_communities(&rule.community_list, &rule.name),
                large_communities: parse_large_communities(&rule.large_community_list, &rule.name),
                vrf: rule.vrf.clone(),
                table_id: rule.table_id,
                metric: rule.metric,
                validate_nexthop: rule.validate_nexthop,
            })
            .collect();

        let vrfs = spec
            .vrfs
            .iter()
            .map(|vrf| {
                let rd = vrf.rd.as_ref().and_then(|rd| {
                    match rd.parse::<RouteDistinguisher>() {
                        Ok(rd) => Some(rd),
                        Err(err) => {
                            warn!("skipping RD on vrf {}: {}", vrf.name, err);
                            None
                        }
                    }
                });
                let import = vrf
                    .netlink_import
                    .as_ref()
                    .filter(|import| import.enabled)
                    .map(|import| VrfImportConfig {
                        interfaces: import.interface_list.clone(),
                    });
                let export = vrf
                    .netlink_export
                    .as_ref()
                    .filter(|export| export.enabled)
                    .map(|export| VrfExportBinding {
                        vrf_name: vrf.name.clone(),
                        linux_vrf: if export.linux_vrf.is_empty() {
                            vrf.name.clone()
                        } else {
                            export.linux_vrf.clone()
                        },
                        linux_table_id: export.linux_table_id,
                        metric: export.metric,
                        validate_nexthop: export.validate_nexthop,
                        communities: parse_communities(&export.community_list, &vrf.name),
                        large_communities: parse_large_communities(
                            &export.large_community_list,
                            &vrf.name,
                        ),
                    });
                VrfConfig {
                    name: vrf.name.clone(),
                    rd,
                    import,
                    export,
                }
            })
            .collect();

        Self {
            import: ImportConfig {
                enabled: spec.netlink.import.enabled,
                vrf: spec.netlink.import.vrf.clone(),
                interfaces: spec.netlink.import.interface_list.clone(),
            },
            export: ExportConfig {
                enabled: spec.netlink.export.enabled,
                route_protocol: spec.netlink.export.route_protocol,
                dampening_interval: Duration::from_millis(spec.netlink.export.dampening_interval),
                rules,
            },
            vrfs,
        }
    }
}

fn parse_communities(raw: &[String], context: &str) -> Vec<Community> {
    raw.iter()
        .filter_map(|value| match Community::try_from(value.as_str()) {
            Ok(community) => Some(community),
            Err(err) => {
                warn!("skipping community in {}: {}", context, err);
                None
            }
        })
        .collect()
}

fn parse_large_communities(raw: &[String], context: &str) -> Vec<LargeCommunity> {
    raw.iter()
        .filter_map(|value| match LargeCommunity::try_from(value.as_str()) {
            Ok(community) => Some(community),
            Err(err) => {
                warn!("skipping large community in {}: {}", context, err);
                None
            }
        })
        .collect()
}

/// Expand interface selectors to literal names against the kernel link
/// list. Literal names pass through untouched (a missing interface is the
/// scanner's warn-and-skip case, not ours); patterns expand to the links
/// they match, sorted, deduplicated.
pub fn resolve_interfaces(selectors: &[String], links: &[Link]) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::new();
    for selector in selectors {
        if selector.contains('*') {
            let mut matched: Vec<String> = links
                .iter()
                .filter(|link| glob_match(selector, &link.name))
                .map(|link| link.name.clone())
                .collect();
            matched.sort();
            if matched.is_empty() {
                debug!("interface pattern {} matched no links", selector);
            }
            for name in matched {
                if !resolved.contains(&name) {
                    resolved.push(name);
                }
            }
        } else if !resolved.contains(selector) {
            resolved.push(selector.clone());
        }
    }
    resolved
}

/// Shell-style match where '*' spans any run of characters.
fn glob_match(pattern: &str, name: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = match parts.next() {
        Some(first) => first,
        None => return pattern == name,
    };
    if !name.starts_with(first) {
        return false;
    }
    let mut rest = &name[first.len()..];
    let mut middle: Vec<&str> = parts.collect();
    let last = match middle.pop() {
        Some(last) => last,
        // No '*' at all: exact match only
        None => return name == first,
    };
    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::LinkKind;

    const SAMPLE: &str = r#"
[netlink.import]
enabled = true
interface-list = ["eth0", "eth1"]

[netlink.export]
enabled = true
dampening-interval = 250

[[netlink.export.rules]]
name = "customers"
community-list = ["65000:100", "bogus", "4259840200"]
large-community-list = ["65000:1:2"]
metric = 100

[[netlink.export.rules]]
name = "vrf-blue"
vrf = "blue"
table-id = 100
validate-nexthop = false

[[vrfs]]
name = "blue"
rd = "65000:1"

[vrfs.netlink-import]
enabled = true
interface-list = ["eth2"]

[vrfs.netlink-export]
enabled = true
linux-table-id = 100
metric = 50

[[vrfs]]
name = "red"
rd = "not-an-rd"
"#;

    #[test]
    fn test_parse_sample() {
        let config = NetlinkConfig::from_toml(SAMPLE).unwrap();

        assert!(config.import.enabled);
        assert_eq!(config.import.vrf, "");
        assert_eq!(config.import.interfaces, vec!["eth0", "eth1"]);

        assert!(config.export.enabled);
        assert_eq!(config.export.route_protocol, 186);
        assert_eq!(config.export.dampening_interval, Duration::from_millis(250));
        assert_eq!(config.export.rules.len(), 2);

        // The bogus community is skipped, the rest of the rule survives
        let customers = &config.export.rules[0];
        assert_eq!(customers.name, "customers");
        assert_eq!(customers.communities.len(), 2);
        assert_eq!(customers.large_communities.len(), 1);
        assert_eq!(customers.metric, 100);
        assert!(customers.validate_nexthop);

        let vrf_rule = &config.export.rules[1];
        assert_eq!(vrf_rule.vrf, "blue");
        assert_eq!(vrf_rule.table_id, 100);
        assert_eq!(vrf_rule.metric, 20);
        assert!(!vrf_rule.validate_nexthop);

        assert_eq!(config.vrfs.len(), 2);
        let blue = &config.vrfs[0];
        assert!(blue.rd.is_some());
        assert_eq!(blue.import.as_ref().unwrap().interfaces, vec!["eth2"]);
        let binding = blue.export.as_ref().unwrap();
        // linux-vrf defaults to the VRF name
        assert_eq!(binding.linux_vrf, "blue");
        assert_eq!(binding.linux_table_id, 100);
        assert_eq!(binding.metric, 50);
        assert!(binding.validate_nexthop);

        // Unparsable RD dropped; no import/export sections means disabled
        let red = &config.vrfs[1];
        assert!(red.rd.is_none());
        assert!(red.import.is_none());
        assert!(red.export.is_none());
    }

    #[test]
    fn test_empty_config_defaults() {
        let config = NetlinkConfig::from_toml("").unwrap();
        assert!(!config.import.enabled);
        assert!(!config.export.enabled);
        assert_eq!(config.export.route_protocol, 186);
        assert_eq!(config.export.dampening_interval, Duration::from_millis(100));
        assert!(config.vrfs.is_empty());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(NetlinkConfig::from_toml("netlink = [").is_err());
    }

    fn links(names: &[&str]) -> Vec<Link> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Link {
                index: i as u32 + 1,
                name: name.to_string(),
                kind: LinkKind::Device,
                table_id: None,
            })
            .collect()
    }

    #[test]
    fn test_resolve_interfaces() {
        let links = links(&["eth0", "eth1", "ens3", "lo"]);

        let selectors = vec!["eth*".to_string()];
        assert_eq!(resolve_interfaces(&selectors, &links), vec!["eth0", "eth1"]);

        // Literals pass through even when absent; duplicates collapse
        let selectors = vec![
            "dummy0".to_string(),
            "eth*".to_string(),
            "eth0".to_string(),
        ];
        assert_eq!(
            resolve_interfaces(&selectors, &links),
            vec!["dummy0", "eth0", "eth1"]
        );

        let selectors = vec!["wlan*".to_string()];
        assert!(resolve_interfaces(&selectors, &links).is_empty());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("eth*", "eth0"));
        assert!(glob_match("eth*", "eth"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("e*0", "eth0"));
        assert!(glob_match("eth0", "eth0"));
        assert!(!glob_match("eth*", "ens3"));
        assert!(!glob_match("eth0", "eth1"));
        assert!(!glob_match("e*9", "eth0"));
    }
}
