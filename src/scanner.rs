//! Interface scanner: connected global-unicast prefixes of one interface.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use log::debug;

use crate::error::Error;
use crate::kernel::Kernel;

/// A prefix directly attached to a host interface. The interface's own
/// address is kept as the candidate nexthop for the peer layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedRoute {
    pub prefix: IpNetwork,
    pub nexthop: IpAddr,
}

/// Return the global-unicast prefixes configured on `interface`, both
/// families in one pass. The network is the interface address masked with
/// its prefix length. Unordered; may be empty.
pub async fn connected_routes(
    kernel: &dyn Kernel,
    interface: &str,
) -> Result<Vec<ConnectedRoute>, Error> {
    let link = kernel.link_by_name(interface).await?;
    let addrs = kernel.addresses(&link).await?;

    let mut routes = Vec::new();
    for (assigned, ip) in addrs {
        let is_global = is_global_unicast(ip);
        debug!(
            "found address {} on {} (global-unicast: {})",
            assigned, interface, is_global
        );
        if !is_global {
            continue;
        }
        // Mask the address down to its network
        if let Ok(prefix) = IpNetwork::new(assigned.network(), assigned.prefix()) {
            routes.push(ConnectedRoute {
                prefix,
                nexthop: ip,
            });
        }
    }
    Ok(routes)
}

fn is_global_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_link_local() || v4.is_multicast() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || link_local || v6.is_multicast() || v6.is_unspecified())
        }
    }
}
