//! Capability over the host's route and link primitives.
//!
//! The engines only ever talk to the [`Kernel`] trait; production code uses
//! [`rtnl::RtnlKernel`] over a route-netlink socket, tests use the stateful
//! mock. Domain types here are decoupled from the netlink wire format.

pub mod rtnl;

#[cfg(test)]
pub(crate) mod mock;

use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use crate::error::Error;
use crate::rib::Afi;

/// Kind of a network link, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Vrf,
    Dummy,
    Device,
    Other(String),
}

/// A network link. VRF links carry the id of the routing table they bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    pub table_id: Option<u32>,
}

/// A kernel route, keyed by (destination, table) for replace semantics.
///
/// `metric` maps to the kernel's route priority. `link_index` is only
/// populated when the ONLINK policy applies and the route targets a VRF
/// device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub table_id: u32,
    pub metric: u32,
    pub protocol: u8,
    pub link_index: Option<u32>,
    pub onlink: bool,
}

#[async_trait]
pub trait Kernel: Send + Sync {
    async fn list_links(&self) -> Result<Vec<Link>, Error>;

    async fn link_by_name(&self, name: &str) -> Result<Link, Error> {
        self.list_links()
            .await?
            .into_iter()
            .find(|link| link.name == name)
            .ok_or_else(|| Error::NotFound(format!("link {}", name)))
    }

    async fn link_by_index(&self, index: u32) -> Result<Link, Error> {
        self.list_links()
            .await?
            .into_iter()
            .find(|link| link.index == index)
            .ok_or_else(|| Error::NotFound(format!("link index {}", index)))
    }

    /// Addresses configured on a link: (prefix as assigned, local address).
    /// Both families in one call.
    async fn addresses(&self, link: &Link) -> Result<Vec<(IpNetwork, IpAddr)>, Error>;

    /// Routes of one family in one table. Table id 0 means the main table.
    async fn routes_in_table(&self, table_id: u32, family: Afi)
        -> Result<Vec<KernelRoute>, Error>;

    /// Reachability probe: every route that covers the nexthop, across
    /// tables. May return multiple entries; empty means unreachable.
    async fn route_to(&self, nexthop: IpAddr) -> Result<Vec<KernelRoute>, Error>;

    /// Add-or-update by (destination, table) key.
    async fn route_replace(&self, route: &KernelRoute) -> Result<(), Error>;

    async fn route_delete(&self, route: &KernelRoute) -> Result<(), Error>;
}
