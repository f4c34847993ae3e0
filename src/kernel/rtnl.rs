//! Production [`Kernel`] over a route-netlink socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use log::trace;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{InfoData, InfoKind, InfoVrf, LinkAttribute, LinkInfo};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteFlags, RouteMessage};
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{Handle, RouteMessageBuilder};

use async_trait::async_trait;

use crate::error::Error;
use crate::kernel::{Kernel, KernelRoute, Link, LinkKind};
use crate::rib::Afi;

/// Linux main routing table; table id 0 in our domain types means "main".
const RT_TABLE_MAIN: u32 = 254;

pub struct RtnlKernel {
    handle: Handle,
}

impl RtnlKernel {
    /// Open a netlink socket and spawn its connection task on the current
    /// runtime.
    pub async fn connect() -> Result<Self, Error> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn route_message(route: &KernelRoute) -> RouteMessage {
        let mut msg = match route.destination {
            IpNetwork::V4(net) => {
                let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
                    .destination_prefix(net.ip(), net.prefix())
                    .protocol(route.protocol.into());
                if let Some(IpAddr::V4(gw)) = route.gateway {
                    builder = builder.gateway(gw);
                }
                if route.table_id > 0 {
                    builder = builder.table_id(route.table_id);
                }
                if let Some(index) = route.link_index {
                    builder = builder.output_interface(index);
                }
                builder.build()
            }
            IpNetwork::V6(net) => {
                let mut builder = RouteMessageBuilder::<Ipv6Addr>::new()
                    .destination_prefix(net.ip(), net.prefix())
                    .protocol(route.protocol.into());
                if let Some(IpAddr::V6(gw)) = route.gateway {
                    builder = builder.gateway(gw);
                }
                if route.table_id > 0 {
                    builder = builder.table_id(route.table_id);
                }
                if let Some(index) = route.link_index {
                    builder = builder.output_interface(index);
                }
                builder.build()
            }
        };
        if route.metric > 0 {
            msg.attributes.push(RouteAttribute::Priority(route.metric));
        }
        if route.onlink {
            msg.header.flags |= RouteFlags::Onlink;
        }
        msg
    }

    fn parse_route(msg: &RouteMessage) -> Option<KernelRoute> {
        let prefix_len = msg.header.destination_prefix_length;
        let destination = msg
            .attributes
            .iter()
            .find_map(|attr| match attr {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
                RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
                _ => None,
            })
            .or(match msg.header.address_family {
                // No destination attribute: a default route
                AddressFamily::Inet => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                AddressFamily::Inet6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
                _ => None,
            })?;
        let destination = IpNetwork::new(destination, prefix_len).ok()?;

        let gateway = msg.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });
        let table_id = msg
            .attributes
            .iter()
            .find_map(|attr| match attr {
                RouteAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| u32::from(msg.header.table));
        let metric = msg
            .attributes
            .iter()
            .find_map(|attr| match attr {
                RouteAttribute::Priority(metric) => Some(*metric),
                _ => None,
            })
            .unwrap_or(0);
        let link_index = msg.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::Oif(index) => Some(*index),
            _ => None,
        });

        Some(KernelRoute {
            destination,
            gateway,
            table_id,
            metric,
            protocol: msg.header.protocol.into(),
            link_index,
            onlink: msg.header.flags.contains(RouteFlags::Onlink),
        })
    }

    async fn dump_routes(&self, family: Afi) -> Result<Vec<KernelRoute>, Error> {
        let msg = match family {
            Afi::Ipv4 => RouteMessageBuilder::<Ipv4Addr>::new().build(),
            Afi::Ipv6 => RouteMessageBuilder::<Ipv6Addr>::new().build(),
        };
        let routes: Vec<RouteMessage> = self
            .handle
            .route()
            .get(msg)
            .execute()
            .try_collect()
            .await
            .map_err(|err| kernel_err("route dump", err))?;
        Ok(routes.iter().filter_map(Self::parse_route).collect())
    }
}

#[async_trait]
impl Kernel for RtnlKernel {
    async fn list_links(&self) -> Result<Vec<Link>, Error> {
        let links: Vec<_> = self
            .handle
            .link()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|err| kernel_err("link dump", err))?;

        Ok(links
            .iter()
            .filter_map(|msg| {
                let name = msg.attributes.iter().find_map(|attr| match attr {
                    LinkAttribute::IfName(name) => Some(name.clone()),
                    _ => None,
                })?;
                let info = msg.attributes.iter().find_map(|attr| match attr {
                    LinkAttribute::LinkInfo(info) => Some(info),
                    _ => None,
                });
                let kind = match info.and_then(|info| {
                    info.iter().find_map(|entry| match entry {
                        LinkInfo::Kind(kind) => Some(kind.clone()),
                        _ => None,
                    })
                }) {
                    Some(InfoKind::Vrf) => LinkKind::Vrf,
                    Some(InfoKind::Dummy) => LinkKind::Dummy,
                    Some(other) => LinkKind::Other(format!("{:?}", other)),
                    // Physical devices carry no link-info
                    None => LinkKind::Device,
                };
                let table_id = info.and_then(|info| {
                    info.iter().find_map(|entry| match entry {
                        LinkInfo::Data(InfoData::Vrf(data)) => data.iter().find_map(|v| match v {
                            InfoVrf::TableId(id) => Some(*id),
                            _ => None,
                        }),
                        _ => None,
                    })
                });
                Some(Link {
                    index: msg.header.index,
                    name,
                    kind,
                    table_id,
                })
            })
            .collect())
    }

    async fn addresses(&self, link: &Link) -> Result<Vec<(IpNetwork, IpAddr)>, Error> {
        let addrs: Vec<_> = self
            .handle
            .address()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|err| kernel_err("address dump", err))?;

        Ok(addrs
            .iter()
            .filter(|msg| msg.header.index == link.index)
            .filter_map(|msg| {
                let ip = msg.attributes.iter().find_map(|attr| match attr {
                    AddressAttribute::Address(ip) => Some(*ip),
                    _ => None,
                })?;
                let prefix = IpNetwork::new(ip, msg.header.prefix_len).ok()?;
                Some((prefix, ip))
            })
            .collect())
    }

    async fn routes_in_table(
        &self,
        table_id: u32,
        family: Afi,
    ) -> Result<Vec<KernelRoute>, Error> {
        let wanted = if table_id == 0 { RT_TABLE_MAIN } else { table_id };
        let routes = self.dump_routes(family).await?;
        Ok(routes
            .into_iter()
            .filter(|route| route.table_id == wanted)
            .collect())
    }

    async fn route_to(&self, nexthop: IpAddr) -> Result<Vec<KernelRoute>, Error> {
        let family = match nexthop {
            IpAddr::V4(_) => Afi::Ipv4,
            IpAddr::V6(_) => Afi::Ipv6,
        };
        let routes = self.dump_routes(family).await?;
        let covering: Vec<_> = routes
            .into_iter()
            .filter(|route| route.destination.contains(nexthop))
            .collect();
        trace!("{} kernel routes cover nexthop {}", covering.len(), nexthop);
        Ok(covering)
    }

    async fn route_replace(&self, route: &KernelRoute) -> Result<(), Error> {
        let msg = Self::route_message(route);
        self.handle
            .route()
            .add(msg)
            .replace()
            .execute()
            .await
            .map_err(|err| kernel_err("route replace", err))
    }

    async fn route_delete(&self, route: &KernelRoute) -> Result<(), Error> {
        let msg = Self::route_message(route);
        self.handle
            .route()
            .del(msg)
            .execute()
            .await
            .map_err(|err| kernel_err("route delete", err))
    }
}

/// Map a netlink failure onto the adapter error taxonomy. The kernel
/// reports errno through the netlink error message.
fn kernel_err(op: &str, err: rtnetlink::Error) -> Error {
    if let rtnetlink::Error::NetlinkError(ref msg) = err {
        if let Some(code) = msg.code {
            let io = std::io::Error::from_raw_os_error(code.get().abs());
            return match io.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    Error::PermissionDenied(format!("{}: {}", op, io))
                }
                std::io::ErrorKind::NotFound => Error::NotFound(format!("{}: {}", op, io)),
                _ => Error::KernelIo(format!("{}: {}", op, io)),
            };
        }
    }
    Error::KernelIo(format!("{}: {}", op, err))
}
