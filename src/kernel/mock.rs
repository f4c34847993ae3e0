//! Stateful in-memory [`Kernel`] for the engine tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use crate::error::Error;
use crate::kernel::{Kernel, KernelRoute, Link, LinkKind};
use crate::rib::Afi;

#[derive(Default)]
pub(crate) struct MockKernel {
    links: Mutex<Vec<Link>>,
    addrs: Mutex<HashMap<String, Vec<(IpNetwork, IpAddr)>>>,
    routes: Mutex<Vec<KernelRoute>>,
    pub replace_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub fail_replace: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, index: u32, name: &str, kind: LinkKind, table_id: Option<u32>) {
        self.links.lock().unwrap().push(Link {
            index,
            name: name.to_string(),
            kind,
            table_id,
        });
    }

    pub fn set_addresses(&self, link_name: &str, addrs: Vec<(IpNetwork, IpAddr)>) {
        self.addrs
            .lock()
            .unwrap()
            .insert(link_name.to_string(), addrs);
    }

    /// Seed a route as if another daemon (or a previous run) installed it.
    pub fn seed_route(&self, route: KernelRoute) {
        self.routes.lock().unwrap().push(route);
    }

    pub fn routes(&self) -> Vec<KernelRoute> {
        self.routes.lock().unwrap().clone()
    }

    pub fn route_at(&self, destination: &str, table_id: u32) -> Option<KernelRoute> {
        let destination: IpNetwork = destination.parse().unwrap();
        self.routes
            .lock()
            .unwrap()
            .iter()
            .find(|route| route.destination == destination && route.table_id == table_id)
            .cloned()
    }

    /// Drop a route without going through the adapter, simulating
    /// out-of-band kernel state drift.
    pub fn remove_route_out_of_band(&self, destination: &str, table_id: u32) {
        let destination: IpNetwork = destination.parse().unwrap();
        self.routes
            .lock()
            .unwrap()
            .retain(|route| !(route.destination == destination && route.table_id == table_id));
    }
}

#[async_trait]
impl Kernel for MockKernel {
    async fn list_links(&self) -> Result<Vec<Link>, Error> {
        Ok(self.links.lock().unwrap().clone())
    }

    async fn addresses(&self, link: &Link) -> Result<Vec<(IpNetwork, IpAddr)>, Error> {
        Ok(self
            .addrs
            .lock()
            .unwrap()
            .get(&link.name)
            .cloned()
            .unwrap_or_default())
    }

    async fn routes_in_table(
        &self,
        table_id: u32,
        family: Afi,
    ) -> Result<Vec<KernelRoute>, Error> {
        Ok(self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|route| route.table_id == table_id)
            .filter(|route| match family {
                Afi::Ipv4 => route.destination.is_ipv4(),
                Afi::Ipv6 => route.destination.is_ipv6(),
            })
            .cloned()
            .collect())
    }

    async fn route_to(&self, nexthop: IpAddr) -> Result<Vec<KernelRoute>, Error> {
        Ok(self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|route| route.destination.contains(nexthop))
            .cloned()
            .collect())
    }

    async fn route_replace(&self, route: &KernelRoute) -> Result<(), Error> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(Error::KernelIo("route replace refused".to_string()));
        }
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|existing| {
            !(existing.destination == route.destination && existing.table_id == route.table_id)
        });
        routes.push(route.clone());
        Ok(())
    }

    async fn route_delete(&self, route: &KernelRoute) -> Result<(), Error> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::KernelIo("route delete refused".to_string()));
        }
        let mut routes = self.routes.lock().unwrap();
        let before = routes.len();
        routes.retain(|existing| {
            !(existing.destination == route.destination && existing.table_id == route.table_id)
        });
        if routes.len() == before {
            return Err(Error::NotFound(format!(
                "route {} table {}",
                route.destination, route.table_id
            )));
        }
        Ok(())
    }
}
