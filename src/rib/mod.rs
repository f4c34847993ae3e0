pub mod community;

pub use community::{Community, LargeCommunity};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use tokio::sync::mpsc;

use crate::error::Error;

/// Address family of a prefix. IPv4 and IPv6 share every code path; this
/// tag only matters where the kernel wire format needs it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Afi {
    Ipv4,
    Ipv6,
}

impl fmt::Display for Afi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Afi::Ipv4 => write!(f, "ipv4"),
            Afi::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Route Distinguisher namespacing a VPN prefix (RFC 4364 type 0/1/2).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RouteDistinguisher {
    TwoOctetAsn { asn: u16, assigned: u32 },
    Ipv4 { ip: Ipv4Addr, assigned: u16 },
    FourOctetAsn { asn: u32, assigned: u16 },
}

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RouteDistinguisher::TwoOctetAsn { asn, assigned } => write!(f, "{}:{}", asn, assigned),
            RouteDistinguisher::Ipv4 { ip, assigned } => write!(f, "{}:{}", ip, assigned),
            RouteDistinguisher::FourOctetAsn { asn, assigned } => write!(f, "{}:{}", asn, assigned),
        }
    }
}

impl FromStr for RouteDistinguisher {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (admin, assigned) = value
            .rsplit_once(':')
            .ok_or_else(|| Error::ConfigInvalid(format!("invalid RD '{}'", value)))?;
        if let Ok(ip) = admin.parse::<Ipv4Addr>() {
            let assigned = assigned
                .parse::<u16>()
                .map_err(|_| Error::ConfigInvalid(format!("invalid RD '{}'", value)))?;
            return Ok(RouteDistinguisher::Ipv4 { ip, assigned });
        }
        let admin = admin
            .parse::<u32>()
            .map_err(|_| Error::ConfigInvalid(format!("invalid RD '{}'", value)))?;
        if let Ok(asn) = u16::try_from(admin) {
            let assigned = assigned
                .parse::<u32>()
                .map_err(|_| Error::ConfigInvalid(format!("invalid RD '{}'", value)))?;
            Ok(RouteDistinguisher::TwoOctetAsn { asn, assigned })
        } else {
            let assigned = assigned
                .parse::<u16>()
                .map_err(|_| Error::ConfigInvalid(format!("invalid RD '{}'", value)))?;
            Ok(RouteDistinguisher::FourOctetAsn {
                asn: admin,
                assigned,
            })
        }
    }
}

/// Network Layer Reachability Information carried by a path.
///
/// The unicast/VPN distinction is made exactly once, in the export engine's
/// update dispatcher; VPN prefixes keep their RD for VRF mapping while the
/// kernel only ever sees the plain prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nlri {
    Unicast(IpNetwork),
    Vpn {
        rd: RouteDistinguisher,
        prefix: IpNetwork,
    },
}

impl Nlri {
    /// The plain prefix, without any RD.
    pub fn prefix(&self) -> IpNetwork {
        match self {
            Nlri::Unicast(prefix) => *prefix,
            Nlri::Vpn { prefix, .. } => *prefix,
        }
    }
}

impl fmt::Display for Nlri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Nlri::Unicast(prefix) => write!(f, "{}", prefix),
            Nlri::Vpn { rd, prefix } => write!(f, "{}:{}", rd, prefix),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Origin {
    Igp,
    Egp,
    Incomplete,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Origin::Igp => "IGP",
            Origin::Egp => "EGP",
            Origin::Incomplete => "Incomplete",
        };
        write!(f, "{}", display)
    }
}

/// Synthetic peer info attached to locally-originated paths.
///
/// The peer session layer uses the interface name to rewrite nexthops
/// per-peer (nexthop-self); the flag marks the path as netlink-sourced so
/// that rewrite is known to be required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub interface: String,
    pub netlink_sourced: bool,
}

impl PeerInfo {
    pub fn netlink(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            netlink_sourced: true,
        }
    }
}

/// A BGP path as consumed from the daemon's RIB.
///
/// Treated opaquely by the engines except for the accessors below; engines
/// copy out what they need (prefix, nexthop, communities, RD) and never hold
/// references into RIB-owned data.
#[derive(Debug, Clone)]
pub struct Path {
    nlri: Nlri,
    nexthop: IpAddr,
    origin: Origin,
    communities: Vec<Community>,
    large_communities: Vec<LargeCommunity>,
    is_withdraw: bool,
    peer: Option<PeerInfo>,
    timestamp: DateTime<Utc>,
}

impl Path {
    pub fn new(nlri: Nlri, nexthop: IpAddr) -> Self {
        Self {
            nlri,
            nexthop,
            origin: Origin::Igp,
            communities: Vec::new(),
            large_communities: Vec::new(),
            is_withdraw: false,
            peer: None,
            timestamp: Utc::now(),
        }
    }

    /// A connected-route path for an interface prefix, as produced by the
    /// import engine: origin IGP, unspecified nexthop (rewritten per-peer
    /// downstream), tagged with the originating interface.
    pub fn connected(prefix: IpNetwork, interface: &str) -> Self {
        let nexthop = match prefix {
            IpNetwork::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpNetwork::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let mut path = Path::new(Nlri::Unicast(prefix), nexthop);
        path.peer = Some(PeerInfo::netlink(interface));
        path
    }

    pub fn with_communities(mut self, communities: Vec<Community>) -> Self {
        self.communities = communities;
        self
    }

    pub fn with_large_communities(mut self, large_communities: Vec<LargeCommunity>) -> Self {
        self.large_communities = large_communities;
        self
    }

    /// The withdrawal twin of this path.
    pub fn clone_as_withdraw(&self) -> Self {
        let mut path = self.clone();
        path.is_withdraw = true;
        path.timestamp = Utc::now();
        path
    }

    pub fn nlri(&self) -> &Nlri {
        &self.nlri
    }

    /// Plain prefix for kernel installation (RD stripped for VPN paths).
    pub fn prefix(&self) -> IpNetwork {
        self.nlri.prefix()
    }

    pub fn family(&self) -> Afi {
        match self.nlri.prefix() {
            IpNetwork::V4(_) => Afi::Ipv4,
            IpNetwork::V6(_) => Afi::Ipv6,
        }
    }

    pub fn is_vpn(&self) -> bool {
        matches!(self.nlri, Nlri::Vpn { .. })
    }

    pub fn rd(&self) -> Option<RouteDistinguisher> {
        match self.nlri {
            Nlri::Vpn { rd, .. } => Some(rd),
            Nlri::Unicast(_) => None,
        }
    }

    pub fn nexthop(&self) -> IpAddr {
        self.nexthop
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn communities(&self) -> &[Community] {
        &self.communities
    }

    pub fn large_communities(&self) -> &[LargeCommunity] {
        &self.large_communities
    }

    pub fn is_withdraw(&self) -> bool {
        self.is_withdraw
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Path {} nexthop={} withdraw={}>",
            self.nlri, self.nexthop, self.is_withdraw
        )
    }
}

/// Capability the engines consume from the BGP daemon's RIB.
///
/// `add_paths` is idempotent at the RIB layer; `subscribe` hands out the
/// single-consumer best-path update stream (per-prefix order preserved).
/// The empty string denotes the global table everywhere a VRF name appears.
#[async_trait]
pub trait PathSource: Send + Sync {
    async fn add_paths(&self, vrf: &str, paths: Vec<Path>) -> Result<(), Error>;

    /// Snapshot of the current best paths across all tables.
    async fn enumerate_paths(&self) -> Result<Vec<Path>, Error>;

    async fn subscribe(&self) -> Result<mpsc::Receiver<Path>, Error>;
}
