//! Kernel-routing redistribution for a BGP daemon.
//!
//! Two symmetric data planes bridge the daemon's RIB and the Linux kernel
//! routing tables:
//!
//! - **Import**: connected prefixes are discovered on host interfaces and
//!   installed as locally-originated paths into the RIB (global or a named
//!   VRF).
//! - **Export**: best-path updates from the RIB are filtered by community
//!   rules and VRF mappings and installed as kernel routes, tracked per VRF
//!   for idempotent repair, withdrawal, and stale cleanup on startup.
//!
//! The daemon supplies the two capabilities the engines consume: a
//! [`kernel::Kernel`] (production: [`kernel::rtnl::RtnlKernel`]) and a
//! [`rib::PathSource`].

pub mod api;
pub mod config;
pub mod error;
pub mod export;
pub mod import;
pub mod kernel;
pub mod rib;
pub mod scanner;
pub mod service;
pub mod utils;

pub use config::NetlinkConfig;
pub use error::Error;
pub use service::Redistributor;
