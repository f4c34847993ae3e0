use std::error;
use std::fmt;
use std::io;

/// Errors raised by the redistribution subsystem.
///
/// Per-path failures in the export engine are counted and logged but never
/// propagated past the subscription loop; the variants below surface through
/// `Result` at every I/O point so callers can decide.
#[derive(Debug)]
pub enum Error {
    /// Low-level kernel adapter failure (bus, protocol). [reason]
    KernelIo(String),
    /// The caller lacks the privilege for a kernel operation. [reason]
    PermissionDenied(String),
    /// A named link, VRF or route is missing. [what]
    NotFound(String),
    /// The path carries an unspecified nexthop. [prefix]
    NoNexthop(String),
    /// Nexthop validation enabled and no kernel route covers it. [detail]
    NexthopUnreachable(String),
    /// The kernel refused a route replace or delete. [detail]
    KernelInstall(String),
    /// Unparsable configuration (community, RD, file contents). [detail]
    ConfigInvalid(String),
    /// RIB adapter failure. [reason]
    Rib(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            KernelIo(r) => write!(f, "kernel I/O error [{}]", r),
            PermissionDenied(r) => write!(f, "permission denied [{}]", r),
            NotFound(w) => write!(f, "not found [{}]", w),
            NoNexthop(p) => write!(f, "no valid nexthop for {}", p),
            NexthopUnreachable(d) => write!(f, "nexthop not reachable [{}]", d),
            KernelInstall(d) => write!(f, "kernel route operation failed [{}]", d),
            ConfigInvalid(d) => write!(f, "invalid configuration [{}]", d),
            Rib(r) => write!(f, "RIB error [{}]", r),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(error.to_string()),
            io::ErrorKind::NotFound => Error::NotFound(error.to_string()),
            _ => Error::KernelIo(error.to_string()),
        }
    }
}

impl From<rtnetlink::Error> for Error {
    fn from(error: rtnetlink::Error) -> Self {
        // The kernel reports errno through the netlink error message
        if let rtnetlink::Error::NetlinkError(ref msg) = error {
            if let Some(code) = msg.code {
                return io::Error::from_raw_os_error(code.get().abs()).into();
            }
        }
        Error::KernelIo(error.to_string())
    }
}
