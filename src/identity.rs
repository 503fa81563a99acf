//! Switch identity derivation and local address discovery.
//!
//! A switch is identified on the network by the SHA-1 hash of its public
//! `ip:port` string, rendered as lowercase hex. The functions here are
//! deliberately free-standing: the switch itself treats its identity as an
//! opaque string, and embedders that learn their public address some other
//! way (for example from a peer's `_to` header) can derive and inject it
//! themselves.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use sha1::{Digest, Sha1};
use tracing::debug;

/// Well-known resolvers used to discover the local address. Connecting a
/// UDP socket sends no packets; it only asks the kernel for a route.
const PROBE_TARGETS: [&str; 3] = ["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"];

/// Derive a switch identity from its public address: the SHA-1 digest of
/// the textual `ip:port`, hex encoded.
pub fn derive_identity(public_addr: &SocketAddr) -> String {
    let mut hasher = Sha1::new();
    hasher.update(public_addr.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Best-effort local IP discovery via a connected UDP probe.
///
/// Returns the first routable interface address, or loopback when the
/// machine has no route to any probe target.
pub fn local_ip() -> IpAddr {
    for target in PROBE_TARGETS {
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0")
            && socket.connect(target).is_ok()
            && let Ok(local) = socket.local_addr()
        {
            let ip = local.ip();
            if !ip.is_loopback() && !ip.is_unspecified() {
                return ip;
            }
        }
    }

    debug!("no routable interface found, falling back to loopback");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_lowercase_sha1_hex() {
        let addr: SocketAddr = "203.0.113.7:42424".parse().expect("valid address");
        let identity = derive_identity(&addr);

        assert_eq!(identity.len(), 40, "SHA-1 renders to 40 hex chars");
        assert!(
            identity
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
    }

    #[test]
    fn identity_is_stable_and_address_sensitive() {
        let a: SocketAddr = "203.0.113.7:42424".parse().expect("valid address");
        let b: SocketAddr = "203.0.113.7:42425".parse().expect("valid address");

        assert_eq!(derive_identity(&a), derive_identity(&a));
        assert_ne!(derive_identity(&a), derive_identity(&b));
    }

    #[test]
    fn local_ip_is_concrete() {
        let ip = local_ip();
        assert!(!ip.is_unspecified());
    }
}
