//! NAT probing through UPnP
//!
//! When a node listens behind a home router, [`NatDetector`] asks the gateway
//! for a TCP port mapping and learns the public address. The outcome is what
//! the TCP transport reports as `NatTypeChecked`.

use crate::transport::{NAT_TYPE_MAPPED, NAT_TYPE_PUBLIC, NAT_TYPE_UNKNOWN};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Port mapping lease (1 hour)
const PORT_MAPPING_LEASE: u32 = 3600;

/// Renew well before the lease runs out
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(50 * 60);

const MAPPING_DESCRIPTION: &str = "chain-net";

#[derive(Error, Debug)]
pub enum NatError {
    #[error("UPnP gateway not found")]
    GatewayNotFound,
    #[error("Failed to get external IP: {0}")]
    ExternalIp(String),
    #[error("Failed to add port mapping: {0}")]
    PortMapping(String),
    #[error("Invalid local address")]
    InvalidLocalAddress,
    #[error("Detection task failed")]
    TaskFailed,
}

/// Result of a detection run
#[derive(Debug, Clone, PartialEq)]
pub struct NatStatus {
    pub nat_type: u32,
    pub private_ip: Option<IpAddr>,
    pub public_ip: Option<IpAddr>,
}

impl NatStatus {
    pub fn unknown(private_ip: Option<IpAddr>) -> Self {
        Self {
            nat_type: NAT_TYPE_UNKNOWN,
            private_ip,
            public_ip: None,
        }
    }
}

/// UPnP-backed NAT detector for one listen port
pub struct NatDetector {
    port: u16,
}

impl NatDetector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Map the port on the gateway and classify our reachability.
    ///
    /// A failed gateway search is not an error: the node may simply have a
    /// public address, which is reported as such.
    pub async fn detect(&self) -> NatStatus {
        let private_ip = local_ip().map(IpAddr::V4);
        match self.map_port().await {
            Ok(public) => {
                let nat_type = if Some(IpAddr::V4(public)) == private_ip {
                    NAT_TYPE_PUBLIC
                } else {
                    NAT_TYPE_MAPPED
                };
                NatStatus {
                    nat_type,
                    private_ip,
                    public_ip: Some(IpAddr::V4(public)),
                }
            }
            Err(e) => {
                log::info!("UPnP port mapping unavailable: {}", e);
                match private_ip {
                    Some(ip) if is_public(ip) => NatStatus {
                        nat_type: NAT_TYPE_PUBLIC,
                        private_ip,
                        public_ip: Some(ip),
                    },
                    _ => NatStatus::unknown(private_ip),
                }
            }
        }
    }

    async fn map_port(&self) -> Result<Ipv4Addr, NatError> {
        let local_ip = local_ip().ok_or(NatError::InvalidLocalAddress)?;
        let port = self.port;
        let local_addr = SocketAddr::V4(SocketAddrV4::new(local_ip, port));

        tokio::task::spawn_blocking(move || {
            use igd_next::{search_gateway, PortMappingProtocol};

            let gateway = search_gateway(Default::default()).map_err(|_| NatError::GatewayNotFound)?;
            log::info!("Found UPnP gateway: {}", gateway.addr);

            let external = gateway
                .get_external_ip()
                .map_err(|e| NatError::ExternalIp(e.to_string()))?;
            let external = match external {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => return Err(NatError::ExternalIp("IPv6 not supported".to_string())),
            };

            gateway
                .add_port(
                    PortMappingProtocol::TCP,
                    port,
                    local_addr,
                    PORT_MAPPING_LEASE,
                    MAPPING_DESCRIPTION,
                )
                .map_err(|e| NatError::PortMapping(e.to_string()))?;

            log::info!("Added UPnP port mapping {}:{} -> {}", external, port, local_addr);
            Ok(external)
        })
        .await
        .map_err(|_| NatError::TaskFailed)?
    }

    /// Keep the mapping alive until the task is aborted
    pub fn spawn_renewal(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEWAL_INTERVAL).await;
                match self.map_port().await {
                    Ok(_) => log::debug!("Renewed UPnP port mapping for {}", self.port),
                    Err(e) => log::warn!("Failed to renew UPnP port mapping: {}", e),
                }
            }
        })
    }
}

/// Local IPv4 address used for the default route
pub fn local_ip() -> Option<Ipv4Addr> {
    // connect() on UDP only selects a route, nothing is sent
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_public() {
        assert!(!is_public("192.168.1.10".parse().unwrap()));
        assert!(!is_public("10.0.0.1".parse().unwrap()));
        assert!(!is_public("127.0.0.1".parse().unwrap()));
        assert!(is_public("119.23.205.254".parse().unwrap()));
    }

    #[test]
    fn test_unknown_status() {
        let status = NatStatus::unknown(None);
        assert_eq!(status.nat_type, NAT_TYPE_UNKNOWN);
        assert!(status.public_ip.is_none());
    }
}
