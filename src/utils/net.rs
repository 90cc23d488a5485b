use crate::{Result, SyncError};
use log::warn;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Create a UDP socket bound to 0.0.0.0:port with SO_REUSEADDR (and
/// SO_REUSEPORT on Unix) plus broadcast enabled. Several processes on one
/// host can share the discovery port this way.
pub fn broadcast_listener(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| SyncError::NetworkError(format!("Failed to create socket: {}", e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| SyncError::NetworkError(format!("Failed to set reuse_address: {}", e)))?;

    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    {
        if let Err(e) = socket.set_reuse_port(true) {
            warn!("Could not set SO_REUSEPORT (not critical): {}", e);
        }
    }

    socket
        .set_broadcast(true)
        .map_err(|e| SyncError::NetworkError(format!("Failed to enable broadcast: {}", e)))?;

    socket
        .bind(&addr.into())
        .map_err(|e| SyncError::NetworkError(format!("Failed to bind to {}: {}", addr, e)))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| SyncError::NetworkError(format!("Failed to set nonblocking: {}", e)))?;

    UdpSocket::from_std(socket.into())
        .map_err(|e| SyncError::NetworkError(format!("Failed to convert to tokio socket: {}", e)))
}

/// Ephemeral UDP socket for sending announcements, broadcast enabled.
pub async fn announcement_sender() -> Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| SyncError::NetworkError(format!("Failed to bind sender socket: {}", e)))?;
    socket
        .set_broadcast(true)
        .map_err(|e| SyncError::NetworkError(format!("Failed to enable broadcast: {}", e)))?;
    Ok(socket)
}

/// Best-effort local LAN address. Opens a UDP socket toward a public
/// address (no traffic is sent) and reads the chosen source IP. Falls back
/// to loopback when the host has no route.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Could not determine local IP ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
