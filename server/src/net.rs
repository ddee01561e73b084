use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::debug;

/// Address of the interface that routes to the outside world.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick a source
/// address. Falls back to loopback on machines without a route.
pub fn local_ip() -> IpAddr {
    match probe() {
        Ok(ip) => ip,
        Err(e) => {
            debug!(error = %e, "no outbound route, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn probe() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}
