use std::net::{SocketAddr, UdpSocket};

use crate::error::Result;

/// UDP socket for outbound RTP packet delivery.
///
/// Binds one ephemeral socket whose port is advertised as `server_port`
/// in SETUP. This layer only knows addresses; the
/// [`RtpSession`](crate::session::RtpSession) decides where packets go.
pub struct UdpTransport {
    socket: UdpSocket,
    local_port: u16,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket on all interfaces.
    pub fn bind() -> Result<Self> {
        Self::bind_to(SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    pub fn bind_to(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let local_port = socket.local_addr()?.port();
        tracing::debug!(local_port, "RTP socket bound");
        Ok(Self { socket, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }
}
