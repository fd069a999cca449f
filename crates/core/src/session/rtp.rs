use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::media::{Packetizer, VIDEO_CLOCK_RATE};
use crate::transport::UdpTransport;

/// The RTP session shared by the control connection and the sender thread.
pub type SharedRtpSession = Arc<Mutex<RtpSession>>;

/// Outcome of sending one access unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSendReport {
    pub packets: usize,
    pub failed: usize,
    pub bytes: usize,
}

/// Outbound RTP stream to the single RTSP client.
///
/// SETUP sets the destination, PLAY activates it, TEARDOWN and disconnect
/// deactivate it. Packetizer state (SSRC, sequence, timestamp) lives as
/// long as the server, so a client that re-plays sees one continuous
/// sequence-number run.
pub struct RtpSession {
    packetizer: Box<dyn Packetizer>,
    udp: UdpTransport,
    destination: Option<SocketAddr>,
    active: bool,
    ticks_per_frame: u32,
    sent: u64,
    failed: u64,
}

impl RtpSession {
    pub fn new(packetizer: Box<dyn Packetizer>, udp: UdpTransport, fps: u32) -> Self {
        let ticks_per_frame = VIDEO_CLOCK_RATE / fps.max(1);
        tracing::debug!(
            local_port = udp.local_port(),
            ticks_per_frame,
            "RTP session created"
        );
        Self {
            packetizer,
            udp,
            destination: None,
            active: false,
            ticks_per_frame,
            sent: 0,
            failed: 0,
        }
    }

    pub fn into_shared(self) -> SharedRtpSession {
        Arc::new(Mutex::new(self))
    }

    /// Where RTP packets go, from SETUP's `client_port`.
    pub fn set_destination(&mut self, destination: SocketAddr) {
        tracing::debug!(%destination, "RTP destination set");
        self.destination = Some(destination);
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    pub fn start(&mut self) {
        if !self.active {
            tracing::info!(destination = ?self.destination, "RTP session active");
        }
        self.active = true;
    }

    /// Deactivate and forget the destination.
    pub fn stop(&mut self) {
        if self.active {
            tracing::info!(sent = self.sent, failed = self.failed, "RTP session stopped");
        }
        self.active = false;
        self.destination = None;
    }

    /// Playing with a destination to send to.
    pub fn is_active(&self) -> bool {
        self.active && self.destination.is_some()
    }

    /// Local port of the UDP socket, advertised as `server_port`.
    pub fn local_port(&self) -> u16 {
        self.udp.local_port()
    }

    pub fn ssrc(&self) -> u32 {
        self.packetizer.ssrc()
    }

    pub fn sdp_attributes(&self) -> Vec<String> {
        self.packetizer.sdp_attributes()
    }

    pub fn packetizer(&self) -> &dyn Packetizer {
        self.packetizer.as_ref()
    }

    pub fn next_sequence(&self) -> u16 {
        self.packetizer.next_sequence()
    }

    pub fn next_rtp_timestamp(&self) -> u32 {
        self.packetizer.next_rtp_timestamp()
    }

    /// Packets sent and packets whose send failed, since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.sent, self.failed)
    }

    /// Packetize one Annex-B access unit and send every packet.
    ///
    /// A packet that fails to send is logged and skipped; the rest of the
    /// frame still goes out.
    pub fn send_frame(&mut self, access_unit: &[u8]) -> Result<FrameSendReport> {
        let destination = match self.destination {
            Some(destination) if self.active => destination,
            _ => return Err(Error::RtpInactive),
        };

        let packets = self.packetizer.packetize(access_unit, self.ticks_per_frame);
        let mut report = FrameSendReport {
            packets: packets.len(),
            ..Default::default()
        };
        for packet in &packets {
            match self.udp.send_to(packet, destination) {
                Ok(n) => report.bytes += n,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(%destination, len = packet.len(), error = %e, "RTP send failed, packet dropped");
                }
            }
        }
        self.sent += (report.packets - report.failed) as u64;
        self.failed += report.failed as u64;
        tracing::trace!(packets = report.packets, failed = report.failed, bytes = report.bytes, "frame sent");
        Ok(report)
    }
}
