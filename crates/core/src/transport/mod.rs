//! Network transport for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): RTSP request/response signaling. One client at a
//!   time, served on its own thread.
//! - **UDP** ([`udp`]): RTP media packets from a single ephemeral socket.
//!
//! Interleaved RTP over the RTSP connection (RFC 2326 §10.12) is not
//! supported; SETUP asking for it gets 461.

pub mod tcp;
pub mod udp;

pub use udp::UdpTransport;
