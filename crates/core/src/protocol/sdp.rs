//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          <- protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  <- origin
//! s=<session-name>                             <- session name
//! c=IN IP4 <addr>                              <- connection address
//! t=0 0                                        <- timing (live stream)
//! a=tool:dualcam-rs                            <- server software (§6)
//! a=sendonly                                   <- direction (§6)
//! m=video 0 RTP/AVP 96                         <- media description
//! a=rtpmap:96 H264/90000                       <- codec/clock rate
//! a=fmtp:96 packetization-mode=1               <- codec parameters
//! a=control:track1                             <- track control URL
//! ```
//!
//! Session/origin fields come from [`ServerConfig`](crate::ServerConfig).

use crate::media::Packetizer;
use crate::server::ServerConfig;

/// Generate the SDP for the single H.264 track.
///
/// `ip` is the address clients should use for this server.
pub fn generate_sdp(packetizer: &dyn Packetizer, ip: &str, config: &ServerConfig) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        config.sdp_username, config.sdp_session_id, config.sdp_session_version, ip
    ));
    sdp.push(format!("s={}", config.sdp_session_name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:dualcam-rs".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push(format!("m=video 0 RTP/AVP {}", packetizer.payload_type()));
    sdp.extend(packetizer.sdp_attributes());

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
