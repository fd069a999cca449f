/// Client-side transport info from the RTSP `Transport` header
/// (RFC 2326 §12.39).
///
/// ```text
/// Client -> Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server -> Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=50312-50313;ssrc=1A2B3C4D
/// ```
///
/// Only UDP unicast is supported. Interleaved TCP (`RTP/AVP/TCP`,
/// `interleaved=`) is rejected by the caller with 461.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    /// Client's requested RTP port.
    pub client_rtp_port: u16,
    /// Client's RTCP port, `client_rtp_port + 1` when the header gives one port.
    pub client_rtcp_port: u16,
}

impl TransportHeader {
    /// Parse the `client_port` parameter.
    ///
    /// Accepts `client_port=P` and `client_port=P-Q`. A missing parameter,
    /// a non-numeric value or port 0 yields `None`.
    ///
    /// ```
    /// use dualcam::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.client_rtp_port, 8000);
    /// assert_eq!(th.client_rtcp_port, 8001);
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let ports = header
            .split(';')
            .find_map(|part| part.trim().strip_prefix("client_port="))?;

        let (rtp, rtcp) = match ports.split_once('-') {
            Some((rtp, rtcp)) => {
                let rtp: u16 = rtp.trim().parse().ok()?;
                (rtp, rtcp.trim().parse().ok()?)
            }
            None => {
                let rtp: u16 = ports.trim().parse().ok()?;
                (rtp, rtp.wrapping_add(1))
            }
        };
        if rtp == 0 {
            return None;
        }
        Some(TransportHeader {
            client_rtp_port: rtp,
            client_rtcp_port: rtcp,
        })
    }

    /// Whether the client asked for RTP interleaved on the RTSP connection.
    pub fn is_interleaved(header: &str) -> bool {
        header.contains("RTP/AVP/TCP") || header.contains("interleaved=")
    }
}
