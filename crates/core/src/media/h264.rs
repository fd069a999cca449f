use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::rtp::RtpHeader;
use super::{H264_PAYLOAD_TYPE, Packetizer, VIDEO_CLOCK_RATE};

/// Default RTP payload budget in bytes, leaving room for IP/UDP/RTP
/// headers inside a 1500-byte Ethernet frame.
pub const DEFAULT_MTU: usize = 1400;

/// NAL units considered per access unit; enough for SPS + PPS + slices.
pub const MAX_NALS_PER_FRAME: usize = 16;

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_FU_A: u8 = 28;

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts H.264 Annex B bitstreams into RTP packets. Supports two
/// packetization modes from RFC 6184:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the MTU are sent
///   as-is in a single RTP packet (12-byte header + NAL bytes).
///
/// - **FU-A Fragmentation** (§5.8): NALs exceeding the MTU are split
///   across multiple RTP packets. Each fragment carries a 2-byte FU
///   header (FU indicator + FU header) before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 2 bytes)
///   ```
///
///   A NAL of `len` bytes yields `ceil((len - 1) / (MTU - 2))` fragments;
///   its header byte travels in the FU indicator/header, not the payload.
///
/// ## Annex B NAL extraction
///
/// H.264 Annex B bitstreams delimit NAL units with start codes:
/// - 4-byte: `0x00 0x00 0x00 0x01`
/// - 3-byte: `0x00 0x00 0x01`
///
/// Zero padding before a start code (or at the end of the buffer) is not
/// part of the preceding NAL and is trimmed. At most
/// [`MAX_NALS_PER_FRAME`] NAL units are taken from one access unit.
///
/// ## SDP attributes (RFC 6184 §8.1)
///
/// - `a=rtpmap:96 H264/90000`
/// - `a=fmtp:96 packetization-mode=1`
/// - `a=control:track1`
///
/// SPS/PPS are captured from the bitstream (the encoder emits them with
/// every IDR frame); once seen, the fmtp line also carries
/// `profile-level-id` and `sprop-parameter-sets`.
///
/// ## Marker bit
///
/// Per RFC 6184 §5.1, the RTP marker bit is set on the last RTP packet
/// of an H.264 access unit (frame boundary).
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
    /// Create with explicit payload type, SSRC and first sequence number.
    pub fn new(pt: u8, ssrc: u32, sequence: u16) -> Self {
        Self::from_header(RtpHeader::new(pt, ssrc, sequence))
    }

    /// Create with payload type 96, a random SSRC and a random first
    /// sequence number (RFC 3550 §5.1, §8.1).
    pub fn random() -> Self {
        Self::from_header(RtpHeader::random(H264_PAYLOAD_TYPE))
    }

    fn from_header(header: RtpHeader) -> Self {
        Self {
            header,
            mtu: DEFAULT_MTU,
            sps: None,
            pps: None,
        }
    }

    /// Override the RTP payload budget. Values below 3 bytes cannot carry
    /// an FU-A fragment and are raised to 3.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(3);
        self
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Derive profile-level-id from SPS NAL (RFC 6184 §8.1): bytes 1–3 are profile_idc, constraint_set, level_idc.
    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    fn remember_parameter_set(slot: &mut Option<Vec<u8>>, nal: &[u8], name: &'static str) {
        if slot.as_deref() != Some(nal) {
            tracing::debug!(bytes = nal.len(), "H.264 {} captured from bitstream", name);
            *slot = Some(nal.to_vec());
        }
    }

    /// Packetize a single NAL unit into one or more RTP packets.
    ///
    /// If the NAL fits within the MTU, it is sent as a Single NAL Unit
    /// packet (RFC 6184 §5.6). Otherwise, FU-A fragmentation is used
    /// (RFC 6184 §5.8).
    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.mtu {
            // Single NAL Unit mode (RFC 6184 §5.6)
            let mut packet = self.header.begin_packet(is_last_nal, nal_unit.len());
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
        } else {
            // FU-A fragmentation (RFC 6184 §5.8)
            let nal_header = nal_unit[0];
            let nal_type = nal_header & 0x1f;

            // F and NRI bits from the original NAL, type = 28 (FU-A)
            let fu_indicator = (nal_header & 0xe0) | NAL_TYPE_FU_A;
            let payload = &nal_unit[1..];
            let max_fragment = self.mtu - 2;
            let fragments = payload.len().div_ceil(max_fragment);

            for (index, chunk) in payload.chunks(max_fragment).enumerate() {
                let first = index == 0;
                let last_fragment = index + 1 == fragments;

                // FU header: S=start, E=end, R=0, Type=original NAL type
                let start_bit = if first { 0x80 } else { 0x00 };
                let end_bit = if last_fragment { 0x40 } else { 0x00 };
                let fu_header = start_bit | end_bit | nal_type;

                let mut packet = self
                    .header
                    .begin_packet(is_last_nal && last_fragment, 2 + chunk.len());
                packet.push(fu_indicator);
                packet.push(fu_header);
                packet.extend_from_slice(chunk);
                packets.push(packet);
            }

            tracing::trace!(
                nal_type,
                nal_size = nal_unit.len(),
                fragments,
                "FU-A fragmented NAL unit"
            );
        }

        packets
    }

    /// Extract NAL units from an H.264 Annex B bitstream.
    ///
    /// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
    /// `00 00 01`) and returns the NAL data between them, excluding
    /// the start codes themselves and any trailing zero bytes.
    pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
        let mut i = 0usize;

        // (nal_data_start_index, start_code_length)
        let mut start_entries: Vec<(usize, usize)> = Vec::new();

        while i < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
                start_entries.push((i + 4, 4));
                i += 4;
            } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
                start_entries.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        let mut nal_units = Vec::new();
        for (idx, &(start, _)) in start_entries.iter().enumerate() {
            let mut end = match start_entries.get(idx + 1) {
                Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
                None => data.len(),
            };
            while end > start && data[end - 1] == 0 {
                end -= 1;
            }
            if start < end {
                if nal_units.len() == MAX_NALS_PER_FRAME {
                    tracing::warn!(
                        found = start_entries.len(),
                        max = MAX_NALS_PER_FRAME,
                        "access unit has too many NAL units, rest ignored"
                    );
                    break;
                }
                nal_units.push(&data[start..end]);
            }
        }

        nal_units
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let nal_units = Self::extract_nal_units(encoded_data);
        let mut packets = Vec::new();

        for nal in &nal_units {
            match nal[0] & 0x1f {
                NAL_TYPE_SPS => Self::remember_parameter_set(&mut self.sps, nal, "SPS"),
                NAL_TYPE_PPS => Self::remember_parameter_set(&mut self.pps, nal, "PPS"),
                _ => {}
            }
        }

        for (i, nal) in nal_units.iter().enumerate() {
            let is_last = i == nal_units.len() - 1;
            packets.append(&mut self.packetize_nal(nal, is_last));
        }

        self.header.advance_timestamp(timestamp_increment);

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            frame_bytes = encoded_data.len(),
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "frame packetized"
        );

        packets
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    /// 90 kHz clock rate per RFC 6184 §8.1.
    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }

    fn payload_type(&self) -> u8 {
        self.header.payload_type()
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc()
    }

    /// SDP attributes per RFC 6184 §8.2.1.
    ///
    /// Order matters: `a=rtpmap` defines the payload type and MUST precede
    /// `a=fmtp` which references it. ffplay and other clients parse attributes
    /// sequentially and expect this ordering.
    fn sdp_attributes(&self) -> Vec<String> {
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.header.payload_type());
        if let Some(pl) = self.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={}", pl));
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={}", sprop));
        }

        vec![
            format!(
                "a=rtpmap:{} {}/{}",
                self.payload_type(),
                self.codec_name(),
                self.clock_rate()
            ),
            fmtp,
            "a=control:track1".to_string(),
        ]
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp()
    }
}
