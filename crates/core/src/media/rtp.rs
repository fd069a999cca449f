/// Size of the fixed RTP header; no CSRCs or extensions are ever sent.
pub const RTP_HEADER_LEN: usize = 12;

/// V=2, P=0, X=0, CC=0.
const FIRST_BYTE: u8 = 0x80;

/// Per-stream RTP header state (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The sequence number advances on every packet, the timestamp once per
/// frame. Both wrap.
#[derive(Debug)]
pub struct RtpHeader {
    pt: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, sequence: u16) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            sequence,
            "RTP header state created"
        );
        Self {
            pt: pt & 0x7f,
            ssrc,
            sequence,
            timestamp: 0,
        }
    }

    /// Random SSRC (RFC 3550 §8.1) and random first sequence number.
    pub fn random(pt: u8) -> Self {
        Self::new(pt, rand::random::<u32>(), rand::random::<u16>())
    }

    pub fn payload_type(&self) -> u8 {
        self.pt
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp the next packet will carry.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Allocate a packet with room for `payload_len` bytes, write the header
    /// into it and consume one sequence number.
    pub fn begin_packet(&mut self, marker: bool, payload_len: usize) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload_len);
        packet.push(FIRST_BYTE);
        packet.push(((marker as u8) << 7) | self.pt);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }

    /// Move to the next frame; `increment` is `90000 / fps` for video.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment);
    }
}
