use crate::error::{Error, ParseErrorKind};

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. None of the
/// supported methods carry a request body.
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN).
    pub method: String,
    /// Request-URI (e.g. `rtsp://camera/stream/track1`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs, names as received.
    pub headers: Vec<(String, String)>,
}

impl RtspRequest {
    /// Parse an RTSP request from its text representation.
    ///
    /// Expects a request line followed by headers and a blank line. Returns
    /// [`Error::Parse`] on malformed input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines().skip_while(|line| line.trim().is_empty());

        let request_line = lines.next().ok_or(Error::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let [method, uri, version] = parts[..] else {
            return Err(Error::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        };

        if !method
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(Error::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or(Error::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(RtspRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Sequence number to echo in the response (RFC 2326 §12.17).
    ///
    /// A missing or non-numeric `CSeq` reads as 0.
    pub fn cseq(&self) -> u32 {
        self.get_header("CSeq").map_or(0, leading_number)
    }
}

/// Find `CSeq:` anywhere in `raw` (case-insensitive) and read the number
/// after it. Used for requests too broken to parse, so the error response
/// still carries the client's sequence number.
pub fn scan_cseq(raw: &str) -> u32 {
    const TOKEN: &[u8] = b"cseq:";
    raw.as_bytes()
        .windows(TOKEN.len())
        .position(|w| w.eq_ignore_ascii_case(TOKEN))
        .map_or(0, |at| leading_number(&raw[at + TOKEN.len()..]))
}

/// Leading decimal digits after optional whitespace, saturating at
/// `u32::MAX`; 0 if there are none.
fn leading_number(text: &str) -> u32 {
    text.trim_start_matches([' ', '\t'])
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u32, |n, d| n.saturating_mul(10).saturating_add(u32::from(d - b'0')))
}
