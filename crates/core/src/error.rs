//! Error types for the camera delivery core.

use std::fmt;
use std::time::Duration;

use crate::buffer::BufferState;
use crate::stream::StreamFormat;

/// Errors that can occur anywhere in the delivery core.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Device**: [`DeviceFault`](Self::DeviceFault) for capture/encode
///   device or allocation failures. Fatal to the current stream session,
///   which rolls back to idle.
/// - **Negotiation**: [`FormatRejected`](Self::FormatRejected) when the
///   host asks for a format/size/rate outside the frame table.
/// - **Arbitration**: [`ResourceContention`](Self::ResourceContention).
/// - **Pipeline misuse**: [`BufferTransition`](Self::BufferTransition),
///   [`NotStreaming`](Self::NotStreaming), [`FrameInFlight`](Self::FrameInFlight),
///   [`UnknownFrame`](Self::UnknownFrame).
/// - **Network**: [`Io`](Self::Io), [`Parse`](Self::Parse),
///   [`RtpInactive`](Self::RtpInactive).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A capture or encode device failed (configure, dequeue, encode,
    /// buffer allocation).
    #[error("{device} fault: {reason}")]
    DeviceFault {
        device: &'static str,
        reason: String,
    },

    /// The requested format, resolution or frame rate is not offered.
    #[error("format rejected: {format:?} {width}x{height}@{fps}")]
    FormatRejected {
        format: StreamFormat,
        width: u32,
        height: u32,
        fps: u32,
    },

    /// The hardware handoff from self-capture did not complete in time.
    #[error("hardware still held by self-capture after {waited:?}")]
    ResourceContention { waited: Duration },

    /// A buffer was moved between two ownership states that are not
    /// connected in the pipeline.
    #[error("illegal buffer transition {from:?} -> {to:?}")]
    BufferTransition { from: BufferState, to: BufferState },

    /// A frame was requested while no stream session is committed.
    #[error("no stream session committed")]
    NotStreaming,

    /// A frame was requested before the previous one was released.
    #[error("previous frame has not been released")]
    FrameInFlight,

    /// A released frame does not match the one in flight.
    #[error("frame {sequence} is not in flight")]
    UnknownFrame { sequence: u64 },

    /// A frame was handed to an RTP session that is not playing.
    #[error("RTP session is not active")]
    RtpInactive,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

impl Error {
    pub(crate) fn device(device: &'static str, reason: impl Into<String>) -> Self {
        Self::DeviceFault {
            device,
            reason: reason.into(),
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
