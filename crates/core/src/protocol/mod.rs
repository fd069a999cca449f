//! RTSP protocol implementation (RFC 2326 subset).
//!
//! Parses requests, builds responses, routes methods and generates SDP
//! for the camera's single H.264 track.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! ```text
//! DESCRIBE rtsp://camera/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate the UDP destination |
//! | PLAY | §10.5 | Start media delivery |
//! | TEARDOWN | §10.7 | Stop delivery and end the session |
//!
//! Anything else is answered with 405 and an `Allow` header.

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;
