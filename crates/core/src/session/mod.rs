//! RTSP session state (RFC 2326 §3, §A.1).
//!
//! The camera serves one client at a time, so there is exactly one
//! [`RtspSession`] per connection and one [`RtpSession`] per server. The
//! control connection drives the state machine:
//!
//! ```text
//! Init  --OPTIONS/DESCRIBE--> Init
//! Init  --SETUP-------------> Ready
//! Ready --SETUP-------------> Ready
//! Ready --PLAY--------------> Playing
//! Playing --PLAY------------> Playing
//! any   --TEARDOWN----------> Init
//! any   --disconnect--------> Init
//! ```
//!
//! PLAY from Init and SETUP while Playing are answered with 455.

pub mod rtp;
pub mod transport;

use std::net::SocketAddr;

pub use rtp::{FrameSendReport, RtpSession, SharedRtpSession};
pub use transport::TransportHeader;

/// Session timeout advertised in the `Session` header, in seconds
/// (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspState {
    Init,
    Ready,
    Playing,
}

/// Control-connection state for the connected client.
#[derive(Debug)]
pub struct RtspSession {
    state: RtspState,
    id: Option<String>,
    client_addr: SocketAddr,
}

impl RtspSession {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            state: RtspState::Init,
            id: None,
            client_addr,
        }
    }

    pub fn state(&self) -> RtspState {
        self.state
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Session ID assigned by the last SETUP.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Enter `Ready` with a fresh random session ID and return it.
    pub fn setup(&mut self) -> &str {
        self.transition(RtspState::Ready);
        self.id.insert(format!("{:08X}", rand::random::<u32>()))
    }

    pub fn play(&mut self) {
        self.transition(RtspState::Playing);
    }

    /// Back to `Init`, forgetting the session ID.
    pub fn reset(&mut self) {
        self.transition(RtspState::Init);
        self.id = None;
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    pub fn header_value(&self) -> Option<String> {
        self.id
            .as_ref()
            .map(|id| format!("{};timeout={}", id, DEFAULT_SESSION_TIMEOUT_SECS))
    }

    fn transition(&mut self, next: RtspState) {
        if self.state != next {
            tracing::debug!(client = %self.client_addr, from = ?self.state, to = ?next, "RTSP state transition");
        }
        self.state = next;
    }
}
