//! Video delivery core of a dual-path camera.
//!
//! One camera and one H.264 encoder feed two consumers: a USB host (UVC,
//! through [`StreamOrchestrator`]) and a network client (RTSP/RTP, through
//! [`Server`]). The USB host is authoritative; the [`ResourceArbiter`]
//! moves the hardware between the two.

pub mod arbiter;
pub mod buffer;
pub mod capture;
pub mod controls;
pub mod crop;
pub mod device;
pub mod error;
pub mod media;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;

pub use arbiter::{ArbiterConfig, Hardware, ResourceArbiter};
pub use error::{Error, Result};
pub use media::Packetizer;
pub use relay::FrameRelay;
pub use server::{Server, ServerConfig};
pub use stream::{StreamFormat, StreamOrchestrator, UvcStreamHandler};
