use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::arbiter::ResourceArbiter;
use crate::capture::{RtpSender, SenderTiming};
use crate::device::EncoderParams;
use crate::error::{Error, Result};
use crate::media::h264::{DEFAULT_MTU, H264Packetizer};
use crate::session::{RtpSession, SharedRtpSession};
use crate::transport::UdpTransport;
use crate::transport::tcp;

/// Server-level configuration used by the control and sender threads.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listen address.
    pub bind_addr: String,
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// A client silent for this long is disconnected.
    pub client_timeout: Duration,
    /// RTP payload budget per packet.
    pub mtu: usize,
    /// Frame rate the RTP timestamp advances by.
    pub fps: u32,
    /// H.264 settings used when the RTSP path drives the encoder itself.
    pub encoder: EncoderParams,
    pub timing: SenderTiming,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:554".to_string(),
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            client_timeout: Duration::from_secs(60),
            mtu: DEFAULT_MTU,
            fps: 30,
            encoder: EncoderParams::default(),
            timing: SenderTiming::default(),
        }
    }
}

/// RTSP server for the camera's network path.
///
/// [`start`](Self::start) binds the RTSP listener and the RTP socket and
/// spawns two threads: the accept loop serving one client at a time, and
/// the [`RtpSender`] that feeds the client from the USB relay or from
/// self-capture.
pub struct Server {
    config: Arc<ServerConfig>,
    arbiter: Arc<ResourceArbiter>,
    running: Arc<AtomicBool>,
    rtp: Option<SharedRtpSession>,
    local_addr: Option<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig, arbiter: Arc<ResourceArbiter>) -> Self {
        Self {
            config: Arc::new(config),
            arbiter,
            running: Arc::new(AtomicBool::new(false)),
            rtp: None,
            local_addr: None,
            threads: Vec::new(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let packetizer = H264Packetizer::random().with_mtu(self.config.mtu);
        let rtp = RtpSession::new(Box::new(packetizer), UdpTransport::bind()?, self.config.fps)
            .into_shared();

        self.running.store(true, Ordering::SeqCst);

        let accept = {
            let rtp = rtp.clone();
            let relay = self.arbiter.relay().clone();
            let config = self.config.clone();
            let running = self.running.clone();
            thread::Builder::new()
                .name("rtsp-accept".into())
                .spawn(move || tcp::accept_loop(listener, rtp, relay, config, running))
        };
        let sender = RtpSender::new(
            self.arbiter.clone(),
            rtp.clone(),
            self.config.encoder,
            self.config.timing,
            self.running.clone(),
        );
        let spawned = accept.and_then(|accept| {
            self.threads.push(accept);
            thread::Builder::new()
                .name("rtp-sender".into())
                .spawn(move || sender.run())
        });
        match spawned {
            Ok(sender) => self.threads.push(sender),
            Err(e) => {
                self.shutdown();
                return Err(e.into());
            }
        }

        self.rtp = Some(rtp);
        self.local_addr = Some(local_addr);
        tracing::info!(addr = %local_addr, "RTSP server listening");
        Ok(())
    }

    /// Stop both threads and wait for them. The current client, if any, is
    /// disconnected.
    pub fn stop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        self.shutdown();
        if let Some(rtp) = self.rtp.take() {
            rtp.lock().stop();
        }
        self.local_addr = None;
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.arbiter.relay().wake();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("server thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the RTSP listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(Error::NotStarted)
    }

    /// RTP packets sent and failed since start.
    pub fn rtp_stats(&self) -> Result<(u64, u64)> {
        let rtp = self.rtp.as_ref().ok_or(Error::NotStarted)?;
        Ok(rtp.lock().stats())
    }

    /// Returns the server's protocol configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
