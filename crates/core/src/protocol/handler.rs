use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::request::{self, RtspRequest};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::relay::FrameRelay;
use crate::server::ServerConfig;
use crate::session::{RtspSession, RtspState, SharedRtpSession, TransportHeader};

/// Methods this server implements, as listed in `Public` and `Allow`.
pub const SUPPORTED_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN";

/// Handles RTSP requests for the single client connection.
///
/// Owns the connection's [`RtspSession`] and drives the server's shared
/// RTP session and frame relay through it.
pub struct MethodHandler {
    session: RtspSession,
    rtp: SharedRtpSession,
    relay: Arc<FrameRelay>,
    config: Arc<ServerConfig>,
}

impl MethodHandler {
    pub fn new(
        client_addr: SocketAddr,
        rtp: SharedRtpSession,
        relay: Arc<FrameRelay>,
        config: Arc<ServerConfig>,
    ) -> Self {
        MethodHandler {
            session: RtspSession::new(client_addr),
            rtp,
            relay,
            config,
        }
    }

    pub fn state(&self) -> RtspState {
        self.session.state()
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq();

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, &request.uri),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, &request.uri),
            "TEARDOWN" => self.handle_teardown(cseq),
            _ => {
                tracing::warn!(method = %request.method, cseq, "unsupported RTSP method");
                RtspResponse::method_not_allowed()
                    .with_cseq(cseq)
                    .add_header("Allow", SUPPORTED_METHODS)
            }
        }
    }

    /// Response to a request that could not be parsed. The connection stays
    /// open.
    pub fn handle_malformed(&self, raw: &str) -> RtspResponse {
        let cseq = request::scan_cseq(raw);
        tracing::warn!(client = %self.session.client_addr(), cseq, "malformed RTSP request");
        RtspResponse::bad_request().with_cseq(cseq)
    }

    /// The client went away: stop streaming and forget the session.
    pub fn disconnect(&mut self) {
        self.stop_streaming();
        self.session.reset();
    }

    fn handle_options(&self, cseq: u32) -> RtspResponse {
        tracing::debug!(cseq, "OPTIONS");
        RtspResponse::ok()
            .with_cseq(cseq)
            .add_header("Public", SUPPORTED_METHODS)
    }

    /// Host clients should use to reach this server: the configured public
    /// host, else the host part of the request URI, else the client's own
    /// address.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri.strip_prefix("rtsp://") {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.session.client_addr().ip().to_string()
    }

    fn handle_describe(&self, cseq: u32, uri: &str) -> RtspResponse {
        tracing::debug!(cseq, uri, "DESCRIBE");

        let host = self.host_from_uri_or_client(uri);
        let body = {
            let rtp = self.rtp.lock();
            sdp::generate_sdp(rtp.packetizer(), &host, &self.config)
        };

        RtspResponse::ok()
            .with_cseq(cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", uri)
            .with_body(body)
    }

    /// SETUP is valid from Init or Ready; from Playing it is answered with 455.
    fn handle_setup(&mut self, cseq: u32, request: &RtspRequest) -> RtspResponse {
        if self.session.state() == RtspState::Playing {
            tracing::warn!(cseq, "SETUP while playing");
            return RtspResponse::method_not_valid_in_state().with_cseq(cseq);
        }

        let header = request.get_header("Transport").unwrap_or("");
        if TransportHeader::is_interleaved(header) {
            tracing::warn!(cseq, transport = header, "client requested TCP transport (not implemented)");
            return RtspResponse::unsupported_transport()
                .with_cseq(cseq)
                .add_header("Unsupported", "RTP/AVP/TCP");
        }
        let Some(transport) = TransportHeader::parse(header) else {
            tracing::warn!(cseq, transport = header, "SETUP without usable client_port");
            return RtspResponse::unsupported_transport().with_cseq(cseq);
        };

        let client_rtp = SocketAddr::new(self.session.client_addr().ip(), transport.client_rtp_port);
        let (server_port, ssrc) = {
            let mut rtp = self.rtp.lock();
            rtp.set_destination(client_rtp);
            (rtp.local_port(), rtp.ssrc())
        };
        let session_id = self.session.setup().to_string();

        tracing::info!(
            session_id,
            uri = %request.uri,
            client_rtp = %client_rtp,
            server_port,
            "session created via SETUP"
        );

        let transport_response = format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc={:08X}",
            transport.client_rtp_port,
            transport.client_rtcp_port,
            server_port,
            server_port.wrapping_add(1),
            ssrc
        );

        let mut resp = RtspResponse::ok()
            .with_cseq(cseq)
            .add_header("Transport", &transport_response);
        if let Some(value) = self.session.header_value() {
            resp = resp.add_header("Session", &value);
        }
        resp
    }

    fn handle_play(&mut self, cseq: u32, uri: &str) -> RtspResponse {
        if self.session.state() == RtspState::Init {
            tracing::warn!(cseq, "PLAY before SETUP");
            return RtspResponse::method_not_valid_in_state().with_cseq(cseq);
        }

        let (sequence, rtptime) = {
            let mut rtp = self.rtp.lock();
            rtp.start();
            (rtp.next_sequence(), rtp.next_rtp_timestamp())
        };
        self.relay.open();
        // the sender may be idling; make it look at the new state now
        self.relay.wake();
        self.session.play();
        tracing::info!(session_id = ?self.session.id(), "session started playing");

        let mut resp = RtspResponse::ok().with_cseq(cseq);
        if let Some(value) = self.session.header_value() {
            resp = resp.add_header("Session", &value);
        }
        resp.add_header("Range", "npt=0.000-").add_header(
            "RTP-Info",
            &format!("url={};seq={};rtptime={}", uri, sequence, rtptime),
        )
    }

    fn handle_teardown(&mut self, cseq: u32) -> RtspResponse {
        tracing::info!(session_id = ?self.session.id(), "session terminated via TEARDOWN");
        self.stop_streaming();
        self.session.reset();
        RtspResponse::ok().with_cseq(cseq)
    }

    fn stop_streaming(&mut self) {
        self.rtp.lock().stop();
        self.relay.close();
        self.relay.wake();
    }
}
