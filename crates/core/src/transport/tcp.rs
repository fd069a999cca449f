use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::protocol::MethodHandler;
use crate::protocol::RtspRequest;
use crate::relay::FrameRelay;
use crate::server::ServerConfig;
use crate::session::SharedRtpSession;

/// Granularity of socket reads. The idle timeout and shutdown flag are
/// checked between polls.
const READ_POLL: Duration = Duration::from_millis(200);

/// Requests larger than this are not RTSP and close the connection.
const MAX_REQUEST_LEN: usize = 16 * 1024;

/// Non-blocking TCP accept loop serving one client at a time.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
/// Connections arriving while a client is being served are accepted and
/// closed immediately.
pub fn accept_loop(
    listener: TcpListener,
    rtp: SharedRtpSession,
    relay: Arc<FrameRelay>,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
) {
    let busy = Arc::new(AtomicBool::new(false));

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if busy.swap(true, Ordering::SeqCst) {
                    tracing::warn!(%peer_addr, "client already connected, rejecting");
                    drop(stream);
                    continue;
                }
                if stream.set_nonblocking(false).is_err() {
                    busy.store(false, Ordering::SeqCst);
                    continue;
                }
                let rtp = rtp.clone();
                let relay = relay.clone();
                let config = config.clone();
                let running = running.clone();
                let busy = busy.clone();
                thread::spawn(move || {
                    Connection::handle(stream, rtp, relay, config, &running);
                    busy.store(false, Ordering::SeqCst);
                });
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// The RTSP client connection.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    handler: MethodHandler,
    peer_addr: SocketAddr,
    idle_timeout: Duration,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(
        stream: TcpStream,
        rtp: SharedRtpSession,
        relay: Arc<FrameRelay>,
        config: Arc<ServerConfig>,
        running: &AtomicBool,
    ) {
        let Ok(peer_addr) = stream.peer_addr() else {
            return;
        };

        tracing::info!(%peer_addr, "client connected");

        if let Err(e) = stream.set_read_timeout(Some(READ_POLL)) {
            tracing::warn!(%peer_addr, error = %e, "cannot set read timeout");
            return;
        }
        let Ok(reader_stream) = stream.try_clone() else {
            return;
        };

        let idle_timeout = config.client_timeout;
        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer: stream,
            handler: MethodHandler::new(peer_addr, rtp, relay, config),
            peer_addr,
            idle_timeout,
        };

        let reason = conn.run(running);
        conn.handler.disconnect();

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        loop {
            let request_text = match self.read_request(running) {
                Ok(text) => text,
                Err(reason) => return reason,
            };

            let response = match RtspRequest::parse(&request_text) {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        cseq = request.cseq(),
                        "request"
                    );
                    self.handler.handle(&request)
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    self.handler.handle_malformed(&request_text)
                }
            };

            tracing::debug!(
                peer = %self.peer_addr,
                status = response.status_code,
                "response"
            );

            if self
                .writer
                .write_all(response.serialize().as_bytes())
                .is_err()
            {
                return "write error";
            }
        }
    }

    /// Read up to and including the blank line ending a request. Blank
    /// lines before a request are skipped. Bytes that are not UTF-8 are
    /// replaced, so garbage still reaches the parser and gets a 400.
    fn read_request(&mut self, running: &AtomicBool) -> Result<String, &'static str> {
        let mut raw: Vec<u8> = Vec::new();
        let mut line_start = 0;
        let mut idle = Duration::ZERO;

        loop {
            if !running.load(Ordering::SeqCst) {
                return Err("server shutting down");
            }
            let before = raw.len();
            match self.reader.read_until(b'\n', &mut raw) {
                Ok(0) => return Err("connection closed by client"),
                Ok(_) => {
                    idle = Duration::ZERO;
                    let line = &raw[line_start..];
                    if line == b"\r\n" || line == b"\n" {
                        if raw.iter().all(u8::is_ascii_whitespace) {
                            raw.clear();
                            line_start = 0;
                            continue;
                        }
                        return Ok(String::from_utf8_lossy(&raw).into_owned());
                    }
                    line_start = raw.len();
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if raw.len() > before {
                        idle = Duration::ZERO;
                    } else {
                        idle += READ_POLL;
                    }
                    if idle >= self.idle_timeout {
                        return Err("idle timeout");
                    }
                }
                Err(_) => return Err("read error"),
            }
            if raw.len() > MAX_REQUEST_LEN {
                return Err("request too large");
            }
        }
    }
}
