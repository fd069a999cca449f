//! Helpers shared by the loopback tests.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dualcam::capture::SenderTiming;
use dualcam::device::EncoderKind;
use dualcam::device::synthetic::{CameraProbe, EncoderProbe, SyntheticCamera, SyntheticEncoder};
use dualcam::{ArbiterConfig, FrameRelay, Hardware, ResourceArbiter, Server, ServerConfig};

pub struct Rig {
    pub server: Server,
    pub arbiter: Arc<ResourceArbiter>,
    pub camera: Arc<CameraProbe>,
    pub h264: Arc<EncoderProbe>,
    /// Spare JPEG encoder for a USB orchestrator.
    pub jpeg: Option<SyntheticEncoder>,
}

pub fn start_server(width: u32, height: u32, frame_interval: Duration) -> Rig {
    let camera = SyntheticCamera::new(width, height).with_frame_interval(frame_interval);
    let h264 = SyntheticEncoder::open(EncoderKind::H264);
    let (camera_probe, h264_probe) = (camera.probe(), h264.probe());
    let arbiter = Arc::new(ResourceArbiter::new(
        Hardware::new(Box::new(camera), Box::new(h264)),
        Arc::new(FrameRelay::default()),
        ArbiterConfig::default(),
    ));
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        timing: SenderTiming {
            idle_poll: Duration::from_millis(10),
            frame_wait: Duration::from_millis(100),
            restart_backoff: Duration::from_millis(50),
        },
        ..Default::default()
    };
    let mut server = Server::new(config, arbiter.clone());
    server.start().expect("server start");
    Rig {
        server,
        arbiter,
        camera: camera_probe,
        h264: h264_probe,
        jpeg: Some(SyntheticEncoder::open(EncoderKind::Jpeg)),
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to server");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

pub fn udp_receiver() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

/// Send one request and read the full response, body included.
pub fn rtsp_request(stream: &mut TcpStream, request: &str) -> std::io::Result<String> {
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    if let Some(len) = header(&response, "Content-Length").and_then(|v| v.parse::<usize>().ok())
        && len > 0
    {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        response.push_str(&String::from_utf8_lossy(&body));
    }

    Ok(response)
}

pub fn status(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

pub fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
