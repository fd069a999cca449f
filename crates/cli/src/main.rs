mod config;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use config::{Config, ConfigError};
use dualcam::controls::{ControlHandler, IspControlBridge, XU_ISP_PROFILE};
use dualcam::device::EncoderKind;
use dualcam::device::synthetic::{RecordingIsp, SyntheticCamera, SyntheticEncoder};
use dualcam::stream::FrameTable;
use dualcam::{FrameRelay, Hardware, ResourceArbiter, Server, StreamFormat, StreamOrchestrator, UvcStreamHandler};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("server: {0}")]
    Server(#[from] dualcam::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UsbFormat {
    Raw,
    Mjpeg,
    H264,
}

impl From<UsbFormat> for StreamFormat {
    fn from(format: UsbFormat) -> Self {
        match format {
            UsbFormat::Raw => StreamFormat::Raw,
            UsbFormat::Mjpeg => StreamFormat::Mjpeg,
            UsbFormat::H264 => StreamFormat::H264,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "dualcam-server",
    about = "Dual-path camera: RTSP/H.264 server with a simulated USB host"
)]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Bind address (host:port)
    #[arg(long, short)]
    bind: Option<String>,

    /// Host advertised in SDP when clients connect through NAT
    #[arg(long)]
    public_host: Option<String>,

    /// Native camera size (WxH)
    #[arg(long, value_parser = parse_size)]
    native: Option<(u32, u32)>,

    /// Camera and RTP frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Simulate a USB host committing this format
    #[arg(long, value_enum)]
    usb_format: Option<UsbFormat>,

    /// Size the simulated USB host asks for (WxH)
    #[arg(long, value_parser = parse_size, default_value = "1280x720")]
    usb_size: (u32, u32),

    /// Seconds before the simulated USB host commits
    #[arg(long, default_value_t = 5)]
    usb_after: u64,

    /// Seconds the simulated USB host streams before stopping
    #[arg(long, default_value_t = 10)]
    usb_duration: u64,

    /// ISP profile the simulated USB host selects (0-5)
    #[arg(long)]
    isp_profile: Option<u8>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got {s:?}"))?;
    let w = w.trim().parse().map_err(|_| format!("bad width in {s:?}"))?;
    let h = h.trim().parse().map_err(|_| format!("bad height in {s:?}"))?;
    Ok((w, h))
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if let Err(e) = run(args) {
        tracing::error!(error = %e, "dualcam-server failed");
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(host) = &args.public_host {
        config.server.public_host = Some(host.clone());
    }
    if let Some((w, h)) = args.native {
        config.camera.width = w;
        config.camera.height = h;
    }
    if let Some(fps) = args.fps {
        config.camera.fps = fps;
        config.server.fps = fps;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<(), CliError> {
    let config = load_config(&args)?;
    let camera_cfg = &config.camera;

    let camera = SyntheticCamera::new(camera_cfg.width, camera_cfg.height)
        .with_frame_interval(Duration::from_secs(1) / camera_cfg.fps);
    let h264 = SyntheticEncoder::open(EncoderKind::H264);
    let relay = Arc::new(FrameRelay::new(config.server.relay_capacity));
    let arbiter = Arc::new(ResourceArbiter::new(
        Hardware::new(Box::new(camera), Box::new(h264)),
        relay,
        config.arbiter_config(),
    ));

    let mut server = Server::new(config.server_config(), arbiter.clone());
    server.start()?;
    let addr = server.local_addr()?;
    tracing::info!(
        %addr,
        native = format_args!("{}x{}", camera_cfg.width, camera_cfg.height),
        fps = camera_cfg.fps,
        "RTSP server ready, press Enter to stop"
    );

    let running = Arc::new(AtomicBool::new(true));
    let usb_host = args.usb_format.map(|format| {
        let host = UsbHost {
            format: format.into(),
            size: args.usb_size,
            after: Duration::from_secs(args.usb_after),
            duration: Duration::from_secs(args.usb_duration),
            isp_profile: args.isp_profile,
            native: (camera_cfg.width, camera_cfg.height),
        };
        let orchestrator = StreamOrchestrator::new(
            arbiter.clone(),
            Box::new(SyntheticEncoder::open(EncoderKind::Jpeg)),
            FrameTable::for_native(camera_cfg.width, camera_cfg.height),
            config.orchestrator_config(),
        );
        host.spawn(orchestrator, running.clone())
    });

    let mut input = String::new();
    let read = io::stdin().read_line(&mut input);

    running.store(false, Ordering::SeqCst);
    match usb_host {
        Some(Ok(handle)) => {
            if handle.join().is_err() {
                tracing::error!("USB host thread panicked");
            }
        }
        Some(Err(e)) => tracing::error!(error = %e, "failed to spawn USB host"),
        None => {}
    }
    server.stop();
    read?;
    Ok(())
}

/// Stand-in for the USB gadget driver: commits a format, pulls frames at
/// the committed rate, then stops.
struct UsbHost {
    format: StreamFormat,
    size: (u32, u32),
    after: Duration,
    duration: Duration,
    isp_profile: Option<u8>,
    native: (u32, u32),
}

impl UsbHost {
    fn spawn(
        self,
        orchestrator: StreamOrchestrator,
        running: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("usb-host".into())
            .spawn(move || self.run(orchestrator, &running))
    }

    fn run(self, mut orchestrator: StreamOrchestrator, running: &AtomicBool) {
        if !sleep_while_running(self.after, running) {
            return;
        }

        if let Some(profile) = self.isp_profile {
            let mut controls = IspControlBridge::new(RecordingIsp::default());
            controls.on_extension_unit(XU_ISP_PROFILE, profile);
            tracing::debug!(applied = ?controls.backend().applied(), "ISP controls");
        }

        let (width, height) = self.size;
        let fps = orchestrator
            .frame_table()
            .frames(self.format)
            .iter()
            .find(|size| size.width == width && size.height == height)
            .map(|size| size.max_fps)
            .unwrap_or(30);
        if let Err(e) = orchestrator.on_commit(self.format, width, height, fps) {
            tracing::warn!(
                error = %e,
                format = ?self.format,
                native = format_args!("{}x{}", self.native.0, self.native.1),
                "USB commit failed"
            );
            return;
        }

        let interval = Duration::from_secs(1) / fps.max(1);
        let deadline = Instant::now() + self.duration;
        while running.load(Ordering::SeqCst) && Instant::now() < deadline {
            let frame = orchestrator.on_get_frame().map(|frame| frame.info);
            match frame {
                Some(info) => orchestrator.on_release_frame(info),
                None => tracing::debug!("USB frame unavailable"),
            }
            thread::sleep(interval);
        }

        let counters = orchestrator.counters();
        orchestrator.on_stop();
        tracing::info!(
            frames = counters.frames(),
            bytes = counters.bytes(),
            "USB host stopped"
        );
    }
}

fn sleep_while_running(duration: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
    running.load(Ordering::SeqCst)
}
