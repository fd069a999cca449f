//! USB takes the hardware from a running self-capture session and gives it
//! back, with an RTSP client playing throughout.

mod common;

use std::time::Duration;

use common::{connect, rtsp_request, start_server, status, udp_receiver, wait_until};
use dualcam::arbiter::Owner;
use dualcam::device::PixelFormat;
use dualcam::stream::{FrameTable, OrchestratorConfig, StreamState};
use dualcam::{Error, StreamFormat, StreamOrchestrator, UvcStreamHandler};

const URI: &str = "rtsp://127.0.0.1/stream";

#[test]
fn usb_commit_preempts_self_capture() {
    let mut rig = start_server(1920, 1080, Duration::from_millis(10));
    let receiver = udp_receiver();
    let port = receiver.local_addr().unwrap().port();

    let mut stream = connect(rig.server.local_addr().unwrap());
    let resp = rtsp_request(
        &mut stream,
        &format!("SETUP {URI} RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port={port}-{}\r\n\r\n", port + 1),
    )
    .unwrap();
    assert_eq!(status(&resp), 200);
    let resp = rtsp_request(&mut stream, &format!("PLAY {URI} RTSP/1.0\r\nCSeq: 2\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), 200);

    // self-capture at native resolution
    assert!(wait_until(Duration::from_secs(5), || rig.h264.frames() >= 2));
    assert_eq!(rig.arbiter.owner(), Owner::SelfCapture);
    assert_eq!(rig.h264.last_config().map(|c| (c.0, c.1)), Some((1920, 1080)));

    let mut orchestrator = StreamOrchestrator::new(
        rig.arbiter.clone(),
        Box::new(rig.jpeg.take().unwrap()),
        FrameTable::for_native(1920, 1080),
        OrchestratorConfig::default(),
    );
    orchestrator.commit(StreamFormat::H264, 640, 480, 30).unwrap();

    assert_eq!(orchestrator.state(), StreamState::Streaming);
    assert!(orchestrator.is_cropping());
    assert_eq!(rig.arbiter.owner(), Owner::Usb);
    assert_eq!(rig.h264.last_config().map(|c| (c.0, c.1)), Some((640, 480)));
    assert_eq!(rig.h264.reopens(), 1);
    assert_eq!(
        rig.camera.last_config(),
        Some((1920, 1080, PixelFormat::Yuv420))
    );
    assert_eq!(rig.camera.conflicts(), 0);
    assert_eq!(rig.h264.conflicts(), 0);
    assert_eq!(rig.camera.leaked(), 0);
    assert_eq!(rig.h264.leaked(), 0);

    // USB frames now reach the RTSP client through the relay
    let (sent_before, _) = rig.server.rtp_stats().unwrap();
    let relay = rig.arbiter.relay().clone();
    let offered_before = relay.offered();
    assert!(wait_until(Duration::from_secs(5), || {
        let info = orchestrator.on_get_frame().map(|frame| frame.info);
        if let Some(info) = info {
            orchestrator.on_release_frame(info);
        }
        rig.server.rtp_stats().unwrap().0 > sent_before
    }));
    assert!(relay.offered() > offered_before);
    assert_eq!(rig.camera.outstanding(), 0);

    // back to self-capture once USB stops
    let configures = rig.camera.configures();
    orchestrator.on_stop();
    assert!(wait_until(Duration::from_secs(5), || {
        rig.camera.configures() > configures && rig.arbiter.owner() == Owner::SelfCapture
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        rig.h264.last_config().map(|c| (c.0, c.1)) == Some((1920, 1080))
    }));
    assert_eq!(rig.camera.conflicts(), 0);
    assert_eq!(rig.h264.leaked(), 0);

    rig.server.stop();
    assert_eq!(rig.arbiter.owner(), Owner::Available);
}

#[test]
fn usb_commit_without_rtsp_client() {
    let mut rig = start_server(640, 480, Duration::from_millis(5));
    let mut orchestrator = StreamOrchestrator::new(
        rig.arbiter.clone(),
        Box::new(rig.jpeg.take().unwrap()),
        FrameTable::for_native(640, 480),
        OrchestratorConfig::default(),
    );

    for format in StreamFormat::ALL {
        let fps = orchestrator.frame_table().frames(format)[0].max_fps;
        orchestrator.commit(format, 320, 240, fps).unwrap();
        let frame = orchestrator.on_get_frame().map(|frame| frame.info).unwrap();
        assert_eq!((frame.width, frame.height, frame.format), (320, 240, format));
        orchestrator.on_release_frame(frame);
    }
    assert_eq!(rig.camera.configures(), 3);
    assert_eq!(rig.camera.conflicts(), 0);

    // relay stays closed without a playing client
    assert_eq!(rig.arbiter.relay().offered(), 0);
    orchestrator.on_stop();
    assert_eq!(rig.arbiter.owner(), Owner::Available);
    rig.server.stop();
}

#[test]
fn slow_self_capture_cannot_lock_out_usb() {
    // one frame takes longer than the 500 ms handoff bound
    let mut rig = start_server(64, 64, Duration::from_millis(900));
    let receiver = udp_receiver();
    let port = receiver.local_addr().unwrap().port();

    let mut stream = connect(rig.server.local_addr().unwrap());
    let resp = rtsp_request(
        &mut stream,
        &format!("SETUP {URI} RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port={port}-{}\r\n\r\n", port + 1),
    )
    .unwrap();
    assert_eq!(status(&resp), 200);
    let resp = rtsp_request(&mut stream, &format!("PLAY {URI} RTSP/1.0\r\nCSeq: 2\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), 200);
    assert!(wait_until(Duration::from_secs(3), || rig.camera.is_streaming()));
    assert_eq!(rig.arbiter.owner(), Owner::SelfCapture);

    let mut orchestrator = StreamOrchestrator::new(
        rig.arbiter.clone(),
        Box::new(rig.jpeg.take().unwrap()),
        FrameTable::for_native(64, 64),
        OrchestratorConfig::default(),
    );
    orchestrator.commit(StreamFormat::H264, 64, 64, 30).unwrap();
    assert!(rig.arbiter.usb_owns());

    let mut delivered = false;
    assert!(wait_until(Duration::from_secs(5), || {
        match orchestrator.produce_frame().map(|frame| frame.info) {
            Ok(info) => {
                orchestrator.on_release_frame(info);
                delivered = true;
                true
            }
            Err(Error::ResourceContention { .. }) => false,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }));
    assert!(delivered);
    assert_eq!(orchestrator.state(), StreamState::Streaming);
    assert_eq!(rig.arbiter.owner(), Owner::Usb);
    assert!(rig.arbiter.usb_owns());
    assert_eq!(rig.camera.conflicts(), 0);
    assert_eq!(rig.h264.conflicts(), 0);

    orchestrator.on_stop();
    rig.server.stop();
    assert_eq!(rig.camera.leaked(), 0);
}
