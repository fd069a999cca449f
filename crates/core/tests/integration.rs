//! Integration test: RTSP handshake and RTP delivery over loopback.
//!
//! Starts the server on an ephemeral port backed by synthetic devices,
//! drives it with a plain TCP client and receives RTP on a UDP socket.

mod common;

use std::io::{Read, Write};
use std::time::Duration;

use common::{connect, header, rtsp_request, start_server, status, udp_receiver, wait_until};
use dualcam::arbiter::Owner;

const URI: &str = "rtsp://127.0.0.1/stream";

#[test]
fn full_handshake_and_rtp_delivery() {
    let rig = start_server(64, 48, Duration::from_millis(5));
    let mut stream = connect(rig.server.local_addr().unwrap());
    let receiver = udp_receiver();
    let client_port = receiver.local_addr().unwrap().port();

    // OPTIONS
    let resp = rtsp_request(&mut stream, &format!("OPTIONS {URI} RTSP/1.0\r\nCSeq: 1\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), 200);
    assert_eq!(header(&resp, "CSeq"), Some("1"));
    assert!(header(&resp, "Public").unwrap().contains("TEARDOWN"));

    // DESCRIBE
    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {URI} RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), 200);
    assert_eq!(header(&resp, "Content-Type"), Some("application/sdp"));
    assert!(resp.contains("m=video 0 RTP/AVP 96\r\n"));
    assert!(resp.contains("a=rtpmap:96 H264/90000\r\n"));
    assert!(resp.contains("a=fmtp:96 packetization-mode=1"));

    // PLAY before SETUP
    let resp = rtsp_request(&mut stream, &format!("PLAY {URI} RTSP/1.0\r\nCSeq: 3\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), 455);
    assert_eq!(header(&resp, "CSeq"), Some("3"));

    // SETUP without a usable client_port, then over TCP
    let resp = rtsp_request(
        &mut stream,
        &format!("SETUP {URI}/track1 RTSP/1.0\r\nCSeq: 4\r\nTransport: RTP/AVP;unicast\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), 461);
    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {URI}/track1 RTSP/1.0\r\nCSeq: 5\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
        ),
    )
    .unwrap();
    assert_eq!(status(&resp), 461);
    assert_eq!(header(&resp, "CSeq"), Some("5"));

    // SETUP
    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {URI}/track1 RTSP/1.0\r\nCSeq: 6\r\nTransport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            client_port,
            client_port + 1
        ),
    )
    .unwrap();
    assert_eq!(status(&resp), 200);
    let session = header(&resp, "Session").unwrap().to_string();
    let session_id = session.split(';').next().unwrap();
    assert_eq!(session_id.len(), 8);
    assert!(header(&resp, "Transport").unwrap().contains("server_port="));

    // unknown method leaves the session alone
    let resp = rtsp_request(
        &mut stream,
        &format!("PAUSE {URI} RTSP/1.0\r\nCSeq: 7\r\nSession: {session_id}\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), 405);

    // PLAY
    let resp = rtsp_request(
        &mut stream,
        &format!("PLAY {URI} RTSP/1.0\r\nCSeq: 8\r\nSession: {session_id}\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), 200);
    assert_eq!(header(&resp, "CSeq"), Some("8"));
    assert!(header(&resp, "RTP-Info").is_some());

    // self-capture feeds the client while USB is idle
    let mut packet = [0u8; 2048];
    let n = receiver.recv(&mut packet).expect("RTP packet");
    assert!(n > 12);
    assert_eq!(packet[0], 0x80);
    assert_eq!(packet[1] & 0x7f, 96);
    assert_eq!(rig.arbiter.owner(), Owner::SelfCapture);

    let mut last_seq = u16::from_be_bytes([packet[2], packet[3]]);
    for _ in 0..20 {
        let n = receiver.recv(&mut packet).expect("RTP packet");
        assert!(n > 12);
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        assert_eq!(seq, last_seq.wrapping_add(1));
        last_seq = seq;
    }

    // SETUP while playing
    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {URI}/track1 RTSP/1.0\r\nCSeq: 9\r\nTransport: RTP/AVP;unicast;client_port={client_port}\r\n\r\n"
        ),
    )
    .unwrap();
    assert_eq!(status(&resp), 455);

    // TEARDOWN keeps the connection usable
    let resp = rtsp_request(
        &mut stream,
        &format!("TEARDOWN {URI} RTSP/1.0\r\nCSeq: 10\r\nSession: {session_id}\r\n\r\n"),
    )
    .unwrap();
    assert_eq!(status(&resp), 200);
    assert!(wait_until(Duration::from_secs(2), || {
        rig.arbiter.owner() == Owner::Available
    }));
    assert_eq!(rig.camera.leaked(), 0);
    assert_eq!(rig.h264.leaked(), 0);

    let resp = rtsp_request(&mut stream, &format!("OPTIONS {URI} RTSP/1.0\r\nCSeq: 11\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), 200);
    assert_eq!(header(&resp, "CSeq"), Some("11"));
}

#[test]
fn malformed_and_missing_cseq() {
    let rig = start_server(32, 32, Duration::from_millis(5));
    let mut stream = connect(rig.server.local_addr().unwrap());

    let resp = rtsp_request(&mut stream, "GARBAGE\r\nCSeq: 12\r\n\r\n").unwrap();
    assert_eq!(status(&resp), 400);
    assert_eq!(header(&resp, "CSeq"), Some("12"));

    let resp = rtsp_request(&mut stream, &format!("OPTIONS {URI} RTSP/1.0\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), 200);
    assert_eq!(header(&resp, "CSeq"), Some("0"));

    let resp = rtsp_request(&mut stream, &format!("OPTIONS {URI} RTSP/1.0\r\ncseq: 31\r\n\r\n")).unwrap();
    assert_eq!(header(&resp, "CSeq"), Some("31"));
}

#[test]
fn non_utf8_request_gets_bad_request() {
    let rig = start_server(32, 32, Duration::from_millis(5));
    let mut stream = connect(rig.server.local_addr().unwrap());

    stream
        .write_all(b"\xff\xfeJUNK rtsp://x RTSP/1.0\r\nCSeq: 5\r\n\r\n")
        .unwrap();
    let resp = rtsp_request(&mut stream, "").unwrap();
    assert_eq!(status(&resp), 400);
    assert_eq!(header(&resp, "CSeq"), Some("5"));

    let resp = rtsp_request(&mut stream, &format!("OPTIONS {URI} RTSP/1.0\r\nCSeq: 6\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), 200);
    assert_eq!(header(&resp, "CSeq"), Some("6"));
}

#[test]
fn second_client_is_turned_away() {
    let rig = start_server(32, 32, Duration::from_millis(5));
    let addr = rig.server.local_addr().unwrap();
    let mut first = connect(addr);
    let resp = rtsp_request(&mut first, &format!("OPTIONS {URI} RTSP/1.0\r\nCSeq: 1\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), 200);

    let mut second = connect(addr);
    let mut buf = [0u8; 16];
    assert_eq!(second.read(&mut buf).unwrap_or(0), 0, "second client must be closed");

    // the first client is unaffected
    let resp = rtsp_request(&mut first, &format!("OPTIONS {URI} RTSP/1.0\r\nCSeq: 2\r\n\r\n")).unwrap();
    assert_eq!(status(&resp), 200);

    // once it leaves, a new client is served
    drop(first);
    assert!(wait_until(Duration::from_secs(3), || {
        let mut next = connect(addr);
        rtsp_request(&mut next, &format!("OPTIONS {URI} RTSP/1.0\r\nCSeq: 3\r\n\r\n"))
            .map(|resp| status(&resp) == 200)
            .unwrap_or(false)
    }));
}

#[test]
fn stop_releases_hardware() {
    let mut rig = start_server(32, 32, Duration::from_millis(5));
    let receiver = udp_receiver();
    let mut stream = connect(rig.server.local_addr().unwrap());
    let port = receiver.local_addr().unwrap().port();
    rtsp_request(
        &mut stream,
        &format!("SETUP {URI} RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port={port}-{}\r\n\r\n", port + 1),
    )
    .unwrap();
    rtsp_request(&mut stream, &format!("PLAY {URI} RTSP/1.0\r\nCSeq: 2\r\n\r\n")).unwrap();
    receiver.recv(&mut [0u8; 2048]).expect("RTP packet");

    rig.server.stop();
    assert!(!rig.server.is_running());
    assert_eq!(rig.arbiter.owner(), Owner::Available);
    assert!(!rig.camera.is_streaming());
    assert!(!rig.h264.is_running());
    assert!(rig.server.local_addr().is_err());
}
