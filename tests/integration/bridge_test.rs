// tests/integration/bridge_test.rs

//! End-to-end tests: a loopback device, the HTTP command endpoint and the
//! recorded telemetry bus.

use super::fixtures::{self, IMEI};
use super::test_helpers::{FakeDevice, TOPIC, TestBridge};
use std::time::Duration;
use trackbridge::core::HubSettings;
use trackbridge::core::metrics::REPLIES_DROPPED_TOTAL;
use trackbridge::core::protocol::{CodecId, Message, MessageType, Packet};

fn response_packet(text: &str) -> Packet {
    Packet {
        codec_id: CodecId::Codec12,
        data: Vec::new(),
        messages: vec![Message {
            kind: MessageType::Response,
            text: text.to_string(),
        }],
    }
}

async fn bridge_with_command_timeout(command_timeout: Duration) -> TestBridge {
    TestBridge::with_settings(
        HubSettings {
            idle_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(2),
            ..HubSettings::default()
        },
        command_timeout,
    )
    .await
}

#[tokio::test]
async fn test_telemetry_is_acknowledged_and_published() {
    let bridge = TestBridge::start().await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;

    device.send_packet(&fixtures::telemetry_packet(1)).await;
    assert_eq!(device.read_record_ack().await, 1);

    let published = bridge.bus.wait_for(1).await;
    let (topic, payload) = &published[0];
    assert_eq!(topic, TOPIC);
    let event: serde_json::Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(event["imei"], IMEI);
    assert_eq!(event["packet"]["codec_id"], "Codec8");
    assert_eq!(event["packet"]["data"].as_array().unwrap().len(), 1);
    assert_eq!(event["packet"]["data"][0]["lat"], 54.6872);
    assert!(event["time"].is_string());

    // One frame publishes one event.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bridge.bus.published().len(), 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_firmware_frames_are_acknowledged_with_record_count() {
    let bridge = TestBridge::start().await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;

    device.send_raw(&fixtures::frame(fixtures::CODEC8_FRAME_HEX)).await;
    assert_eq!(device.read_record_ack().await, 1);
    device.send_raw(&fixtures::frame(fixtures::CODEC8E_FRAME_HEX)).await;
    assert_eq!(device.read_record_ack().await, 1);

    let published = bridge.bus.wait_for(2).await;
    let second: serde_json::Value = serde_json::from_slice(&published[1].1).unwrap();
    assert_eq!(second["packet"]["codec_id"], "Codec8Extended");

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_command_reply_is_returned_to_caller() {
    let bridge = TestBridge::start().await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;

    let (status, body) = tokio::join!(bridge.post_command(IMEI, "STATUS"), async {
        let frame = device.read_frame().await;
        assert!(frame.response.is_none());
        assert_eq!(frame.packet.codec_id, CodecId::Codec12);
        assert_eq!(frame.packet.messages[0].kind, MessageType::Command);
        assert_eq!(frame.packet.messages[0].text, "STATUS");
        device.send_packet(&response_packet("OK")).await;
    })
    .0;

    assert_eq!(status, 200);
    assert_eq!(body, "OK\n");
    assert_eq!(bridge.correlator.pending_count(), 0);
    assert_eq!(bridge.correlator.active_lanes(), 0);
    // Text messages carry no telemetry and are not published.
    assert!(bridge.bus.published().is_empty());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_command_body_is_trimmed() {
    let bridge = TestBridge::start().await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;

    let ((status, body), ()) = tokio::join!(bridge.post_command(IMEI, "  getver\r\n"), async {
        let frame = device.read_frame().await;
        assert_eq!(frame.packet.messages[0].text, "getver");
        device.send_packet(&response_packet("Ver:03.27")).await;
    });

    assert_eq!(status, 200);
    assert_eq!(body, "Ver:03.27\n");
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_first_of_several_messages_answers_command() {
    let bridge = TestBridge::start().await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;
    let dropped_before = REPLIES_DROPPED_TOTAL.get();

    let ((status, body), ()) = tokio::join!(bridge.post_command(IMEI, "getinfo"), async {
        device.read_frame().await;
        let mut packet = response_packet("first");
        packet.messages.push(Message {
            kind: MessageType::Response,
            text: "second".to_string(),
        });
        device.send_packet(&packet).await;
    });

    assert_eq!(status, 200);
    assert_eq!(body, "first\n");
    // Other tests in this binary may also drop replies.
    assert!(REPLIES_DROPPED_TOTAL.get() - dropped_before >= 1.0);
    assert_eq!(bridge.correlator.pending_count(), 0);
    assert_eq!(bridge.correlator.active_lanes(), 0);
    assert!(bridge.bus.published().is_empty());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_command_for_unknown_device_fails_fast() {
    let bridge = TestBridge::start().await;

    let started = std::time::Instant::now();
    let (status, body) = bridge.post_command("000000000000000", "STATUS").await;

    assert_eq!(status, 400);
    assert!(body.contains("not found"), "unexpected body: {body}");
    assert!(body.ends_with('\n'));
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(bridge.correlator.pending_count(), 0);
    assert_eq!(bridge.correlator.active_lanes(), 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_missing_imei_or_command_is_rejected() {
    let bridge = TestBridge::start().await;

    let response = bridge
        .http
        .post(bridge.url("/cmd"))
        .body("STATUS")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let (status, _) = bridge.post_command(IMEI, "   ").await;
    assert_eq!(status, 400);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_while_waiting_returns_503() {
    let bridge = bridge_with_command_timeout(Duration::from_secs(5)).await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;

    let ((status, body), ()) = tokio::join!(bridge.post_command(IMEI, "STATUS"), async {
        device.read_frame().await;
        drop(device);
    });

    assert_eq!(status, 503);
    assert_eq!(body, "tracker disconnected\n");
    bridge.wait_registered(IMEI, false).await;
    assert_eq!(bridge.correlator.pending_count(), 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_silent_device_returns_504_after_timeout() {
    let bridge = bridge_with_command_timeout(Duration::from_millis(300)).await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;

    let started = std::time::Instant::now();
    let ((status, body), frame) =
        tokio::join!(bridge.post_command(IMEI, "STATUS"), device.read_frame());

    assert_eq!(frame.packet.messages[0].text, "STATUS");
    assert_eq!(status, 504);
    assert_eq!(body, "tracker response timeout exceeded\n");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(bridge.correlator.pending_count(), 0);
    // The device is still connected and usable.
    assert!(bridge.hub.registry().get(IMEI).is_some());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_late_reply_after_timeout_is_not_misrouted() {
    let bridge = bridge_with_command_timeout(Duration::from_millis(300)).await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;

    let ((status, _), _) = tokio::join!(bridge.post_command(IMEI, "FIRST"), device.read_frame());
    assert_eq!(status, 504);

    // The answer to FIRST arrives with nobody waiting and is dropped.
    device.send_packet(&response_packet("late")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ((status, body), ()) = tokio::join!(bridge.post_command(IMEI, "SECOND"), async {
        let frame = device.read_frame().await;
        assert_eq!(frame.packet.messages[0].text, "SECOND");
        device.send_packet(&response_packet("fresh")).await;
    });
    assert_eq!(status, 200);
    assert_eq!(body, "fresh\n");

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_commands_to_one_device_are_serialized() {
    let bridge = bridge_with_command_timeout(Duration::from_secs(5)).await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;

    let first = tokio::spawn({
        let http = bridge.http.clone();
        let url = bridge.url(&format!("/cmd?imei={IMEI}"));
        async move {
            let response = http.post(url).body("A").send().await.unwrap();
            (response.status().as_u16(), response.text().await.unwrap())
        }
    });
    let frame = device.read_frame().await;
    assert_eq!(frame.packet.messages[0].text, "A");
    bridge.wait_pending(1).await;

    let second = tokio::spawn({
        let http = bridge.http.clone();
        let url = bridge.url(&format!("/cmd?imei={IMEI}"));
        async move {
            let response = http.post(url).body("B").send().await.unwrap();
            (response.status().as_u16(), response.text().await.unwrap())
        }
    });

    // B must not reach the device while A is still waiting for its reply.
    let mut peeked = [0u8; 1];
    let early = tokio::time::timeout(Duration::from_millis(200), device.stream.peek(&mut peeked)).await;
    assert!(early.is_err(), "second command was written before the first completed");

    device.send_packet(&response_packet("RA")).await;
    assert_eq!(first.await.unwrap(), (200, "RA\n".to_string()));

    let frame = device.read_frame().await;
    assert_eq!(frame.packet.messages[0].text, "B");
    device.send_packet(&response_packet("RB")).await;
    assert_eq!(second.await.unwrap(), (200, "RB\n".to_string()));

    assert_eq!(bridge.correlator.active_lanes(), 0);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_commands_to_different_devices_run_concurrently() {
    let bridge = bridge_with_command_timeout(Duration::from_secs(5)).await;
    let mut first = FakeDevice::connect(bridge.device_addr, "111111111111111").await;
    let mut second = FakeDevice::connect(bridge.device_addr, "222222222222222").await;

    let (a, b, ()) = tokio::join!(
        bridge.post_command("111111111111111", "one"),
        bridge.post_command("222222222222222", "two"),
        async {
            // Both commands are on the wire before either device answers.
            let frame_two = second.read_frame().await;
            let frame_one = first.read_frame().await;
            second
                .send_packet(&response_packet(&format!("{}-ok", frame_two.packet.messages[0].text)))
                .await;
            first
                .send_packet(&response_packet(&format!("{}-ok", frame_one.packet.messages[0].text)))
                .await;
        }
    );

    assert_eq!(a, (200, "one-ok\n".to_string()));
    assert_eq!(b, (200, "two-ok\n".to_string()));
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_telemetry_flows_while_command_is_pending() {
    let bridge = bridge_with_command_timeout(Duration::from_secs(5)).await;
    let mut device = FakeDevice::connect(bridge.device_addr, IMEI).await;

    let ((status, body), ()) = tokio::join!(bridge.post_command(IMEI, "STATUS"), async {
        device.read_frame().await;
        device.send_packet(&fixtures::telemetry_packet(3)).await;
        assert_eq!(device.read_record_ack().await, 3);
        bridge.bus.wait_for(1).await;
        device.send_packet(&response_packet("OK")).await;
    });

    assert_eq!(status, 200);
    assert_eq!(body, "OK\n");
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_list_clients_and_metrics_endpoints() {
    let bridge = TestBridge::start().await;
    let device = FakeDevice::connect(bridge.device_addr, IMEI).await;
    let local = device.stream.local_addr().unwrap();

    let listing = bridge.list_clients().await;
    assert_eq!(listing, format!("{local} - {IMEI}\n"));

    let metrics = bridge
        .http
        .get(bridge.url("/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status().as_u16(), 200);
    assert!(
        metrics
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    let text = metrics.text().await.unwrap();
    assert!(text.contains("trackbridge_connected_devices"));

    drop(device);
    bridge.wait_registered(IMEI, false).await;
    assert_eq!(bridge.list_clients().await, "");

    bridge.shutdown().await;
}
