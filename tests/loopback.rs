//! End-to-end sender/receiver exercises over loopback UDP.

use austream::audio::{CollectingSink, ScriptedCapture};
use austream::receiver::{probe, ReceiverConfig, ReceiverSession};
use austream::sender::{SenderConfig, SenderSession};
use austream::FRAME_BYTES;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

const PIN: &str = "123456";

fn loud_frame() -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_BYTES);
    for _ in 0..FRAME_BYTES / 2 {
        frame.extend_from_slice(&5000i16.to_le_bytes());
    }
    frame
}

async fn start_sender(frames: Vec<Vec<u8>>) -> SenderSession {
    let config = SenderConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        pin: Some(PIN.to_string()),
        ..SenderConfig::default()
    };
    // Give receivers time to authenticate before the burst starts, and pace
    // frames at the real capture cadence.
    let capture = ScriptedCapture::with_idle_tail(frames)
        .start_delay(Duration::from_millis(400))
        .frame_interval(Duration::from_millis(10));
    SenderSession::start(config, Box::new(capture))
        .await
        .expect("sender failed to start")
}

fn receiver_config(session: &SenderSession, pin: &str) -> ReceiverConfig {
    ReceiverConfig {
        server: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), session.local_addr().port()),
        pin: pin.to_string(),
    }
}

#[tokio::test]
async fn one_receiver_plays_a_burst_without_loss() {
    let sender = start_sender(vec![loud_frame(); 20]).await;

    let sink = CollectingSink::new();
    let receiver = ReceiverSession::connect(receiver_config(&sender, PIN), sink.clone())
        .await
        .expect("handshake failed");
    assert_eq!(sender.client_count(), 1);

    // 400 ms lead-in + 200 ms of frames + 50 ms pre-roll, with margin, but
    // short enough that no keep-alive frame sneaks into the stats.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let stats = receiver.stats();
    assert_eq!(stats.packets_received, 20);
    assert_eq!(stats.packets_lost, 0);
    assert_eq!(stats.decryption_errors, 0);

    assert_eq!(sink.writes(), 20);
    let samples = sink.samples();
    assert_eq!(samples.len(), 20 * FRAME_BYTES / 2);
    assert!(samples.iter().all(|&s| s == 5000));

    receiver.stop().await;
    sender.stop().await;
}

#[tokio::test]
async fn wrong_pin_never_yields_audio() {
    let sender = start_sender(vec![loud_frame(); 5]).await;

    let sink = CollectingSink::new();
    let result = ReceiverSession::connect(receiver_config(&sender, "000000"), sink.clone()).await;

    assert_eq!(result.err().unwrap().to_string(), "Invalid PIN");
    assert_eq!(sender.client_count(), 0);
    assert!(sink.samples().is_empty());

    sender.stop().await;
}

#[tokio::test]
async fn two_receivers_both_get_the_full_stream() {
    let sender = start_sender(vec![loud_frame(); 20]).await;

    let sink_a = CollectingSink::new();
    let sink_b = CollectingSink::new();
    let receiver_a = ReceiverSession::connect(receiver_config(&sender, PIN), sink_a.clone())
        .await
        .expect("first handshake failed");
    let receiver_b = ReceiverSession::connect(receiver_config(&sender, PIN), sink_b.clone())
        .await
        .expect("second handshake failed");
    assert_eq!(sender.client_count(), 2);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(receiver_a.stats().packets_received, 20);
    assert_eq!(receiver_b.stats().packets_received, 20);
    assert_eq!(sink_a.writes(), 20);
    assert_eq!(sink_b.writes(), 20);

    receiver_a.stop().await;
    receiver_b.stop().await;
    sender.stop().await;
}

#[tokio::test]
async fn silent_sender_emits_keepalive_frames() {
    let sender = start_sender(vec![]).await;

    let sink = CollectingSink::new();
    let receiver = ReceiverSession::connect(receiver_config(&sender, PIN), sink.clone())
        .await
        .expect("handshake failed");

    // Nothing passes the gate, so after two idle seconds the sender must
    // synthesize a silence frame to keep the session visibly alive.
    tokio::time::sleep(Duration::from_millis(3200)).await;

    let stats = receiver.stats();
    assert!(
        stats.packets_received >= 1,
        "no keep-alive arrived: {:?}",
        stats
    );
    assert_eq!(stats.decryption_errors, 0);

    receiver.stop().await;
    sender.stop().await;
}

#[tokio::test]
async fn probe_reports_the_sender_host() {
    let sender = start_sender(vec![]).await;

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), sender.local_addr().port());
    let host = probe(addr).await.expect("probe failed");
    assert!(!host.is_empty());

    sender.stop().await;
}

#[tokio::test]
async fn clock_sync_converges_over_loopback() {
    let sender = start_sender(vec![]).await;

    let sink = CollectingSink::new();
    let receiver = ReceiverSession::connect(receiver_config(&sender, PIN), sink)
        .await
        .expect("handshake failed");

    // First sync fires immediately on the 2 s cadence.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let clock = receiver.clock();
    // Loopback RTT is far below a millisecond but never negative by more
    // than scheduling noise.
    assert!(clock.rtt_ns >= 0, "rtt {}", clock.rtt_ns);
    assert!(clock.rtt_ns < 100_000_000, "rtt {}", clock.rtt_ns);
    assert!(clock.offset_ns.abs() < 100_000_000, "offset {}", clock.offset_ns);

    receiver.stop().await;
    sender.stop().await;
}
