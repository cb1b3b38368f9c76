//! Manager Scenarios Over Real Loopback Sockets
//!
//! A fake device answers discovery on UDP and accepts the TCP logging
//! stream, letting the full manager lifecycle run against real connections
//! (no mocks): discovery, connect, two-piece frame delivery, heartbeat
//! timeout and reconnect, shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use targetlink_network::codec::{
    encode, try_decode, Channel, Decoded, Message, MessageKind, ServerAnnounce,
};
use targetlink_network::{NetworkConfig, NetworkManager, TargetState, TtyEvent};

struct Device {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    /// Control datagrams the device received, in order
    control_rx: mpsc::UnboundedReceiver<Message>,
    /// Accepted logging-stream connections, kept alive until taken
    stream_rx: mpsc::UnboundedReceiver<TcpStream>,
    accepts: Arc<AtomicUsize>,
}

/// Stand up a fake device: UDP responder for discovery/control, TCP
/// listener for the logging stream. `announced_port` overrides the port
/// embedded in the discovery reply (None announces the real listener port).
async fn spawn_device(computer_name: &str, announced_port: Option<u16>) -> Device {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_addr = udp.local_addr().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = listener.local_addr().unwrap();

    let announce = ServerAnnounce {
        computer_name: computer_name.to_owned(),
        game_name: "Demo".to_owned(),
        game_type: 0,
        platform_type: 0,
        listen_port: announced_port.unwrap_or(tcp_addr.port()),
    };

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let Ok((n, sender)) = udp.recv_from(&mut buf).await else {
                break;
            };
            if let Decoded::Complete { message, .. } = try_decode(&buf[..n]) {
                let kind = message.kind;
                let _ = control_tx.send(message);
                if kind == MessageKind::ServerAnnounce {
                    let reply = Message::blob(MessageKind::ServerResponse, announce.encode());
                    let _ = udp.send_to(&encode(&reply), sender).await;
                }
            }
        }
    });

    let accepts = Arc::new(AtomicUsize::new(0));
    let accept_count = accepts.clone();
    let (stream_tx, stream_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accept_count.fetch_add(1, Ordering::SeqCst);
            if stream_tx.send(stream).is_err() {
                break;
            }
        }
    });

    Device {
        udp_addr,
        tcp_addr,
        control_rx,
        stream_rx,
        accepts,
    }
}

fn config_for(device: &Device) -> NetworkConfig {
    NetworkConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        broadcast_address: Some(device.udp_addr),
        discovery_window: Duration::from_millis(300),
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn capture_tty(manager: &NetworkManager) -> mpsc::UnboundedReceiver<TtyEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.register_text_callback(move |event| {
        let _ = tx.send(event);
    });
    rx
}

async fn recv_within(
    rx: &mut mpsc::UnboundedReceiver<TtyEvent>,
    window: Duration,
) -> Option<TtyEvent> {
    tokio::time::timeout(window, rx.recv()).await.ok().flatten()
}

/// Wait for a control datagram of the given kind, skipping others (the
/// discovery request itself also lands on the device's control socket)
async fn expect_control(rx: &mut mpsc::UnboundedReceiver<Message>, kind: MessageKind) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("control datagram in time")
            .expect("device control channel open");
        if message.kind == kind {
            return message;
        }
    }
}

/// The listener task accepts asynchronously; poll until it caught up
async fn wait_for_accepts(accepts: &AtomicUsize, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while accepts.load(Ordering::SeqCst) < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "never saw {expected} accepted connections"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(accepts.load(Ordering::SeqCst), expected);
}

#[test_log::test(tokio::test)]
async fn discovery_registers_announced_target() {
    let device = spawn_device("DEV1", Some(9000)).await;
    let manager = NetworkManager::initialize(config_for(&device)).await.unwrap();

    let found = manager.discover_targets().await.unwrap();
    assert_eq!(found.len(), 1);

    let handle = found[0];
    let name = manager.target_display_name(handle).await.unwrap();
    assert!(name.contains("DEV1"), "display name was {name:?}");
    assert_eq!(manager.target_listen_port(handle).await, Some(9000));
    assert_eq!(
        manager.target_state(handle).await,
        Some(TargetState::Unconnected)
    );

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn discovery_rediscovery_reuses_the_handle() {
    let device = spawn_device("DEV1", Some(9000)).await;
    let manager = NetworkManager::initialize(config_for(&device)).await.unwrap();

    let first = manager.discover_targets().await.unwrap();
    let second = manager.discover_targets().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(manager.list_target_handles().len(), 1);

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn malformed_discovery_reply_leaves_no_target_behind() {
    // Empty computer name disqualifies the reply
    let device = spawn_device("", Some(9000)).await;
    let manager = NetworkManager::initialize(config_for(&device)).await.unwrap();

    let found = manager.discover_targets().await.unwrap();
    assert!(found.is_empty());
    assert!(manager.list_target_handles().is_empty());

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn transmission_in_two_pieces_fires_one_callback() {
    let mut device = spawn_device("DEV1", None).await;
    let manager = NetworkManager::initialize(config_for(&device)).await.unwrap();
    let mut tty = capture_tty(&manager);

    let handle = manager.discover_targets().await.unwrap()[0];
    assert!(manager.connect_to_target(handle).await);
    assert_eq!(manager.target_state(handle).await, Some(TargetState::Running));

    // The device saw the connect handshake on its control socket
    expect_control(&mut device.control_rx, MessageKind::Connect).await;

    // Write one frame split at byte 5, with a pause between the halves
    let mut stream = tokio::time::timeout(Duration::from_secs(1), device.stream_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let frame = encode(&Message::transmission(Channel::Remote, "hello"));
    stream.write_all(&frame[..5]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(&frame[5..]).await.unwrap();
    stream.flush().await.unwrap();

    let event = recv_within(&mut tty, Duration::from_secs(1)).await.unwrap();
    assert_eq!(event.handle, handle);
    assert_eq!(event.channel, "REMOTE");
    assert_eq!(event.text, "hello");

    // Exactly one callback for the one frame
    assert!(recv_within(&mut tty, Duration::from_millis(200)).await.is_none());

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn send_command_reaches_the_device() {
    let mut device = spawn_device("DEV1", None).await;
    let manager = NetworkManager::initialize(config_for(&device)).await.unwrap();

    let handle = manager.discover_targets().await.unwrap()[0];
    assert!(manager.connect_to_target(handle).await);

    manager.send_command(handle, "stat fps").await.unwrap();

    let command = expect_control(&mut device.control_rx, MessageKind::Transmission).await;
    assert_eq!(command, Message::transmission(Channel::Remote, "stat fps"));

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn silence_schedules_and_performs_exactly_one_reconnect() {
    let device = spawn_device("DEV1", None).await;
    let mut config = config_for(&device);
    config.ping_interval = Duration::from_millis(50);
    config.ping_timeout = Duration::from_millis(200);
    config.reconnect_delay = Duration::from_millis(150);
    let manager = NetworkManager::initialize(config).await.unwrap();
    let mut tty = capture_tty(&manager);

    let handle = manager.discover_targets().await.unwrap()[0];
    assert!(manager.connect_to_target(handle).await);
    wait_for_accepts(&device.accepts, 1).await;

    // The device never sends a ping reply; let the timeout expire
    tokio::time::sleep(Duration::from_millis(350)).await;
    manager.tick().await;
    assert_eq!(
        manager.target_state(handle).await,
        Some(TargetState::Unconnected)
    );
    let diag = recv_within(&mut tty, Duration::from_secs(1)).await.unwrap();
    assert_eq!(diag.channel, "DEBUG");
    assert!(diag.text.contains("Lost connection"), "got {:?}", diag.text);

    // Before the reconnect deadline: no attempt
    manager.tick().await;
    assert_eq!(device.accepts.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.target_state(handle).await,
        Some(TargetState::Unconnected)
    );

    // After the deadline: exactly one attempt, which succeeds
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.tick().await;
    wait_for_accepts(&device.accepts, 2).await;
    assert_eq!(manager.target_state(handle).await, Some(TargetState::Running));

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn peer_close_removes_the_target() {
    let mut device = spawn_device("DEV1", None).await;
    let manager = NetworkManager::initialize(config_for(&device)).await.unwrap();

    let handle = manager.discover_targets().await.unwrap()[0];
    assert!(manager.connect_to_target(handle).await);

    // Device drops the logging stream; the reader task removes the target
    let stream = tokio::time::timeout(Duration::from_secs(1), device.stream_rx.recv())
        .await
        .unwrap()
        .unwrap();
    drop(stream);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !manager.list_target_handles().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "target never removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn disconnect_sends_repeated_handshake_and_removes() {
    let mut device = spawn_device("DEV1", None).await;
    let manager = NetworkManager::initialize(config_for(&device)).await.unwrap();

    let handle = manager.discover_targets().await.unwrap()[0];
    assert!(manager.connect_to_target(handle).await);

    manager.disconnect_target(handle).await;
    assert!(manager.list_target_handles().is_empty());

    let mut disconnects = 0;
    while let Ok(Some(message)) =
        tokio::time::timeout(Duration::from_millis(500), device.control_rx.recv()).await
    {
        if message.kind == MessageKind::Disconnect {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 3);

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn shutdown_clears_the_registry() {
    let device = spawn_device("DEV1", None).await;
    let manager = NetworkManager::initialize(config_for(&device)).await.unwrap();

    let handle = manager.discover_targets().await.unwrap()[0];
    assert!(manager.connect_to_target(handle).await);
    assert_eq!(manager.list_target_handles().len(), 1);

    manager.shutdown().await;
    assert!(manager.list_target_handles().is_empty());
}

#[test_log::test(tokio::test)]
async fn local_target_is_synthesized_without_traffic() {
    let device = spawn_device("DEV1", None).await;
    let manager = NetworkManager::initialize(config_for(&device)).await.unwrap();

    let handle = manager.add_local_target(device.tcp_addr.port()).await;
    let name = manager.target_display_name(handle).await.unwrap();
    assert!(name.contains("localhost"));
    assert_eq!(
        manager.target_listen_port(handle).await,
        Some(device.tcp_addr.port())
    );

    manager.shutdown().await;
}
