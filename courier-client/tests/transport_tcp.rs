//! TCP transport over real loopback sockets, in both framing variants.

use std::time::Duration;

use courier_client::{
    encode_abridged, PacketAssembler, SessionType, TcpTransport, TransportEvent, TransportState,
};
use courier_crypto::obfuscation;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("transport event within 5 seconds")
        .expect("event channel open")
}

#[tokio::test]
async fn abridged_session_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (handle, mut events) = TcpTransport::spawn(SessionType::Abridged);
    handle.connect("127.0.0.1", port);

    let (mut server, _) = listener.accept().await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Connecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Connected)
    );

    // The abridged announcement comes first.
    let mut init = [0u8; 1];
    server.read_exact(&mut init).await.unwrap();
    assert_eq!(init[0], 0xef);

    // Client -> server framing.
    let payload = vec![0x10u8, 0x20, 0x30, 0x40];
    handle.send_packet(payload.clone());
    let mut frame = [0u8; 5];
    server.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame[0], 0x01);
    assert_eq!(&frame[1..], payload.as_slice());

    // Server -> client framing, delivered in two pieces.
    let response = vec![0xAAu8; 8];
    let wire = encode_abridged(&response);
    server.write_all(&wire[..3]).await.unwrap();
    server.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.write_all(&wire[3..]).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::PacketReceived(response)
    );

    // Remote close surfaces as a state change.
    drop(server);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Unconnected)
    );
}

#[tokio::test]
async fn obfuscated_session_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (handle, mut events) = TcpTransport::spawn(SessionType::Obfuscated);
    handle.connect("127.0.0.1", port);
    let (mut server, _) = listener.accept().await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Connecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Connected)
    );

    // The 64-byte handshake header: key material is carried in clear at
    // bytes 8..56, the protocol tag arrives encrypted.
    let mut header = [0u8; 64];
    server.read_exact(&mut header).await.unwrap();

    let mut server_read =
        obfuscation::context_from_source(obfuscation::extract_source(&header), "server read");
    let mut server_write = obfuscation::context_from_source(
        obfuscation::extract_reversed_source(&header),
        "server write",
    );

    // Skip keystream up to the encrypted tail, then decode the tag.
    let _ = server_read.crypt(&[0u8; 56]);
    let tail = server_read.crypt(&header[56..]);
    assert_eq!(&tail[..4], &obfuscation::PROTO_TAG_ABRIDGED);

    // Client -> server through the cipher.
    let payload = vec![0x42u8; 16];
    handle.send_packet(payload.clone());
    let mut wire = vec![0u8; 17];
    server.read_exact(&mut wire).await.unwrap();
    let mut assembler = PacketAssembler::new();
    let packets = assembler.feed(&server_read.crypt(&wire)).unwrap();
    assert_eq!(packets, vec![payload]);

    // Server -> client through the cipher.
    let response = vec![0x24u8; 20];
    let encrypted = server_write.crypt(&encode_abridged(&response));
    server.write_all(&encrypted).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::PacketReceived(response)
    );
}

#[tokio::test]
async fn refused_connection_surfaces_an_error() {
    // Bind then drop to obtain a port that refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (handle, mut events) = TcpTransport::spawn(SessionType::Abridged);
    handle.connect("127.0.0.1", port);

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Connecting)
    );
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Error(_)
    ));
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Unconnected)
    );
}

#[tokio::test]
async fn malformed_length_byte_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (handle, mut events) = TcpTransport::spawn(SessionType::Abridged);
    handle.connect("127.0.0.1", port);
    let (mut server, _) = listener.accept().await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Connecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Connected)
    );
    let mut init = [0u8; 1];
    server.read_exact(&mut init).await.unwrap();

    server.write_all(&[0x80, 0, 0, 0]).await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Error(error) if error.kind == courier_client::TransportErrorKind::InvalidFrame
    ));
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Disconnecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Unconnected)
    );
}

#[tokio::test]
async fn hostname_connect_passes_host_lookup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (handle, mut events) = TcpTransport::spawn(SessionType::Abridged);
    handle.connect("localhost", port);

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::HostLookup)
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Connecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::StateChanged(TransportState::Connected)
    );
}
