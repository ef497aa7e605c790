//! End-to-end transfers against a real server on the loopback interface.
//!
//! Each test starts its own server on an OS-assigned port with a short retransmit timeout and
//! talks to it through a plain UDP socket, playing the part of a TFTP client by hand.

use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tempdir::TempDir;
use tftp_mux::tftp::{ErrorCode, FileMode, Packet};
use tftp_mux::{Server, ServerConfig};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_millis(200);
const MAX_RETRIES: u32 = 2;

struct TestServer {
    addr: SocketAddr,
    root: TempDir,
    _shutdown: oneshot::Sender<()>,
}

async fn start_server() -> TestServer {
    let root = TempDir::new("tftp-root").unwrap();
    let config = ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        root: root.path().to_path_buf(),
        timeout: TIMEOUT,
        max_retries: MAX_RETRIES,
        poll_interval: Duration::from_millis(10),
        ..ServerConfig::default()
    };

    let server = Server::bind(&config).expect("bind failed");
    let addr = server.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server.run(async move {
        let _ = rx.await;
    }));

    TestServer { addr, root, _shutdown: tx }
}

/// Bind a client socket to an OS-assigned port on loopback.
async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("client bind failed")
}

async fn send(sock: &UdpSocket, packet: Packet, server: SocketAddr) {
    sock.send_to(&packet.to_bytes(), server).await.expect("send failed");
}

async fn recv(sock: &UdpSocket) -> Packet {
    let mut buf = [0_u8; 1024];
    let (len, _) = timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for the server")
        .expect("recv failed");
    Packet::parse_from_buf(&buf[..len]).expect("server sent a malformed packet")
}

/// Downloads `path`, acknowledging every block, and returns the file contents.
async fn download(sock: &UdpSocket, server: SocketAddr, path: &str) -> Vec<u8> {
    send(sock, Packet::ReadReq { path: path.to_string(), mode: FileMode::Octet }, server).await;

    let mut contents = Vec::new();
    let mut expected_block = 1;
    loop {
        match recv(sock).await {
            Packet::Data { block, data } => {
                assert_eq!(block, expected_block);
                contents.extend_from_slice(&data);
                send(sock, Packet::Ack { block }, server).await;
                if data.len() < 512 {
                    return contents;
                }
                expected_block += 1;
            }
            other => panic!("expected data, got {other}"),
        }
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0_u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes
}

#[tokio::test]
async fn test_download() {
    let server = start_server().await;
    let contents = random_bytes(1500);
    std::fs::write(server.root.path().join("kernel"), &contents).unwrap();

    let sock = client().await;
    assert_eq!(download(&sock, server.addr, "kernel").await, contents);
}

#[tokio::test]
async fn test_download_exact_multiple_of_block_size() {
    let server = start_server().await;
    let contents = random_bytes(1024);
    std::fs::write(server.root.path().join("initrd"), &contents).unwrap();

    let sock = client().await;
    assert_eq!(download(&sock, server.addr, "/initrd").await, contents);
}

#[tokio::test]
async fn test_upload() {
    let server = start_server().await;
    let contents = random_bytes(1100);
    let sock = client().await;

    send(&sock, Packet::WriteReq { path: "upload.bin".to_string(), mode: FileMode::Octet }, server.addr).await;
    assert_eq!(recv(&sock).await, Packet::Ack { block: 0 });

    for (i, chunk) in contents.chunks(512).enumerate() {
        let block = i as u16 + 1;
        send(&sock, Packet::Data { block, data: chunk.to_vec() }, server.addr).await;
        assert_eq!(recv(&sock).await, Packet::Ack { block });
    }

    assert_eq!(std::fs::read(server.root.path().join("upload.bin")).unwrap(), contents);
}

#[tokio::test]
async fn test_missing_file() {
    let server = start_server().await;
    let sock = client().await;

    send(&sock, Packet::ReadReq { path: "nope".to_string(), mode: FileMode::Octet }, server.addr).await;
    match recv(&sock).await {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
        other => panic!("expected an error, got {other}"),
    }
}

#[tokio::test]
async fn test_lost_ack_triggers_resend() {
    let server = start_server().await;
    std::fs::write(server.root.path().join("file"), vec![0x42; 700]).unwrap();
    let sock = client().await;

    send(&sock, Packet::ReadReq { path: "file".to_string(), mode: FileMode::Octet }, server.addr).await;
    let first = recv(&sock).await;
    assert_eq!(first, Packet::Data { block: 1, data: vec![0x42; 512] });

    // Pretend our ACK got lost: the server resends the same block after its timeout.
    assert_eq!(recv(&sock).await, first);

    send(&sock, Packet::Ack { block: 1 }, server.addr).await;
    assert_eq!(recv(&sock).await, Packet::Data { block: 2, data: vec![0x42; 188] });
    send(&sock, Packet::Ack { block: 2 }, server.addr).await;
}

#[tokio::test]
async fn test_silent_client_is_dropped() {
    let server = start_server().await;
    std::fs::write(server.root.path().join("file"), vec![0x42; 700]).unwrap();
    let sock = client().await;

    send(&sock, Packet::ReadReq { path: "file".to_string(), mode: FileMode::Octet }, server.addr).await;
    for _ in 0..=MAX_RETRIES {
        assert!(matches!(recv(&sock).await, Packet::Data { block: 1, .. }));
    }

    // No further resends once the retry budget is spent, and the session is gone.
    let mut buf = [0_u8; 1024];
    assert!(timeout(TIMEOUT * 2, sock.recv_from(&mut buf)).await.is_err());

    send(&sock, Packet::Ack { block: 1 }, server.addr).await;
    match recv(&sock).await {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownTransferId),
        other => panic!("expected an error, got {other}"),
    }
}

#[tokio::test]
async fn test_interleaved_clients() {
    let server = start_server().await;
    let first = random_bytes(900);
    let second = random_bytes(600);
    std::fs::write(server.root.path().join("first"), &first).unwrap();
    std::fs::write(server.root.path().join("second"), &second).unwrap();

    let a = client().await;
    let b = client().await;
    send(&a, Packet::ReadReq { path: "first".to_string(), mode: FileMode::Octet }, server.addr).await;
    send(&b, Packet::ReadReq { path: "second".to_string(), mode: FileMode::NetAscii }, server.addr).await;

    assert_eq!(recv(&a).await, Packet::Data { block: 1, data: first[..512].to_vec() });
    assert_eq!(recv(&b).await, Packet::Data { block: 1, data: second[..512].to_vec() });

    send(&b, Packet::Ack { block: 1 }, server.addr).await;
    send(&a, Packet::Ack { block: 1 }, server.addr).await;

    assert_eq!(recv(&b).await, Packet::Data { block: 2, data: second[512..].to_vec() });
    assert_eq!(recv(&a).await, Packet::Data { block: 2, data: first[512..].to_vec() });

    send(&a, Packet::Ack { block: 2 }, server.addr).await;
    send(&b, Packet::Ack { block: 2 }, server.addr).await;
}
