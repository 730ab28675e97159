use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use landrop_network::hash;
use landrop_network::message::{
    MessageKind, TransferRequestPayload, TransferResponsePayload,
};
use landrop_network::wire;
use landrop_network::{
    Envelope, LocalIdentity, PeerEndpoint, PeerId, TransferConfig, TransferEngine, TransferEvent,
    TransferStatus,
};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn engine(name: &str, download_dir: &Path) -> TransferEngine {
    let identity = LocalIdentity::new(PeerId::from_string(name), name, LOOPBACK);
    let config = TransferConfig {
        bind_addr: LOOPBACK,
        port: 0,
        connect_timeout: Duration::from_secs(3),
        download_dir: download_dir.to_path_buf(),
        ..TransferConfig::default()
    };
    TransferEngine::new(identity, config)
}

fn endpoint(port: u16) -> PeerEndpoint {
    PeerEndpoint::from_addr(SocketAddr::new(LOOPBACK, port))
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Accept every incoming request into the engine's download directory.
fn auto_accept(receiver: &Arc<TransferEngine>) -> tokio::task::JoinHandle<()> {
    let mut events = receiver.subscribe();
    let receiver = Arc::clone(receiver);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransferEvent::IncomingRequest(request)) => {
                    receiver.accept_incoming(&request.transfer_id, None).unwrap();
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::test]
async fn ten_mib_transfer_completes_with_matching_hash() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let content = pattern(10 * 1024 * 1024, 7);
    let path = send_dir.path().join("payload.bin");
    std::fs::write(&path, &content).unwrap();

    let receiver = Arc::new(engine("receiver", recv_dir.path()));
    let port = receiver.start().await.unwrap();
    let mut receiver_events = receiver.subscribe();
    let acceptor = auto_accept(&receiver);

    let sender = engine("sender", send_dir.path());
    let mut sender_events = sender.subscribe();
    let record = sender.send_file(&path, endpoint(port)).await.unwrap();

    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(record.bytes_transferred, content.len() as u64);
    assert_eq!(record.file_hash, hash::sha256_bytes(&content));

    // Sender status sequence: Pending, then InProgress, then Completed.
    let mut statuses = Vec::new();
    while let Ok(event) = sender_events.try_recv() {
        match event {
            TransferEvent::Started(r) | TransferEvent::ProgressUpdated(r) => {
                if statuses.last() != Some(&r.status) {
                    statuses.push(r.status);
                }
            }
            TransferEvent::Completed(r) => statuses.push(r.status),
            _ => {}
        }
    }
    assert_eq!(
        statuses,
        vec![
            TransferStatus::Pending,
            TransferStatus::InProgress,
            TransferStatus::Completed
        ]
    );

    let saved = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match receiver_events.recv().await {
                Ok(TransferEvent::IncomingFileCompleted { record, path }) => {
                    return (record, path);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(saved.1, recv_dir.path().join("payload.bin"));
    assert_eq!(saved.0.status, TransferStatus::Completed);
    assert_eq!(hash::sha256_file(&saved.1).unwrap(), record.file_hash);
    assert!(sender.active_transfers().is_empty());

    acceptor.abort();
    receiver.stop();
}

#[tokio::test]
async fn rejection_fails_sender_and_creates_no_file() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let path = send_dir.path().join("secret.txt");
    std::fs::write(&path, b"not wanted").unwrap();

    let receiver = Arc::new(engine("receiver", recv_dir.path()));
    let port = receiver.start().await.unwrap();
    let mut events = receiver.subscribe();
    let rejecter = {
        let receiver = Arc::clone(&receiver);
        tokio::spawn(async move {
            loop {
                if let Ok(TransferEvent::IncomingRequest(request)) = events.recv().await {
                    receiver
                        .reject_incoming(&request.transfer_id, "User declined")
                        .unwrap();
                    break;
                }
            }
        })
    };

    let sender = engine("sender", send_dir.path());
    let record = sender.send_file(&path, endpoint(port)).await.unwrap();
    rejecter.await.unwrap();

    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("User declined"));
    assert_eq!(record.bytes_transferred, 0);
    assert_eq!(std::fs::read_dir(recv_dir.path()).unwrap().count(), 0);
    assert!(receiver.active_transfers().is_empty());
}

#[tokio::test]
async fn concurrent_inbound_transfers_stay_isolated() {
    const K: usize = 4;
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    let receiver = Arc::new(engine("receiver", recv_dir.path()));
    let port = receiver.start().await.unwrap();
    let acceptor = auto_accept(&receiver);

    let mut files = Vec::new();
    for i in 0..K {
        let content = pattern(256 * 1024 + i * 1000, i as u8);
        let path = send_dir.path().join(format!("file-{i}.bin"));
        std::fs::write(&path, &content).unwrap();
        files.push((path, content));
    }

    let sender = Arc::new(engine("sender", send_dir.path()));
    let handles: Vec<_> = files
        .iter()
        .map(|(path, _)| {
            let sender = Arc::clone(&sender);
            let path = path.clone();
            tokio::spawn(async move { sender.send_file(&path, endpoint(port)).await.unwrap() })
        })
        .collect();

    for handle in handles {
        let record = handle.await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed, "{record:?}");
    }

    for (i, (_, content)) in files.iter().enumerate() {
        let received = std::fs::read(recv_dir.path().join(format!("file-{i}.bin"))).unwrap();
        assert_eq!(&received, content);
    }

    acceptor.abort();
    receiver.stop();
}

#[tokio::test]
async fn same_name_twice_does_not_overwrite() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let path = send_dir.path().join("report.pdf");

    let receiver = Arc::new(engine("receiver", recv_dir.path()));
    let port = receiver.start().await.unwrap();
    let acceptor = auto_accept(&receiver);
    let sender = engine("sender", send_dir.path());

    std::fs::write(&path, b"first").unwrap();
    sender.send_file(&path, endpoint(port)).await.unwrap();
    std::fs::write(&path, b"second").unwrap();
    sender.send_file(&path, endpoint(port)).await.unwrap();

    assert_eq!(std::fs::read(recv_dir.path().join("report.pdf")).unwrap(), b"first");
    assert_eq!(
        std::fs::read(recv_dir.path().join("report (1).pdf")).unwrap(),
        b"second"
    );

    acceptor.abort();
    receiver.stop();
}

#[tokio::test]
async fn cancelled_send_ends_cancelled() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let path = send_dir.path().join("large.bin");
    std::fs::write(&path, pattern(32 * 1024 * 1024, 3)).unwrap();

    let receiver = Arc::new(engine("receiver", recv_dir.path()));
    let port = receiver.start().await.unwrap();
    let acceptor = auto_accept(&receiver);

    let sender = Arc::new(engine("sender", send_dir.path()));
    let mut events = sender.subscribe();
    let canceller = {
        let sender = Arc::clone(&sender);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransferEvent::ProgressUpdated(r)) if r.bytes_transferred > 0 => {
                        assert!(sender.cancel_transfer(&r.id));
                        break;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event channel closed: {e}"),
                }
            }
        })
    };

    let record = sender.send_file(&path, endpoint(port)).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(record.status, TransferStatus::Cancelled);
    assert!(record.bytes_transferred < record.file_size);
    assert!(!sender.cancel_transfer(&record.id));

    // The receiver sees the stream end early and discards the partial file.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(receiver.active_transfers().is_empty());
    assert!(!recv_dir.path().join("large.bin").exists());

    acceptor.abort();
    receiver.stop();
}

#[tokio::test]
async fn corrupted_content_is_detected_and_removed() {
    let recv_dir = tempfile::tempdir().unwrap();
    let receiver = Arc::new(engine("receiver", recv_dir.path()));
    let port = receiver.start().await.unwrap();
    let acceptor = auto_accept(&receiver);

    let body = b"the real bytes";
    let sender_identity = LocalIdentity::new(PeerId::from_string("liar"), "liar", LOOPBACK);
    let mut stream = TcpStream::connect((LOOPBACK, port)).await.unwrap();
    let request = Envelope::with_payload(
        &sender_identity,
        0,
        MessageKind::TransferRequest,
        &TransferRequestPayload {
            transfer_id: "bad-hash".into(),
            file_name: "tampered.txt".into(),
            file_size: body.len() as u64,
            file_hash: hash::sha256_bytes(b"other bytes"),
        },
    );
    wire::write_frame(&mut stream, &request).await.unwrap();

    let response = wire::read_frame(&mut stream).await.unwrap().unwrap();
    let payload: TransferResponsePayload =
        response.payload_as(MessageKind::TransferResponse).unwrap();
    assert!(payload.accepted);

    use tokio::io::AsyncWriteExt;
    stream.write_all(body).await.unwrap();

    let report = wire::read_frame(&mut stream).await.unwrap().unwrap();
    let status: landrop_network::message::TransferStatusPayload =
        report.payload_as(MessageKind::TransferStatus).unwrap();
    assert_eq!(status.status, TransferStatus::Failed);
    assert_eq!(status.error_message, "Content hash mismatch");
    assert!(!recv_dir.path().join("tampered.txt").exists());

    acceptor.abort();
    receiver.stop();
}

#[tokio::test]
async fn duplicate_transfer_id_is_rejected() {
    let recv_dir = tempfile::tempdir().unwrap();
    let receiver = engine("receiver", recv_dir.path());
    let port = receiver.start().await.unwrap();
    let mut events = receiver.subscribe();

    let identity = LocalIdentity::new(PeerId::from_string("dup"), "dup", LOOPBACK);
    let request = Envelope::with_payload(
        &identity,
        0,
        MessageKind::TransferRequest,
        &TransferRequestPayload {
            transfer_id: "same-id".into(),
            file_name: "a.txt".into(),
            file_size: 1,
            file_hash: String::new(),
        },
    );

    let mut first = TcpStream::connect((LOOPBACK, port)).await.unwrap();
    wire::write_frame(&mut first, &request).await.unwrap();
    // Wait until the first request is parked.
    loop {
        if let Ok(TransferEvent::IncomingRequest(r)) = events.recv().await {
            assert_eq!(r.transfer_id, "same-id");
            break;
        }
    }

    let mut second = TcpStream::connect((LOOPBACK, port)).await.unwrap();
    wire::write_frame(&mut second, &request).await.unwrap();
    let response = wire::read_frame(&mut second).await.unwrap().unwrap();
    let payload: TransferResponsePayload =
        response.payload_as(MessageKind::TransferResponse).unwrap();
    assert!(!payload.accepted);
    assert_eq!(payload.reject_reason, "Duplicate transfer id");

    // The first request is still waiting for a decision.
    receiver.reject_incoming("same-id", "done").unwrap();
    let response = wire::read_frame(&mut first).await.unwrap().unwrap();
    let payload: TransferResponsePayload =
        response.payload_as(MessageKind::TransferResponse).unwrap();
    assert_eq!(payload.reject_reason, "done");

    receiver.stop();
}

#[tokio::test]
async fn malformed_request_does_not_stop_listener() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let receiver = Arc::new(engine("receiver", recv_dir.path()));
    let port = receiver.start().await.unwrap();
    let acceptor = auto_accept(&receiver);

    {
        use tokio::io::AsyncWriteExt;
        let mut junk = TcpStream::connect((LOOPBACK, port)).await.unwrap();
        junk.write_all(&[5, 0, 0, 0, b'h', b'e', b'l', b'l', b'o']).await.unwrap();
    }

    let path = send_dir.path().join("after.txt");
    std::fs::write(&path, b"still works").unwrap();
    let sender = engine("sender", send_dir.path());
    let record = sender.send_file(&path, endpoint(port)).await.unwrap();
    assert_eq!(record.status, TransferStatus::Completed);

    acceptor.abort();
    receiver.stop();
}

#[tokio::test]
async fn receiver_cancel_fails_sender_and_discards_partial_file() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let path = send_dir.path().join("unwanted.bin");
    std::fs::write(&path, pattern(32 * 1024 * 1024, 9)).unwrap();

    let receiver = Arc::new(engine("receiver", recv_dir.path()));
    let port = receiver.start().await.unwrap();
    let mut events = receiver.subscribe();
    let canceller = {
        let receiver = Arc::clone(&receiver);
        tokio::spawn(async move {
            let mut cancelled = false;
            loop {
                match events.recv().await {
                    Ok(TransferEvent::IncomingRequest(request)) => {
                        receiver.accept_incoming(&request.transfer_id, None).unwrap();
                    }
                    Ok(TransferEvent::ProgressUpdated(r))
                        if !cancelled && r.bytes_transferred > 0 =>
                    {
                        assert!(receiver.cancel_transfer(&r.id));
                        cancelled = true;
                    }
                    Ok(TransferEvent::Cancelled(r)) => return r,
                    Ok(TransferEvent::Completed(r)) => panic!("transfer completed: {r:?}"),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event channel closed: {e}"),
                }
            }
        })
    };

    let sender = engine("sender", send_dir.path());
    let record = tokio::time::timeout(
        Duration::from_secs(10),
        sender.send_file(&path, endpoint(port)),
    )
    .await
    .unwrap()
    .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), canceller)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received.status, TransferStatus::Cancelled);
    assert!(received.bytes_transferred < received.file_size);
    assert!(!recv_dir.path().join("unwanted.bin").exists());
    assert!(receiver.active_transfers().is_empty());

    // The sender either reads the Cancelled report or loses the connection
    // mid-write; both end the send as Failed.
    assert_eq!(record.status, TransferStatus::Failed);
    let reason = record.error_message.unwrap_or_default();
    assert!(
        reason == "Receiver reported Cancelled" || reason.starts_with("Send failed"),
        "{reason}"
    );
    assert!(sender.active_transfers().is_empty());

    receiver.stop();
}
