//! Rate-limited downloads and download links.

mod common;

use std::time::Duration;

use common::TestServer;
use filegate_core::FsError;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const KIB: usize = 1024;

#[tokio::test(start_paused = true)]
async fn link_downloads_use_the_role_rate() {
    let server = TestServer::new().await;
    server.write("big.bin", &vec![7u8; 64 * KIB]);
    server.roles.set_rate("editor", 16 * 1024);
    let alice = server.identity("alice", "editor");
    let admin = server.fs("root", "admin");

    let (token, _) = server.service.issuer().issue(&alice).unwrap();
    let ticket = server
        .service
        .create_download_link(&admin, "big.bin", &token)
        .await
        .unwrap();

    let start = Instant::now();
    let mut download = server
        .service
        .download(&ticket.id.to_string(), CancellationToken::new())
        .await
        .unwrap();
    let mut body = Vec::new();
    download.body.read_to_end(&mut body).await.unwrap();
    assert_eq!(body.len(), 64 * KIB);
    assert!(
        start.elapsed() >= Duration::from_millis(2900),
        "finished in {:?}",
        start.elapsed()
    );
    assert!(!server.service.limiters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_download_stops_waiting() {
    let server = TestServer::new().await;
    server.write("big.bin", &vec![1u8; 256 * KIB]);
    server.roles.set_rate("slow", 1024);
    let bob = server.identity("bob", "slow");
    let admin = server.fs("root", "admin");
    let (token, _) = server.service.issuer().issue(&bob).unwrap();
    let ticket = server
        .service
        .create_download_link(&admin, "big.bin", &token)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut download = server
        .service
        .download(&ticket.id.to_string(), cancel.clone())
        .await
        .unwrap();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
    });
    let mut received = 0;
    let mut buf = vec![0u8; 4 * KIB];
    let err = loop {
        match download.body.read(&mut buf).await {
            Ok(0) => panic!("download finished despite cancellation"),
            Ok(n) => received += n,
            Err(e) => break e,
        }
    };
    assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
    assert!(received < 256 * KIB);
    canceller.await.unwrap();
}

#[tokio::test]
async fn links_are_stable_per_path_and_token() {
    let server = TestServer::new().await;
    server.write("a.txt", b"a");
    server.write("b.txt", b"b");
    let admin_identity = server.identity("root", "admin");
    let admin = server.service.vfs(admin_identity.clone());
    let (token, _) = server.service.issuer().issue(&admin_identity).unwrap();

    let a1 = server.service.create_download_link(&admin, "a.txt", &token).await.unwrap();
    let a2 = server.service.create_download_link(&admin, "/a.txt", &token).await.unwrap();
    let b = server.service.create_download_link(&admin, "b.txt", &token).await.unwrap();
    assert_eq!(a1, a2);
    assert_ne!(a1.id, b.id);

    std::fs::remove_file(server.path("b.txt")).unwrap();
    let err = server
        .service
        .download(&b.id.to_string(), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FsError::NotFound { .. }));
}

#[tokio::test]
async fn session_transfers_share_one_limiter_per_identity() {
    let server = TestServer::new().await;
    server.roles.set_rate("editor", 32 * 1024);
    let first = server.fs("alice", "editor");
    let second = server.fs("alice", "editor");
    let other = server.fs("dave", "editor");

    let a = first.limiter().await.unwrap();
    let b = second.limiter().await.unwrap();
    let c = other.limiter().await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));
    assert!(!std::sync::Arc::ptr_eq(&a, &c));
    assert_eq!(a.rate(), 32 * 1024);
}
