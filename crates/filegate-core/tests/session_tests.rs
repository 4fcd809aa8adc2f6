//! FTP session lifecycle against a served directory.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CountingCredentials, RecordingAudit, TestServer};
use filegate_core::authz::Role;
use filegate_core::session::LoginOutcome;
use filegate_core::{Action, FsError, vpath};

fn editor() -> Role {
    Role { key: "editor".into(), name: "Editor".into() }
}

#[tokio::test]
async fn concurrent_logins_verify_credentials_once() {
    let server = TestServer::new().await;
    server.roles.assign("alice", editor());
    let credentials = Arc::new(CountingCredentials::default());
    let audit = Arc::new(RecordingAudit::default());
    let manager = server
        .service
        .session_manager(credentials.clone(), audit.clone());

    let (a, b) = tokio::join!(
        manager.authenticate("alice", "secret", "10.0.0.1:4000"),
        manager.authenticate("alice", "secret", "10.0.0.2:4000"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(credentials.count(), 1);
    assert_eq!(a.identity.role_key, "editor");
    assert!(!a.identity.privileged);

    let again = manager.authenticate("alice", "secret", "10.0.0.1:4001").await.unwrap();
    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(credentials.count(), 1);

    for _ in 0..50 {
        if audit.records.lock().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let records = audit.records.lock();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.outcome == LoginOutcome::Success));
}

#[tokio::test]
async fn failed_login_is_audited_and_not_cached() {
    let server = TestServer::new().await;
    server.roles.assign("alice", editor());
    let credentials = Arc::new(CountingCredentials::default());
    let audit = Arc::new(RecordingAudit::default());
    let manager = server
        .service
        .session_manager(credentials.clone(), audit.clone());

    let err = manager
        .authenticate("alice", "wrong", "10.0.0.1:4000")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FsError::Authentication(_)));
    assert_eq!(err.ftp_reply(), 530);
    assert_eq!(manager.cached_sessions(), 0);

    assert!(manager.authenticate("alice", "wrong", "10.0.0.1:4000").await.is_err());
    assert_eq!(credentials.count(), 2);

    for _ in 0..50 {
        if audit.records.lock().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(audit.records.lock().iter().all(|r| r.outcome == LoginOutcome::Failure));
}

#[tokio::test]
async fn session_filesystem_honors_the_policy() {
    let server = TestServer::new().await;
    server.write("team/notes.txt", b"n");
    server.write("secret/keys.txt", b"k");
    server.roles.assign("alice", editor());
    server
        .policy
        .allow("editor", "/api/v1/fs/team/.*", &[Action::Read])
        .unwrap();
    let manager = server.service.session_manager(
        Arc::new(CountingCredentials::default()),
        Arc::new(RecordingAudit::default()),
    );

    let session = manager.authenticate("alice", "secret", "127.0.0.1:1").await.unwrap();
    let roots = session.fs.list("/").await.unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].name, vpath::encode("team"));
    assert!(session.fs.list("secret").await.is_err());

    let claims = server.service.issuer().verify(&session.auth_token).unwrap();
    assert_eq!(claims.role, "editor");
}

#[tokio::test]
async fn graceful_stop_waits_for_clients() {
    let server = TestServer::new().await;
    let manager = Arc::new(server.service.session_manager(
        Arc::new(CountingCredentials::default()),
        Arc::new(RecordingAudit::default()),
    ));

    let banner = manager.client_connected();
    assert!(!banner.is_empty());
    manager.client_connected();
    assert_eq!(manager.active_connections(), 2);
    manager.stop();

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.wait_gracefully(Duration::from_secs(5)).await })
    };
    manager.client_disconnected();
    manager.client_disconnected();
    waiter.await.unwrap().unwrap();
    assert_eq!(manager.active_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_times_out_with_lingering_clients() {
    let server = TestServer::new().await;
    let manager = server.service.session_manager(
        Arc::new(CountingCredentials::default()),
        Arc::new(RecordingAudit::default()),
    );
    manager.client_connected();
    manager.stop();

    let err = manager.wait_gracefully(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, FsError::SessionTimeout { .. }));
}
