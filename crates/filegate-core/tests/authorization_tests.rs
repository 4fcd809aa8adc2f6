//! Permission-scoped filesystem behavior through the service facade.

mod common;

use common::TestServer;
use filegate_core::{Action, FsError, vpath};

#[tokio::test]
async fn restricted_user_sees_only_granted_roots() {
    let server = TestServer::new().await;
    server.write("team/docs/plan.md", b"# plan");
    server.write("hr/salaries.csv", b"alice,1");
    server
        .policy
        .allow("editor", "/api/v1/fs/team/docs/.*", &Action::ALL)
        .unwrap();
    let fs = server.fs("alice", "editor");

    let roots = server.service.list(&fs, "").await.unwrap();
    let names: Vec<_> = roots.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![vpath::encode("team/docs").as_str()]);

    let err = server.service.list(&fs, "hr").await.unwrap_err();
    assert!(matches!(err, FsError::AuthorizationDenied { .. }));
    assert_eq!(err.http_status(), 403);
}

#[tokio::test]
async fn upload_and_delete_inside_a_virtual_root() {
    let server = TestServer::new().await;
    server.write("team/docs/plan.md", b"# plan");
    server
        .policy
        .allow("editor", "/api/v1/fs/team/docs/.*", &Action::ALL)
        .unwrap();
    let fs = server.fs("alice", "editor");
    let token = vpath::encode("team/docs");

    server
        .service
        .upload(&fs, &token, "draft.txt", &b"draft"[..])
        .await
        .unwrap();
    assert_eq!(std::fs::read(server.path("team/docs/draft.txt")).unwrap(), b"draft");
    assert!(server.service.index().get(&server.path("team/docs/draft.txt")).is_some());

    let listed = server.service.list(&fs, &token).await.unwrap();
    assert!(listed.iter().any(|e| e.path == format!("{token}/draft.txt")));

    server
        .service
        .delete(&fs, &[&format!("{token}/draft.txt")])
        .await
        .unwrap();
    assert!(!server.path("team/docs/draft.txt").exists());

    let bin = server.path(".tmp/editor");
    let trashed: Vec<_> = std::fs::read_dir(&bin)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(trashed.len(), 1);
    assert!(trashed[0].starts_with("draft.txt_"));
}

#[tokio::test]
async fn read_only_grant_blocks_every_mutation() {
    let server = TestServer::new().await;
    server.write("shared/readme.txt", b"hi");
    server
        .policy
        .allow("viewer", "/api/v1/fs/shared/.*", &[Action::Read])
        .unwrap();
    let fs = server.fs("carol", "viewer");
    let token = vpath::encode("shared");
    let file = format!("{token}/readme.txt");

    assert!(server.service.upload(&fs, &token, "x.txt", &b"x"[..]).await.is_err());
    assert!(server.service.mkdir(&fs, &format!("{token}/sub")).await.is_err());
    assert!(server.service.rename(&fs, &file, &format!("{token}/renamed.txt")).await.is_err());
    assert!(server.service.delete(&fs, &[&file]).await.is_err());

    assert!(server.path("shared/readme.txt").exists());
    assert!(!server.path("shared/x.txt").exists());
    assert!(!server.path("shared/sub").exists());

    let perms = fs.permissions(&file).await.unwrap();
    assert!(perms.read);
    assert!(!perms.write && !perms.update && !perms.delete);
}

#[tokio::test]
async fn traversal_attempts_are_refused() {
    let server = TestServer::new().await;
    server.write("team/a.txt", b"a");
    server
        .policy
        .allow("editor", "/api/v1/fs/team/.*", &Action::ALL)
        .unwrap();
    let fs = server.fs("alice", "editor");
    let escape = format!("{}/../../etc/passwd", vpath::encode("team"));

    let err = server.service.list(&fs, &escape).await.unwrap_err();
    assert!(matches!(err, FsError::PathUnsafe { .. }));
}

#[tokio::test]
async fn search_is_scoped_to_the_directory() {
    let server = TestServer::new().await;
    server.write("music/jazz/blue.flac", b"1");
    server.write("music/rock/blue.mp3", b"2");
    server.write("other/blue.txt", b"3");
    let admin = server.fs("root", "admin");

    let page = server.service.search(&admin, "music", "blue", 1, 10).await.unwrap();
    assert_eq!(page.total, 2);
    assert!(page.hits.iter().all(|h| h.path.starts_with("music/")));

    let first = server.service.search(&admin, "music", "blue", 1, 1).await.unwrap();
    assert_eq!(first.total, 2);
    assert_eq!(first.hits.len(), 1);
}
