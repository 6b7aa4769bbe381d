//! End-to-end mirroring tests against in-memory and on-disk Git remotes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cfgrepo_meta::{Author, Change, EntryContent, PathPattern, Query, Revision};
use cfgrepo_mirror::{
    Libgit2Transport, MemoryGitTransport, MetaRepoCredentialStore, MirrorError, MirrorStatus,
    MirroringScheduler, MirroringServicePluginConfig, PassSkipped, QuotaKind, RemoteSpec,
};
use common::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn local_to_remote_setup(project: &str) -> Arc<cfgrepo_meta::Node> {
    let node = single_node().await;
    create_repo(&node, project, "repo1").await;
    push(
        &node,
        project,
        "repo1",
        vec![Change::upsert_text("/test.txt", "Hello Mirror!")],
    )
    .await;
    add_none_credential(&node, project).await;
    node
}

#[tokio::test]
async fn test_custom_mirror_author_from_plugin_config() {
    let node = local_to_remote_setup("foo").await;
    let remote = remote_uri("custom");
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "test-mirror", "repo1", "LOCAL_TO_REMOTE", &remote, json!({})),
    )
    .await;

    let git = Arc::new(MemoryGitTransport::new());
    let author = Author::new("Integration Test Mirror", "test-mirror@example.com");
    let config = MirroringServicePluginConfig::new(true, 1, 8192, 32 * 1048576, false, Some(author.clone()));
    let summary = scheduler(&node, config, None, &git).mirror().await;
    assert_eq!(summary.succeeded(), 1, "{:?}", summary.reports);

    let head = git.head(&RemoteSpec::parse(&remote).unwrap()).unwrap();
    assert_eq!(head.author, author);
    assert_eq!(head.committer, author);
    assert_eq!(
        head.tree.get("/test.txt").map(Vec::as_slice),
        Some(&b"Hello Mirror!\n"[..])
    );
}

#[tokio::test]
async fn test_default_mirror_author_fallback() {
    let node = local_to_remote_setup("foo").await;
    let remote = remote_uri("default");
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "test-mirror", "repo1", "LOCAL_TO_REMOTE", &remote, json!({})),
    )
    .await;

    let git = Arc::new(MemoryGitTransport::new());
    let config = MirroringServicePluginConfig::new(true, 1, 8192, 32 * 1048576, false, None);
    scheduler(&node, config, None, &git).mirror().await;

    let head = git.head(&RemoteSpec::parse(&remote).unwrap()).unwrap();
    assert_eq!(head.author.name, "Mirror");
    assert_eq!(head.author.email, "mirror@localhost.localdomain");
    assert_eq!(head.committer, head.author);
}

#[tokio::test]
async fn test_mirror_author_overrides_plugin_default() {
    let node = local_to_remote_setup("foo").await;
    let remote = remote_uri("own");
    add_mirror(
        &node,
        "foo",
        mirror_doc(
            "foo",
            "test-mirror",
            "repo1",
            "LOCAL_TO_REMOTE",
            &remote,
            json!({"author": {"name": "Own", "email": "own@example.com"}}),
        ),
    )
    .await;

    let git = Arc::new(MemoryGitTransport::new());
    let config = MirroringServicePluginConfig {
        default_mirror_author: Some(Author::new("Plugin", "plugin@example.com")),
        ..MirroringServicePluginConfig::default()
    };
    scheduler(&node, config, None, &git).mirror().await;

    let head = git.head(&RemoteSpec::parse(&remote).unwrap()).unwrap();
    assert_eq!(head.author, Author::new("Own", "own@example.com"));
    assert_eq!(head.committer, head.author);
}

#[tokio::test]
async fn test_remote_to_local_respects_gitignore() {
    let node = single_node().await;
    create_repo(&node, "foo", "repo1").await;
    add_none_credential(&node, "foo").await;
    let remote = remote_uri("pull");
    let git = Arc::new(MemoryGitTransport::new());
    git.seed(
        &RemoteSpec::parse(&remote).unwrap(),
        [
            ("/a.json".to_string(), br#"{"x": 1}"#.to_vec()),
            ("/notes.txt".to_string(), b"hi".to_vec()),
            ("/secret.json".to_string(), b"{}".to_vec()),
        ]
        .into_iter()
        .collect(),
        &Author::new("bob", "bob@example.com"),
        "initial",
    );
    add_mirror(
        &node,
        "foo",
        mirror_doc(
            "foo",
            "pull",
            "repo1",
            "REMOTE_TO_LOCAL",
            &remote,
            json!({"gitignore": ["/secret.json"]}),
        ),
    )
    .await;

    let scheduler = scheduler(&node, MirroringServicePluginConfig::default(), None, &git);
    let summary = scheduler.mirror().await;
    assert_eq!(
        summary.report("foo", "pull").map(|r| r.status.clone()),
        Some(MirrorStatus::Synced {
            pushed: None,
            pulled: Some(Revision::new(2))
        })
    );

    let repo = node.repository("foo", "repo1").unwrap();
    let a = repo.get(Revision::HEAD, &Query::identity("/a.json")).unwrap();
    assert_eq!(a.content, EntryContent::Json(json!({"x": 1})));
    let notes = repo.get(Revision::HEAD, &Query::identity("/notes.txt")).unwrap();
    assert_eq!(notes.content, EntryContent::Text("hi\n".to_string()));
    assert!(repo
        .get_or_none(Revision::HEAD, &Query::identity("/secret.json"))
        .unwrap()
        .is_none());
    let history = repo
        .history(&PathPattern::all(), Revision::HEAD, Revision::HEAD)
        .unwrap();
    assert_eq!(history[0].author, Author::mirror());

    let again = scheduler.mirror().await;
    assert_eq!(
        again.report("foo", "pull").map(|r| r.status.clone()),
        Some(MirrorStatus::Synced {
            pushed: None,
            pulled: None
        })
    );
    assert_eq!(repo.head(), Revision::new(2));
}

#[tokio::test]
async fn test_both_directions_converge() {
    let node = local_to_remote_setup("foo").await;
    let remote = remote_uri("both");
    let git = Arc::new(MemoryGitTransport::new());
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "both", "repo1", "BOTH", &remote, json!({})),
    )
    .await;

    let scheduler = scheduler(&node, MirroringServicePluginConfig::default(), None, &git);
    let first = scheduler.mirror().await;
    assert!(matches!(
        first.report("foo", "both").map(|r| &r.status),
        Some(MirrorStatus::Synced { pushed: Some(_), pulled: None })
    ));

    let second = scheduler.mirror().await;
    assert_eq!(
        second.report("foo", "both").map(|r| r.status.clone()),
        Some(MirrorStatus::Synced {
            pushed: None,
            pulled: None
        })
    );
    assert_eq!(git.commits(&RemoteSpec::parse(&remote).unwrap()).len(), 1);
}

#[tokio::test]
async fn test_quota_exceeded_transfers_nothing() {
    let node = local_to_remote_setup("foo").await;
    push(
        &node,
        "foo",
        "repo1",
        vec![Change::upsert_text("/second.txt", "two")],
    )
    .await;
    let remote = remote_uri("quota");
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "quota", "repo1", "LOCAL_TO_REMOTE", &remote, json!({})),
    )
    .await;

    let git = Arc::new(MemoryGitTransport::new());
    let config = MirroringServicePluginConfig {
        max_num_files_per_mirror: 1,
        ..MirroringServicePluginConfig::default()
    };
    let summary = scheduler(&node, config, None, &git).mirror().await;
    assert_eq!(
        summary.report("foo", "quota").map(|r| r.status.clone()),
        Some(MirrorStatus::Failed(MirrorError::QuotaExceeded {
            kind: QuotaKind::Files,
            limit: 1,
            actual: 2
        }))
    );
    assert!(git.commits(&RemoteSpec::parse(&remote).unwrap()).is_empty());
    assert_eq!(git.operation_counts(), (0, 0));
}

#[tokio::test]
async fn test_credential_failure_is_isolated() {
    let node = local_to_remote_setup("foo").await;
    let good = remote_uri("good");
    let bad = remote_uri("bad");
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "good", "repo1", "LOCAL_TO_REMOTE", &good, json!({})),
    )
    .await;
    add_mirror(
        &node,
        "foo",
        mirror_doc(
            "foo",
            "bad",
            "repo1",
            "LOCAL_TO_REMOTE",
            &bad,
            json!({"credentialName": "projects/foo/credentials/missing"}),
        ),
    )
    .await;

    let git = Arc::new(MemoryGitTransport::new());
    let summary = scheduler(&node, MirroringServicePluginConfig::default(), None, &git)
        .mirror()
        .await;
    match summary.report("foo", "bad").map(|r| &r.status) {
        Some(MirrorStatus::Failed(e @ MirrorError::Credential(_))) => assert!(e.is_retriable()),
        other => panic!("unexpected status: {:?}", other),
    }
    assert!(matches!(
        summary.report("foo", "good").map(|r| &r.status),
        Some(MirrorStatus::Synced { pushed: Some(_), .. })
    ));
}

#[tokio::test]
async fn test_overlapping_passes_run_each_mirror_once() {
    let node = local_to_remote_setup("foo").await;
    let remote = remote_uri("slow");
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "slow", "repo1", "LOCAL_TO_REMOTE", &remote, json!({})),
    )
    .await;

    let git = Arc::new(MemoryGitTransport::new());
    git.set_latency(Duration::from_millis(300));
    let scheduler = scheduler(&node, MirroringServicePluginConfig::default(), None, &git);

    let (first, second) = tokio::join!(scheduler.mirror(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.mirror().await
    });
    assert_eq!(first.succeeded(), 1);
    assert_eq!(
        second.report("foo", "slow").map(|r| r.status.clone()),
        Some(MirrorStatus::SkippedInFlight)
    );
    assert_eq!(git.operation_counts(), (0, 1));
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_zone_pinned_mirrors_run_only_in_their_zone() {
    let node = local_to_remote_setup("foo").await;
    for (id, zone) in [("in-a", "a"), ("in-b", "b")] {
        add_mirror(
            &node,
            "foo",
            mirror_doc(
                "foo",
                id,
                "repo1",
                "LOCAL_TO_REMOTE",
                &remote_uri(id),
                json!({ "zone": zone }),
            ),
        )
        .await;
    }

    let git = Arc::new(MemoryGitTransport::new());
    let config = MirroringServicePluginConfig {
        zone_pinned: true,
        ..MirroringServicePluginConfig::default()
    };
    let summary = scheduler(&node, config, Some("a"), &git).mirror().await;
    assert!(matches!(
        summary.report("foo", "in-a").map(|r| &r.status),
        Some(MirrorStatus::Synced { .. })
    ));
    assert_eq!(
        summary.report("foo", "in-b").map(|r| r.status.clone()),
        Some(MirrorStatus::SkippedOtherZone)
    );
    assert!(git
        .commits(&RemoteSpec::parse(&remote_uri("in-b")).unwrap())
        .is_empty());
}

#[tokio::test]
async fn test_disabled_plugin_skips_pass() {
    let node = local_to_remote_setup("foo").await;
    let git = Arc::new(MemoryGitTransport::new());
    let config = MirroringServicePluginConfig {
        enabled: false,
        ..MirroringServicePluginConfig::default()
    };
    let summary = scheduler(&node, config, None, &git).mirror().await;
    assert_eq!(summary.skipped, Some(PassSkipped::Disabled));
    assert!(summary.reports.is_empty());
}

#[tokio::test]
async fn test_invalid_document_does_not_block_others() {
    let node = local_to_remote_setup("foo").await;
    let remote = remote_uri("valid");
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "valid", "repo1", "LOCAL_TO_REMOTE", &remote, json!({})),
    )
    .await;
    add_mirror(
        &node,
        "foo",
        mirror_doc(
            "foo",
            "broken",
            "repo1",
            "LOCAL_TO_REMOTE",
            "https://not-a-git-uri",
            json!({}),
        ),
    )
    .await;

    let git = Arc::new(MemoryGitTransport::new());
    let summary = scheduler(&node, MirroringServicePluginConfig::default(), None, &git)
        .mirror()
        .await;
    assert_eq!(summary.succeeded(), 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].0.ends_with("/repos/repo1/mirrors/broken.json"));
}

#[tokio::test]
async fn test_run_loop_mirrors_until_cancelled() {
    let node = local_to_remote_setup("foo").await;
    let remote = remote_uri("loop");
    add_mirror(
        &node,
        "foo",
        mirror_doc(
            "foo",
            "loop",
            "repo1",
            "LOCAL_TO_REMOTE",
            &remote,
            json!({"schedule": "* * * * * ?"}),
        ),
    )
    .await;

    let git = Arc::new(MemoryGitTransport::new());
    let scheduler = scheduler(&node, MirroringServicePluginConfig::default(), None, &git);
    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let token = token.clone();
        async move { scheduler.run(Duration::from_millis(20), token).await }
    });

    let spec = RemoteSpec::parse(&remote).unwrap();
    for _ in 0..300 {
        if !git.commits(&spec).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(git.commits(&spec).len(), 1);
    token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_scheduled_pass_skips_mirror_not_yet_due() {
    let node = local_to_remote_setup("foo").await;
    let later = remote_uri("later");
    let every_second = remote_uri("every-second");
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "later", "repo1", "LOCAL_TO_REMOTE", &later, json!({})),
    )
    .await;
    add_mirror(
        &node,
        "foo",
        mirror_doc(
            "foo",
            "every-second",
            "repo1",
            "LOCAL_TO_REMOTE",
            &every_second,
            json!({"schedule": "* * * * * ?"}),
        ),
    )
    .await;

    let git = Arc::new(MemoryGitTransport::new());
    let scheduler = scheduler(&node, MirroringServicePluginConfig::default(), None, &git);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let summary = scheduler.mirror_due(CancellationToken::new()).await;
    assert_eq!(
        summary.report("foo", "later").map(|r| &r.status),
        Some(&MirrorStatus::SkippedNotDue)
    );
    assert!(matches!(
        summary.report("foo", "every-second").map(|r| &r.status),
        Some(MirrorStatus::Synced { pushed: Some(_), .. })
    ));
    assert!(git.commits(&RemoteSpec::parse(&later).unwrap()).is_empty());

    // A manual pass ignores schedules.
    let manual = scheduler.mirror().await;
    assert!(matches!(
        manual.report("foo", "later").map(|r| &r.status),
        Some(MirrorStatus::Synced { .. })
    ));
}

#[tokio::test]
async fn test_mirrors_through_a_real_git_repository() {
    let dir = tempfile::TempDir::new().unwrap();
    git2::Repository::init_bare(dir.path().join("remote.git")).unwrap();
    let remote = format!("git+file://{}/configs", dir.path().join("remote.git").display());
    let git = Arc::new(Libgit2Transport::new(dir.path().join("cache")).unwrap());

    let node = local_to_remote_setup("foo").await;
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "out", "repo1", "LOCAL_TO_REMOTE", &remote, json!({})),
    )
    .await;
    create_repo(&node, "foo", "copy").await;
    add_mirror(
        &node,
        "foo",
        mirror_doc("foo", "in", "copy", "REMOTE_TO_LOCAL", &remote, json!({})),
    )
    .await;

    let scheduler = MirroringScheduler::new(
        node.clone(),
        MirroringServicePluginConfig::default(),
        None,
        git.clone(),
        Arc::new(MetaRepoCredentialStore::new(node.projects().clone())),
    )
    .unwrap();
    let first = scheduler.mirror().await;
    assert!(matches!(
        first.report("foo", "out").map(|r| r.status.clone()),
        Some(MirrorStatus::Synced { pushed: Some(_), .. })
    ));

    let remote_repo = git2::Repository::open_bare(dir.path().join("remote.git")).unwrap();
    let head = remote_repo
        .find_commit(remote_repo.refname_to_id("refs/heads/master").unwrap())
        .unwrap();
    let blob = head
        .tree()
        .unwrap()
        .get_path(std::path::Path::new("configs/test.txt"))
        .unwrap()
        .to_object(&remote_repo)
        .unwrap()
        .peel_to_blob()
        .unwrap();
    assert_eq!(blob.content(), b"Hello Mirror!\n");
    assert_eq!(head.author().email(), Some(Author::mirror().email.as_str()));

    // The pull mirror may have run before the push landed in the same pass.
    let copy = node.repository("foo", "copy").unwrap();
    for _ in 0..2 {
        if copy
            .get_or_none(Revision::HEAD, &Query::identity("/test.txt"))
            .unwrap()
            .is_some()
        {
            break;
        }
        scheduler.mirror().await;
    }
    let entry = copy.get(Revision::HEAD, &Query::identity("/test.txt")).unwrap();
    assert_eq!(entry.content, EntryContent::Text("Hello Mirror!\n".to_string()));

    let again = scheduler.mirror().await;
    assert_eq!(
        again.report("foo", "out").map(|r| r.status.clone()),
        Some(MirrorStatus::Synced {
            pushed: None,
            pulled: None
        })
    );
}
