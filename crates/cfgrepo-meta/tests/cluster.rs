//! Integration tests for replicated command execution on a three-node
//! in-process cluster.

mod common;

use std::time::Duration;

use cfgrepo_meta::{
    Author, Change, Command, CommandOutcome, CommandResult, MetaError, PathPattern, Query,
    RepositoryId, Revision, WatchOutcome, WatchTarget,
};
use common::TestCluster;
use serde_json::json;
use uuid::Uuid;

fn push(base: Revision, path: &str, value: serde_json::Value) -> Command {
    Command::push(
        Author::new("alice", "alice@example.com"),
        "foo",
        "bar",
        base,
        format!("update {}", path),
        vec![Change::upsert_json(path, value)],
    )
}

async fn setup(cluster: &TestCluster) -> cfgrepo_meta::NodeId {
    let leader = cluster.wait_for_leader().await;
    let node = cluster.node(leader);
    node.execute(Command::create_project(Author::system(), "foo"))
        .await
        .unwrap();
    node.execute(Command::create_repository(Author::system(), "foo", "bar"))
        .await
        .unwrap();
    cluster
        .wait_until(&cluster.all_ids(), |n| {
            n.repository("foo", "bar").map(|r| r.head()) == Ok(Revision::new(1))
        })
        .await;
    leader
}

#[tokio::test]
async fn test_single_leader_elected() {
    let cluster = TestCluster::start(3);
    let leader = cluster.wait_for_leader().await;
    let leaders = cluster.nodes.iter().filter(|n| n.is_leader()).count();
    assert_eq!(leaders, 1);
    for id in cluster.followers(leader) {
        assert_eq!(cluster.node(id).status().leader, Some(leader));
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_commands_replicate_to_every_node() {
    let cluster = TestCluster::start(3);
    let leader = setup(&cluster).await;

    let outcome = cluster
        .node(leader)
        .execute(push(Revision::HEAD, "/a.json", json!({"a": 1})))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        CommandOutcome::Applied(CommandResult::Pushed(ref r)) if r.revision == Revision::new(2)
    ));

    cluster
        .wait_until(&cluster.all_ids(), |n| {
            n.repository("foo", "bar")
                .and_then(|r| r.get(Revision::new(2), &Query::identity("/a.json")))
                .map(|e| e.content.as_json().cloned())
                .ok()
                .flatten()
                == Some(json!({"a": 1}))
        })
        .await;
    for node in &cluster.nodes {
        assert_eq!(node.projects().list(), vec!["foo".to_string()]);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_forwards_and_sees_its_own_write() {
    let cluster = TestCluster::start(3);
    let leader = setup(&cluster).await;
    let follower = cluster.followers(leader)[0];

    let outcome = cluster
        .node(follower)
        .execute(push(Revision::HEAD, "/b.json", json!(true)))
        .await
        .unwrap();
    assert!(matches!(outcome, CommandOutcome::Applied(_)));
    let entry = cluster
        .node(follower)
        .repository("foo", "bar")
        .unwrap()
        .get(Revision::HEAD, &Query::identity("/b.json"))
        .unwrap();
    assert_eq!(entry.revision, Revision::new(2));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_pushes_on_same_base_conflict() {
    let cluster = TestCluster::start(3);
    let leader = setup(&cluster).await;
    let node = cluster.node(leader);

    let (first, second) = tokio::join!(
        node.execute(push(Revision::new(1), "/x.json", json!(1))),
        node.execute(push(Revision::new(1), "/y.json", json!(2))),
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, CommandOutcome::Conflict { .. }));
    assert!(matches!(outcomes[0], CommandOutcome::Applied(_)));
    assert_eq!(
        outcomes[1],
        CommandOutcome::Conflict {
            head: Revision::new(2)
        }
    );
    assert!(outcomes[1].clone().into_result().unwrap_err().is_retriable());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_redundant_push_is_reported() {
    let cluster = TestCluster::start(3);
    let leader = setup(&cluster).await;
    let node = cluster.node(leader);

    node.execute(push(Revision::HEAD, "/a.json", json!(1)))
        .await
        .unwrap();
    let again = node
        .execute(push(Revision::HEAD, "/a.json", json!(1)))
        .await
        .unwrap();
    assert_eq!(again, CommandOutcome::Redundant);
    assert_eq!(node.repository("foo", "bar").unwrap().head(), Revision::new(2));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_same_request_id_applies_once() {
    let cluster = TestCluster::start(3);
    let leader = setup(&cluster).await;
    let follower = cluster.followers(leader)[0];
    let request_id = Uuid::new_v4();

    let executor = cluster.node(follower).executor();
    let first = executor
        .execute_with_request_id(request_id, push(Revision::new(1), "/a.json", json!(1)))
        .await
        .unwrap();
    let second = executor
        .execute_with_request_id(request_id, push(Revision::new(1), "/a.json", json!(1)))
        .await
        .unwrap();
    assert_eq!(first, second);

    cluster
        .wait_until(&cluster.all_ids(), |n| {
            n.status().last_applied == cluster.node(leader).status().last_applied
        })
        .await;
    for node in &cluster.nodes {
        assert_eq!(node.repository("foo", "bar").unwrap().head(), Revision::new(2));
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_command_rejected_before_replication() {
    let cluster = TestCluster::start(3);
    let leader = cluster.wait_for_leader().await;
    let node = cluster.node(leader);
    let before = node.status().commit_index;

    let result = node
        .execute(Command::create_repository(Author::system(), "foo", "meta"))
        .await;
    assert!(matches!(result, Err(MetaError::Validation(_))));
    assert_eq!(node.status().commit_index, before);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_watch_on_follower_fires_once_with_earliest_revision() {
    let cluster = TestCluster::start(3);
    let leader = setup(&cluster).await;
    let follower = cluster.followers(leader)[0];
    let watcher = cluster.node(follower);

    let handle = watcher
        .watch(
            "foo",
            "bar",
            WatchTarget::Pattern(PathPattern::parse("/**").unwrap()),
            Revision::HEAD,
            Some(Duration::from_secs(5)),
        )
        .unwrap();
    let repo_id = RepositoryId::new("foo", "bar");
    let mut subscription = watcher
        .watches()
        .subscribe(&repo_id, PathPattern::parse("/**").unwrap());
    assert_eq!(watcher.watches().pending_count(&repo_id), 1);

    let node = cluster.node(leader);
    node.execute(push(Revision::HEAD, "/a.json", json!(1)))
        .await
        .unwrap();
    node.execute(push(Revision::HEAD, "/b.json", json!(2)))
        .await
        .unwrap();

    match handle.wait().await {
        WatchOutcome::Fulfilled(event) => assert_eq!(event.revision, Revision::new(2)),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(watcher.watches().pending_count(&repo_id), 0);

    let first = subscription.recv().await.unwrap();
    let second = subscription.recv().await.unwrap();
    assert_eq!(first.revision, Revision::new(2));
    assert_eq!(second.revision, Revision::new(3));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_node_without_leader_rejects_commands() {
    let cluster = TestCluster::start(3);
    let leader = cluster.wait_for_leader().await;
    let isolated = cluster.followers(leader)[0];
    cluster.network.isolate(isolated);

    cluster
        .wait_until(&[isolated], |n| n.status().leader.is_none())
        .await;
    let result = cluster
        .node(isolated)
        .execute(Command::create_project(Author::system(), "foo"))
        .await;
    assert_eq!(result, Err(MetaError::NotLeader { leader_hint: None }));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_change_loses_no_committed_command() {
    let cluster = TestCluster::start(3);
    let old_leader = setup(&cluster).await;
    let old = cluster.node(old_leader);
    old.execute(push(Revision::HEAD, "/a.json", json!(1)))
        .await
        .unwrap();

    cluster.network.isolate(old_leader);
    let stranded = old
        .executor()
        .execute_with_timeout(
            Uuid::new_v4(),
            Command::create_project(Author::system(), "stranded"),
            Duration::from_millis(200),
        )
        .await;
    assert!(matches!(stranded, Err(MetaError::Timeout(_))));

    let new_leader = cluster.wait_for_leader_excluding(&[old_leader]).await;
    assert_ne!(new_leader, old_leader);
    cluster
        .wait_until(&[new_leader], |n| {
            n.repository("foo", "bar").map(|r| r.head()) == Ok(Revision::new(2))
        })
        .await;
    let new = cluster.node(new_leader);
    new.execute(push(Revision::HEAD, "/b.json", json!(2)))
        .await
        .unwrap();

    cluster.network.heal(old_leader);
    cluster.wait_for_leader().await;
    cluster
        .wait_until(&cluster.all_ids(), |n| {
            n.repository("foo", "bar").map(|r| r.head()) == Ok(Revision::new(3))
        })
        .await;
    for node in &cluster.nodes {
        assert_eq!(node.projects().list(), vec!["foo".to_string()]);
        let history = node
            .repository("foo", "bar")
            .unwrap()
            .history(
                &PathPattern::parse("/**").unwrap(),
                Revision::new(1),
                Revision::HEAD,
            )
            .unwrap();
        assert_eq!(history.len(), 3);
    }
    cluster.shutdown().await;
}
