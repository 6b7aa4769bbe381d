//! Common fixtures for mirroring integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cfgrepo_meta::project::REPO_META;
use cfgrepo_meta::{
    Author, Change, Command, CommandOutcome, LocalNetwork, Node, NodeConfig, RaftConfig, Revision,
};
use cfgrepo_mirror::credential::{credential_file, credential_name};
use cfgrepo_mirror::mirror::mirror_file;
use cfgrepo_mirror::{
    MemoryGitTransport, MetaRepoCredentialStore, MirroringScheduler, MirroringServicePluginConfig,
};
use serde_json::{json, Value};

/// Starts a single replica and waits until it leads.
pub async fn single_node() -> Arc<Node> {
    let network = LocalNetwork::new();
    let config = NodeConfig {
        raft: RaftConfig {
            election_timeout_min_ms: 20,
            election_timeout_max_ms: 40,
            heartbeat_interval_ms: 10,
            ..RaftConfig::default()
        },
        ..NodeConfig::default()
    };
    let inbox = network.register(config.node_id);
    let node = Arc::new(Node::start(config, network, inbox).unwrap());
    for _ in 0..200 {
        if node.is_leader() {
            return node;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node did not become leader");
}

pub async fn create_repo(node: &Node, project: &str, repo: &str) {
    if !node.projects().exists(project) {
        node.execute(Command::create_project(Author::system(), project))
            .await
            .unwrap();
    }
    node.execute(Command::create_repository(Author::system(), project, repo))
        .await
        .unwrap();
}

pub async fn push(node: &Node, project: &str, repo: &str, changes: Vec<Change>) -> CommandOutcome {
    node.execute(Command::push(
        Author::new("alice", "alice@example.com"),
        project,
        repo,
        Revision::HEAD,
        "test change",
        changes,
    ))
    .await
    .unwrap()
}

/// Stores the anonymous credential `none` in the project's meta repository.
pub async fn add_none_credential(node: &Node, project: &str) {
    let name = credential_name(project, "none");
    push(
        node,
        project,
        REPO_META,
        vec![Change::upsert_json(
            credential_file(&name),
            json!({"type": "NONE", "name": name}),
        )],
    )
    .await;
}

pub fn remote_uri(name: &str) -> String {
    format!("git+file:///remotes/{}/.git", name)
}

/// A mirror document with the `none` credential; `extra` fields override.
pub fn mirror_doc(project: &str, id: &str, repo: &str, direction: &str, remote: &str, extra: Value) -> Value {
    let mut doc = json!({
        "id": id,
        "enabled": true,
        "type": "single",
        "direction": direction,
        "localRepo": repo,
        "localPath": "/",
        "remoteUri": remote,
        "schedule": "0 0 0 1 1 ? 2099",
        "gitignore": "",
        "credentialName": credential_name(project, "none"),
    });
    if let (Some(doc), Value::Object(extra)) = (doc.as_object_mut(), extra) {
        for (k, v) in extra {
            doc.insert(k, v);
        }
    }
    doc
}

pub async fn add_mirror(node: &Node, project: &str, doc: Value) {
    let id = doc["id"].as_str().unwrap().to_string();
    let repo = doc["localRepo"].as_str().unwrap().to_string();
    push(
        node,
        project,
        REPO_META,
        vec![Change::upsert_json(mirror_file(&repo, &id), doc)],
    )
    .await;
}

pub fn scheduler(
    node: &Arc<Node>,
    config: MirroringServicePluginConfig,
    zone: Option<&str>,
    git: &Arc<MemoryGitTransport>,
) -> MirroringScheduler {
    MirroringScheduler::new(
        node.clone(),
        config,
        zone.map(str::to_string),
        git.clone(),
        Arc::new(MetaRepoCredentialStore::new(node.projects().clone())),
    )
    .unwrap()
}
