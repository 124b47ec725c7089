//! End-to-end tests over the real HTTP transport.
//!
//! Each test starts an in-process cluster of axum servers on
//! `127.0.0.1:0` speaking the v2 JSON API: membership, leader identity,
//! key reads/writes with TTLs, long-poll watches, and 307 redirects from
//! followers to the leader.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::header::LOCATION;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use chrono::{DateTime, Utc};
use keel_client::{Client, ClientConfig, ClientError, NodeStatus};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

// ── Fake cluster ───────────────────────────────────────────────

struct Entry {
    value: String,
    expires: Option<DateTime<Utc>>,
    modified: u64,
}

#[derive(Default)]
struct ClusterState {
    urls: Vec<String>,
    leader: usize,
    keys: BTreeMap<String, Entry>,
    index: u64,
    /// Every change, in order.
    history: Vec<(u64, String, Value)>,
    watches: usize,
}

impl ClusterState {
    fn member(&self, i: usize) -> Value {
        json!({
            "id": format!("id{i}"),
            "name": format!("node{}", i + 1),
            "peerURLs": [format!("http://127.0.0.1:{}", 7001 + i)],
            "clientURLs": [self.urls[i]],
        })
    }

    fn purge_expired(&mut self) {
        let now = Utc::now();
        self.keys.retain(|_, e| e.expires.is_none_or(|t| t > now));
    }

    fn node_json(key: &str, entry: &Entry) -> Value {
        let mut node = json!({
            "key": key,
            "value": entry.value,
            "modifiedIndex": entry.modified,
            "createdIndex": entry.modified,
        });
        if let Some(expires) = entry.expires {
            let remaining = (expires - Utc::now()).num_milliseconds();
            node["ttl"] = json!((remaining + 999) / 1000);
            node["expiration"] = json!(expires.to_rfc3339());
        }
        node
    }

    fn record(&mut self, key: &str, change: Value) {
        self.history.push((self.index, key.to_string(), change));
    }
}

#[derive(Clone)]
struct NodeState {
    idx: usize,
    cluster: Arc<Mutex<ClusterState>>,
}

impl NodeState {
    /// Followers answer key requests with a redirect to the leader.
    fn redirect(&self, uri: &Uri) -> Option<Response> {
        let cluster = self.cluster.lock().unwrap();
        if cluster.leader == self.idx {
            return None;
        }
        let target = format!("{}{}", cluster.urls[cluster.leader], uri);
        Some((StatusCode::TEMPORARY_REDIRECT, [(LOCATION, target)]).into_response())
    }
}

fn not_found(key: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"errorCode": 100, "message": "Key not found", "cause": key})),
    )
        .into_response()
}

async fn list_members(State(node): State<NodeState>) -> Json<Value> {
    let cluster = node.cluster.lock().unwrap();
    let members: Vec<Value> = (0..cluster.urls.len()).map(|i| cluster.member(i)).collect();
    Json(json!({ "members": members }))
}

async fn leader_identity(State(node): State<NodeState>) -> Json<Value> {
    let cluster = node.cluster.lock().unwrap();
    Json(cluster.member(cluster.leader))
}

async fn get_key(
    State(node): State<NodeState>,
    Path(key): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
) -> Response {
    if let Some(redirect) = node.redirect(&uri) {
        return redirect;
    }
    let key = format!("/{key}");
    if query.get("wait").map(String::as_str) == Some("true") {
        let from = query.get("waitIndex").and_then(|i| i.parse::<u64>().ok());
        return wait_for_change(&node, &key, from).await;
    }

    let mut cluster = node.cluster.lock().unwrap();
    cluster.purge_expired();
    if let Some(entry) = cluster.keys.get(&key) {
        return Json(json!({"action": "get", "node": ClusterState::node_json(&key, entry)})).into_response();
    }
    let dir_prefix = format!("{key}/");
    let children: Vec<Value> = cluster
        .keys
        .iter()
        .filter(|(k, _)| k.starts_with(&dir_prefix) && !k[dir_prefix.len()..].contains('/'))
        .map(|(k, e)| ClusterState::node_json(k, e))
        .collect();
    if children.is_empty() {
        return not_found(&key);
    }
    Json(json!({"action": "get", "node": {"key": key, "dir": true, "nodes": children}})).into_response()
}

async fn wait_for_change(node: &NodeState, prefix: &str, from: Option<u64>) -> Response {
    let start = {
        let mut cluster = node.cluster.lock().unwrap();
        cluster.watches += 1;
        from.unwrap_or(cluster.index + 1)
    };
    for _ in 0..500 {
        {
            let cluster = node.cluster.lock().unwrap();
            let hit = cluster
                .history
                .iter()
                .find(|(index, key, _)| *index >= start && key.starts_with(prefix));
            if let Some((_, _, change)) = hit {
                return Json(change.clone()).into_response();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Long-poll expired without a change.
    StatusCode::OK.into_response()
}

async fn put_key(
    State(node): State<NodeState>,
    Path(key): Path<String>,
    uri: Uri,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if let Some(redirect) = node.redirect(&uri) {
        return redirect;
    }
    let key = format!("/{key}");
    let mut cluster = node.cluster.lock().unwrap();
    cluster.purge_expired();

    let Some(value) = form.get("value").cloned() else {
        return (StatusCode::BAD_REQUEST, "value required").into_response();
    };
    let prev = cluster.keys.get(&key).map(|e| e.value.clone());
    if let Some(expected) = form.get("prevValue") {
        match &prev {
            None => return not_found(&key),
            Some(current) if current != expected => {
                return (
                    StatusCode::PRECONDITION_FAILED,
                    Json(json!({"errorCode": 101, "message": "Compare failed"})),
                )
                    .into_response();
            }
            Some(_) => {}
        }
    }

    let ttl = form.get("ttl").and_then(|t| t.parse::<i64>().ok());
    cluster.index += 1;
    let entry = Entry {
        value,
        expires: ttl.map(|t| Utc::now() + chrono::Duration::seconds(t)),
        modified: cluster.index,
    };
    let action = if form.contains_key("prevValue") { "compareAndSwap" } else { "set" };
    let mut body = json!({"action": action, "node": ClusterState::node_json(&key, &entry)});
    if let Some(prev) = &prev {
        body["prevNode"] = json!({"key": key, "value": prev});
    }
    cluster.keys.insert(key.clone(), entry);
    cluster.record(&key, body.clone());

    let status = if prev.is_some() { StatusCode::OK } else { StatusCode::CREATED };
    (status, Json(body)).into_response()
}

async fn delete_key(State(node): State<NodeState>, Path(key): Path<String>, uri: Uri) -> Response {
    if let Some(redirect) = node.redirect(&uri) {
        return redirect;
    }
    let key = format!("/{key}");
    let mut cluster = node.cluster.lock().unwrap();
    cluster.purge_expired();
    let Some(old) = cluster.keys.remove(&key) else {
        return not_found(&key);
    };
    cluster.index += 1;
    let body = json!({
        "action": "delete",
        "node": {"key": key, "modifiedIndex": cluster.index},
        "prevNode": {"key": key, "value": old.value},
    });
    cluster.record(&key, body.clone());
    Json(body).into_response()
}

struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
    urls: Vec<String>,
    servers: Vec<JoinHandle<()>>,
}

impl FakeCluster {
    async fn start(size: usize, leader: usize) -> Self {
        let mut listeners = Vec::new();
        let mut urls = Vec::new();
        for _ in 0..size {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            urls.push(format!("http://{}", listener.local_addr().unwrap()));
            listeners.push(listener);
        }

        let state = Arc::new(Mutex::new(ClusterState {
            urls: urls.clone(),
            leader,
            ..ClusterState::default()
        }));

        let servers = listeners
            .into_iter()
            .enumerate()
            .map(|(idx, listener)| {
                let router = Router::new()
                    .route("/v2/members", get(list_members))
                    .route("/v2/members/leader", get(leader_identity))
                    .route("/v2/keys/{*key}", get(get_key).put(put_key).delete(delete_key))
                    .with_state(NodeState {
                        idx,
                        cluster: state.clone(),
                    });
                tokio::spawn(async move {
                    let _ = axum::serve(listener, router).await;
                })
            })
            .collect();

        Self { state, urls, servers }
    }

    fn set_leader(&self, leader: usize) {
        self.state.lock().unwrap().leader = leader;
    }

    /// Stop accepting connections on one node.
    fn kill(&self, idx: usize) {
        self.servers[idx].abort();
    }

    fn watches(&self) -> usize {
        self.state.lock().unwrap().watches
    }

    fn config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_seeds(self.urls.clone())
            .with_probe_timeout(Duration::from_millis(500))
            .with_watch_retry_delay(Duration::from_millis(10))
    }
}

impl Drop for FakeCluster {
    fn drop(&mut self) {
        for server in &self.servers {
            server.abort();
        }
    }
}

async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

// ── Tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn discovers_cluster_from_single_seed() {
    let cluster = FakeCluster::start(3, 1).await;
    let config = cluster.config().with_seeds([cluster.urls[0].clone()]);

    let client = Client::connect(config).await.unwrap();
    let nodes = client.cluster().nodes().await.unwrap();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| n.status() == NodeStatus::Running));

    let leader = client.leader().await.unwrap().unwrap();
    assert_eq!(leader.endpoint(), cluster.urls[1]);
    assert_eq!(leader.name, "node2");
}

#[tokio::test]
async fn crud_round_trip() {
    let cluster = FakeCluster::start(3, 0).await;
    let client = Client::connect(cluster.config()).await.unwrap();

    assert_eq!(client.set("/foo", "bar", None).await.unwrap(), None);
    assert_eq!(client.set("foo", "baz", None).await.unwrap().as_deref(), Some("bar"));
    assert!(client.exists("/foo").await.unwrap());

    assert!(!client.update("/foo", "qux", "wrong", None).await.unwrap());
    assert!(client.update("/foo", "qux", "baz", None).await.unwrap());
    let value = client.get("/foo").await.unwrap().unwrap();
    assert_eq!(value.value().map(String::as_str), Some("qux"));

    client.set("/dir/a", "1", None).await.unwrap();
    client.set("/dir/b", "2", None).await.unwrap();
    let listing = client.get("/dir").await.unwrap().unwrap();
    assert_eq!(listing.listing().unwrap().len(), 2);

    assert_eq!(client.delete("/foo").await.unwrap().as_deref(), Some("qux"));
    assert_eq!(client.delete("/foo").await.unwrap(), None);
    assert_eq!(client.get("/foo").await.unwrap(), None);
}

#[tokio::test]
async fn keys_needing_escapes_round_trip() {
    let cluster = FakeCluster::start(3, 0).await;
    let client = Client::connect(cluster.config()).await.unwrap();

    assert_eq!(client.set("/my key", "a b", None).await.unwrap(), None);
    assert_eq!(client.set("/q?x#y", "1", None).await.unwrap(), None);

    let value = client.get("my key").await.unwrap().unwrap();
    assert_eq!(value.value().map(String::as_str), Some("a b"));
    assert!(client.exists("/q?x#y").await.unwrap());
    assert_eq!(client.delete("/my key").await.unwrap().as_deref(), Some("a b"));
}

#[tokio::test]
async fn ttl_round_trip() {
    let cluster = FakeCluster::start(1, 0).await;
    let client = Client::connect(cluster.config()).await.unwrap();

    client.set("/foo", "bar", Some(5)).await.unwrap();
    let info = client.info("/foo").await.unwrap().unwrap();
    let info = info.value().unwrap();

    let ttl = info.ttl.unwrap();
    assert!(ttl > 0 && ttl <= 5, "ttl {ttl}");
    let expected = Utc::now() + chrono::Duration::seconds(5);
    let drift = (info.expiration.unwrap() - expected).num_milliseconds().abs();
    assert!(drift <= 5_000, "expiration off by {drift}ms");
}

#[tokio::test]
async fn write_through_stale_leader_is_redirected() {
    let cluster = FakeCluster::start(3, 0).await;
    let client = Client::connect(cluster.config()).await.unwrap();
    assert_eq!(client.leader().await.unwrap().unwrap().endpoint(), cluster.urls[0]);

    cluster.set_leader(2);
    client.set("/foo", "bar", None).await.unwrap();

    let expected = cluster.urls[2].clone();
    eventually("client to learn the new leader", || {
        client
            .cluster()
            .current_leader()
            .is_some_and(|l| l.endpoint() == expected)
    })
    .await;
    let value = client.get("/foo").await.unwrap().unwrap();
    assert_eq!(value.value().map(String::as_str), Some("bar"));
}

#[tokio::test]
async fn crashed_leader_fails_over() {
    let cluster = FakeCluster::start(3, 0).await;
    let client = Client::connect(cluster.config()).await.unwrap();
    client.set("/foo", "bar", None).await.unwrap();

    cluster.kill(0);
    cluster.set_leader(1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let value = client.get("/foo").await.unwrap().unwrap();
    assert_eq!(value.value().map(String::as_str), Some("bar"));
    let expected = cluster.urls[1].clone();
    eventually("failover to node2", || {
        client
            .cluster()
            .current_leader()
            .is_some_and(|l| l.endpoint() == expected)
    })
    .await;
}

#[tokio::test]
async fn observe_sees_writes_in_order() {
    let cluster = FakeCluster::start(3, 0).await;
    let client = Client::connect(cluster.config()).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let session = client
        .observe("/app", move |change| {
            sink.lock().unwrap().push((change.key.clone(), change.index));
        })
        .await;
    eventually("watch to be parked", || cluster.watches() > 0).await;

    client.set("/app/a", "1", None).await.unwrap();
    client.set("/app/b", "2", None).await.unwrap();
    client.set("/other", "x", None).await.unwrap();

    eventually("both changes", || seen.lock().unwrap().len() == 2).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[0].0.as_deref(), Some("/app/a"));
    assert_eq!(seen[1].0.as_deref(), Some("/app/b"));
    assert!(seen[0].1 < seen[1].1);

    session.cancel();
    tokio::time::timeout(Duration::from_secs(5), session.join())
        .await
        .unwrap();
}

#[tokio::test]
async fn connect_with_no_live_seed_fails() {
    // Reserve ports, then release them so nothing listens there.
    let mut seeds = Vec::new();
    for _ in 0..2 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        seeds.push(format!("http://{}", listener.local_addr().unwrap()));
    }

    let config = ClientConfig::default()
        .with_seeds(seeds.clone())
        .with_probe_timeout(Duration::from_millis(500));
    let err = Client::connect(config).await.err().unwrap();
    match &err {
        ClientError::Connection { seeds: tried, source } => {
            assert_eq!(tried, &seeds);
            assert!(matches!(**source, ClientError::AllNodesDown));
        }
        other => panic!("unexpected error: {other}"),
    }
}
