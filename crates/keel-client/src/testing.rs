//! In-memory transport double for unit tests.
//!
//! Replies are scripted per `METHOD url` (query included). Each route
//! holds a queue; the last reply of a queue is sticky so a route keeps
//! answering after its script runs out. Every request is recorded.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{Method, StatusCode};

use crate::cluster::Cluster;
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::router::FailoverRouter;
use crate::transport::{Request, Response, Transport};

pub const NODE_URLS: [&str; 3] = [
    "http://127.0.0.1:4001",
    "http://127.0.0.1:4002",
    "http://127.0.0.1:4003",
];
pub const NODE_IDS: [&str; 3] = ["n1", "n2", "n3"];

#[derive(Debug, Clone)]
pub enum Reply {
    Respond(Response),
    Fail(TransportError),
    /// Never completes, like a long-poll with no activity.
    Hang,
}

impl Reply {
    pub fn json(status: StatusCode, body: &str) -> Self {
        Reply::Respond(Response::new(status, body.to_string()))
    }

    pub fn ok(body: &str) -> Self {
        Self::json(StatusCode::OK, body)
    }

    pub fn not_found() -> Self {
        Self::json(
            StatusCode::NOT_FOUND,
            r#"{"errorCode":100,"message":"Key not found"}"#,
        )
    }

    pub fn refused() -> Self {
        Reply::Fail(TransportError::Connect("connection refused".to_string()))
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    log: Mutex<Vec<Request>>,
}

fn route_key(method: &Method, url: &str) -> String {
    format!("{method} {url}")
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply behind any already scripted for this route.
    pub fn push(&self, method: Method, url: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry(route_key(&method, url))
            .or_default()
            .push_back(reply);
    }

    /// Replace the whole script for this route.
    pub fn set(&self, method: Method, url: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .insert(route_key(&method, url), VecDeque::from([reply]));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    /// Full URLs of recorded requests with the given method.
    pub fn urls(&self, method: Method) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .map(|r| r.full_url())
            .collect()
    }

    pub fn count(&self, method: Method, url: &str) -> usize {
        self.urls(method).iter().filter(|u| *u == url).count()
    }

    fn next_reply(&self, request: &Request) -> Reply {
        let key = route_key(&request.method, &request.full_url());
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or_else(Reply::refused),
            None => Reply::Fail(TransportError::Connect(format!("no route for {key}"))),
        }
    }

    // ── v2 cluster scripting ───────────────────────────────────

    pub fn members_body() -> String {
        let members: Vec<String> = NODE_IDS
            .iter()
            .zip(NODE_URLS.iter())
            .enumerate()
            .map(|(i, (id, url))| member_json(id, &format!("node{}", i + 1), url, 7001 + i))
            .collect();
        format!(r#"{{"members":[{}]}}"#, members.join(","))
    }

    /// Script membership and leader endpoints for the three test nodes.
    ///
    /// `leader` is the index of the leader; nodes listed in `down`
    /// refuse every connection.
    pub fn script_cluster(&self, leader: usize, down: &[usize]) {
        let leader_body = member_json(
            NODE_IDS[leader],
            &format!("node{}", leader + 1),
            NODE_URLS[leader],
            7001 + leader,
        );
        for (i, url) in NODE_URLS.iter().enumerate() {
            let members_url = format!("{url}/v2/members");
            let leader_url = format!("{url}/v2/members/leader");
            if down.contains(&i) {
                self.set(Method::GET, &members_url, Reply::refused());
                self.set(Method::GET, &leader_url, Reply::refused());
            } else {
                self.set(Method::GET, &members_url, Reply::ok(&Self::members_body()));
                self.set(Method::GET, &leader_url, Reply::ok(&leader_body));
            }
        }
    }
}

fn member_json(id: &str, name: &str, client_url: &str, peer_port: usize) -> String {
    format!(
        r#"{{"id":"{id}","name":"{name}","peerURLs":["http://127.0.0.1:{peer_port}"],"clientURLs":["{client_url}"]}}"#
    )
}

impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        self.log.lock().unwrap().push(request.clone());
        match self.next_reply(&request) {
            Reply::Respond(resp) => Ok(resp),
            Reply::Fail(e) => Err(e),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Config pointing at the three test nodes with a short probe timeout.
pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_seeds(NODE_URLS)
        .with_probe_timeout(Duration::from_millis(100))
        .with_watch_retry_delay(Duration::from_millis(10))
}

/// A router over a discovered three-node cluster led by `leader`.
pub async fn scripted_router(leader: usize) -> (Arc<ScriptedTransport>, FailoverRouter<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_cluster(leader, &[]);
    let cluster = Cluster::discover(transport.clone(), &test_config())
        .await
        .unwrap();
    let router = FailoverRouter::new(Arc::new(cluster), transport.clone());
    (transport, router)
}

/// v2 long-poll URL on a test node.
pub fn watch_url(node: usize, prefix: &str, index: Option<u64>) -> String {
    match index {
        Some(i) => format!("{}/v2/keys{prefix}?wait=true&recursive=true&waitIndex={i}", NODE_URLS[node]),
        None => format!("{}/v2/keys{prefix}?wait=true&recursive=true", NODE_URLS[node]),
    }
}

/// v2 change record as a watch would return it.
pub fn change_json(key: &str, value: &str, index: u64) -> String {
    format!(r#"{{"action":"set","node":{{"key":"{key}","value":"{value}","modifiedIndex":{index}}}}}"#)
}

/// Poll `check` until it holds, panicking after two seconds.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let polled = tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Await `fut`, panicking after two seconds.
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(Duration::from_secs(2), fut).await {
        Ok(out) => out,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
