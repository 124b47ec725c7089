//! Cluster membership and leader tracking.
//!
//! The node list is published as one `Arc<Vec<Arc<Node>>>`. Readers clone
//! the pointer and never see a half-updated set; a refresh builds and
//! probes brand new [`Node`]s and swaps them in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::node::Node;
use crate::protocol::{Member, Protocol};
use crate::transport::{HttpTransport, Request, Transport};

/// A published snapshot of the cluster.
pub type NodeList = Arc<Vec<Arc<Node>>>;

pub struct Cluster<T = HttpTransport> {
    transport: Arc<T>,
    protocol: Protocol,
    seeds: Vec<String>,
    /// Endpoint that last served a membership listing.
    seed: RwLock<String>,
    probe_timeout: Duration,
    nodes: RwLock<Option<NodeList>>,
    /// Serializes refreshes.
    refresh_lock: Mutex<()>,
    /// Bumped on every publish so queued refreshes can coalesce.
    generation: AtomicU64,
}

impl<T: Transport> Cluster<T> {
    /// Create a cluster handle without contacting anyone. Membership is
    /// fetched on first access to [`nodes`](Self::nodes).
    pub fn new(transport: Arc<T>, config: &ClientConfig) -> Self {
        let seed = config.seeds.first().cloned().unwrap_or_default();
        Self {
            transport,
            protocol: config.protocol,
            seeds: config.seeds.clone(),
            seed: RwLock::new(seed),
            probe_timeout: config.probe_timeout(),
            nodes: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Discover membership through the configured seeds and probe every
    /// member.
    ///
    /// Fails with [`ClientError::AllNodesDown`] when no seed serves a
    /// membership listing. Members that merely fail their probe do not
    /// fail discovery; the cluster then simply has no leader.
    pub async fn discover(transport: Arc<T>, config: &ClientConfig) -> ClientResult<Self> {
        let cluster = Self::new(transport, config);
        cluster.refresh().await?;
        Ok(cluster)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    /// The endpoint that last answered a membership request.
    pub fn seed(&self) -> String {
        self.seed.read().expect("seed lock").clone()
    }

    /// The published node list, discovering it on first use.
    pub async fn nodes(&self) -> ClientResult<NodeList> {
        match self.cached_nodes() {
            Some(nodes) => Ok(nodes),
            None => self.refresh().await,
        }
    }

    /// The leader of the published node list, discovering it on first use.
    pub async fn leader(&self) -> ClientResult<Option<Arc<Node>>> {
        let nodes = self.nodes().await?;
        Ok(nodes.iter().find(|n| n.is_leader()).cloned())
    }

    /// The published node list, without any network activity.
    pub fn cached_nodes(&self) -> Option<NodeList> {
        self.nodes.read().expect("nodes lock").clone()
    }

    /// The leader of the published node list, without any network activity.
    pub fn current_leader(&self) -> Option<Arc<Node>> {
        self.cached_nodes()
            .and_then(|nodes| nodes.iter().find(|n| n.is_leader()).cloned())
    }

    /// Re-fetch membership, probe every member and publish the result.
    ///
    /// Concurrent callers queue up; a caller that waited while another
    /// refresh published returns that result instead of probing again.
    /// When no endpoint serves membership, the known nodes are republished
    /// as down and [`ClientError::AllNodesDown`] is returned.
    pub async fn refresh(&self) -> ClientResult<NodeList> {
        let observed = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(nodes) = self.cached_nodes() {
                debug!("cluster refresh coalesced with concurrent refresh");
                return Ok(nodes);
            }
        }

        let Some(members) = self.fetch_members().await else {
            if let Some(known) = self.cached_nodes() {
                let down: Vec<Arc<Node>> = known.iter().map(|n| Arc::new(n.as_down())).collect();
                self.publish(Arc::new(down));
            }
            warn!(seeds = ?self.seeds, "no endpoint served cluster membership");
            return Err(ClientError::AllNodesDown);
        };

        let nodes: Vec<Node> = members.into_iter().filter_map(Node::from_member).collect();
        let probed = self.probe_all(nodes).await;
        let list: NodeList = Arc::new(probed.into_iter().map(Arc::new).collect());
        self.publish(list.clone());
        Ok(list)
    }

    /// Current seed first, then the other seeds, then every known member.
    fn candidates(&self) -> Vec<String> {
        let mut out = vec![self.seed()];
        for seed in &self.seeds {
            if !out.contains(seed) {
                out.push(seed.clone());
            }
        }
        if let Some(known) = self.cached_nodes() {
            for node in known.iter() {
                let url = node.endpoint().to_string();
                if !out.contains(&url) {
                    out.push(url);
                }
            }
        }
        out.retain(|u| !u.is_empty());
        out
    }

    async fn fetch_members(&self) -> Option<Vec<Member>> {
        for candidate in self.candidates() {
            let url = format!("{}{}", candidate.trim_end_matches('/'), self.protocol.members_path());
            let request = Request::get(&url).with_timeout(self.probe_timeout);
            match self.transport.send(request).await {
                Ok(resp) if resp.status.is_success() => match self.protocol.parse_members(&resp.body) {
                    Ok(members) if !members.is_empty() => {
                        debug!(%url, members = members.len(), "fetched cluster membership");
                        *self.seed.write().expect("seed lock") = candidate;
                        return Some(members);
                    }
                    Ok(_) => debug!(%url, "membership listing is empty"),
                    Err(e) => warn!(%url, error = %e, "malformed membership listing"),
                },
                Ok(resp) => debug!(%url, status = %resp.status, "membership request rejected"),
                Err(e) => debug!(%url, error = %e, "membership request failed"),
            }
        }
        None
    }

    /// Probe every node in parallel; results keep membership order.
    async fn probe_all(&self, nodes: Vec<Node>) -> Vec<Node> {
        let mut probed: Vec<Node> = nodes.iter().map(Node::as_down).collect();
        let mut set = JoinSet::new();
        for (i, mut node) in nodes.into_iter().enumerate() {
            let transport = self.transport.clone();
            let protocol = self.protocol;
            let timeout = self.probe_timeout;
            set.spawn(async move {
                node.probe(&*transport, protocol, timeout).await;
                (i, node)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, node)) => probed[i] = node,
                Err(e) => warn!(error = %e, "node probe task failed"),
            }
        }
        probed
    }

    fn publish(&self, nodes: NodeList) {
        let previous = self.current_leader().map(|n| n.id.clone());
        let leader = nodes.iter().find(|n| n.is_leader()).cloned();
        let running = nodes.iter().filter(|n| n.is_running()).count();

        *self.nodes.write().expect("nodes lock") = Some(nodes.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);

        match &leader {
            Some(l) if previous.as_deref() != Some(l.id.as_str()) => {
                info!(leader = %l.endpoint(), id = %l.id, running, total = nodes.len(), "cluster leader changed");
            }
            Some(l) => {
                info!(leader = %l.endpoint(), running, total = nodes.len(), "cluster refreshed");
            }
            None => warn!(running, total = nodes.len(), "cluster refreshed without a leader"),
        }
    }
}
