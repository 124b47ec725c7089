//! A single cluster replica and its liveness/leadership probe.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::protocol::{Member, Protocol};
use crate::transport::{Request, Transport};

/// Liveness of a node as of its last probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Never probed.
    Unknown,
    Running,
    Down,
}

/// One replica of the cluster.
///
/// Nodes are built from a membership listing and then probed once. A
/// published node is never re-probed; a cluster refresh builds new ones.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    /// Client-facing endpoints, never empty.
    client_urls: Vec<String>,
    pub peer_urls: Vec<String>,
    status: NodeStatus,
    is_leader: bool,
}

impl Node {
    /// Build an unprobed node. Returns `None` for members without a
    /// client URL.
    pub fn from_member(member: Member) -> Option<Self> {
        if member.client_urls.is_empty() {
            return None;
        }
        Some(Self {
            id: member.id,
            name: member.name,
            client_urls: member.client_urls,
            peer_urls: member.peer_urls,
            status: NodeStatus::Unknown,
            is_leader: false,
        })
    }

    /// The endpoint requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.client_urls[0]
    }

    pub fn client_urls(&self) -> &[String] {
        &self.client_urls
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn is_running(&self) -> bool {
        self.status == NodeStatus::Running
    }

    /// Same membership data, status reset to down.
    pub(crate) fn as_down(&self) -> Self {
        Self {
            status: NodeStatus::Down,
            is_leader: false,
            ..self.clone()
        }
    }

    fn member_view(&self) -> Member {
        Member {
            id: self.id.clone(),
            name: self.name.clone(),
            client_urls: self.client_urls.clone(),
            peer_urls: self.peer_urls.clone(),
        }
    }

    /// Ask the node who the leader is.
    ///
    /// Never fails: an unreachable node is marked [`NodeStatus::Down`].
    /// A node that answers with an error status or an unreadable body is
    /// running but not the leader.
    pub async fn probe<T: Transport>(&mut self, transport: &T, protocol: Protocol, timeout: Duration) {
        let url = format!("{}{}", self.endpoint(), protocol.leader_path());
        match transport.send(Request::get(&url).with_timeout(timeout)).await {
            Ok(resp) => {
                self.status = NodeStatus::Running;
                self.is_leader = resp.status.is_success()
                    && protocol
                        .parse_leader_identity(&resp.body)
                        .map(|identity| protocol.identifies(&self.member_view(), &identity))
                        .unwrap_or(false);
                debug!(node = %self.name, %url, leader = self.is_leader, "node probed");
            }
            Err(e) => {
                self.status = NodeStatus::Down;
                self.is_leader = false;
                debug!(node = %self.name, %url, error = %e, "node probe failed");
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (self.is_leader, self.status) {
            (true, _) => "leader",
            (false, NodeStatus::Running) => "running",
            (false, NodeStatus::Down) => "down",
            (false, NodeStatus::Unknown) => "unknown",
        };
        write!(f, "{} ({status}) - {}", self.name, self.endpoint())
    }
}
