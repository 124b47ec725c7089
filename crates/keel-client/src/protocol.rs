//! Wire protocol codecs for the two supported API generations.
//!
//! Both generations describe a key change with the same fields but lay
//! them out differently:
//!
//! ```text
//! v1 (flat):   {"action","key","value","index","prevValue","newKey","ttl","expiration"}
//! v2 (nested): {"action","node":{"key","value","modifiedIndex","dir","ttl","expiration","nodes"},
//!               "prevNode":{"value"}}
//! ```
//!
//! The client picks one [`Protocol`] up front and every parser dispatches
//! on it; responses are never shape-sniffed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use http::Method;
use serde::{Deserialize, Serialize};

use crate::transport::Request;

/// API generation spoken by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    V1,
    V2,
}

/// Kind of mutation reported by a watch or a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
    Other(String),
}

impl Action {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "get" => Action::Get,
            "set" => Action::Set,
            "create" => Action::Create,
            "update" => Action::Update,
            "delete" => Action::Delete,
            "expire" => Action::Expire,
            "compareandswap" | "testandset" => Action::CompareAndSwap,
            "compareanddelete" => Action::CompareAndDelete,
            other => Action::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Get => "get",
            Action::Set => "set",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Expire => "expire",
            Action::CompareAndSwap => "compareAndSwap",
            Action::CompareAndDelete => "compareAndDelete",
            Action::Other(other) => other.as_str(),
        };
        f.write_str(name)
    }
}

/// Structured description of a key and, for watches, the change to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeInfo {
    pub action: Option<Action>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub index: Option<u64>,
    /// True when the change created the key.
    pub new_key: Option<bool>,
    pub dir: Option<bool>,
    pub previous_value: Option<String>,
    pub ttl: Option<i64>,
    pub expiration: Option<DateTime<Utc>>,
}

/// Result of reading a key that may be a leaf or a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// The key is a leaf.
    Value(T),
    /// The key is a directory; children keyed by full key.
    Listing(BTreeMap<String, T>),
}

impl<T> Lookup<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Lookup::Value(v) => Some(v),
            Lookup::Listing(_) => None,
        }
    }

    pub fn listing(&self) -> Option<&BTreeMap<String, T>> {
        match self {
            Lookup::Value(_) => None,
            Lookup::Listing(children) => Some(children),
        }
    }
}

/// One cluster member as advertised by the membership listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub client_urls: Vec<String>,
    pub peer_urls: Vec<String>,
}

/// Prepend a slash to keys that lack one.
pub fn normalize_key(key: &str) -> String {
    if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{key}")
    }
}

/// Normalized key with every `/`-separated segment percent-encoded for
/// use in a URL path.
pub fn encode_key(key: &str) -> String {
    normalize_key(key)
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// ── Wire shapes ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatRecord {
    key: Option<String>,
    value: Option<String>,
    index: Option<u64>,
    action: Option<String>,
    prev_value: Option<String>,
    new_key: Option<bool>,
    dir: Option<bool>,
    ttl: Option<i64>,
    expiration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedResponse {
    action: Option<String>,
    node: Option<NestedNode>,
    prev_node: Option<NestedNode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedNode {
    key: Option<String>,
    value: Option<String>,
    index: Option<u64>,
    modified_index: Option<u64>,
    dir: Option<bool>,
    ttl: Option<i64>,
    expiration: Option<String>,
    nodes: Option<Vec<NestedNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FlatBody {
    Listing(Vec<FlatRecord>),
    Record(FlatRecord),
}

#[derive(Debug, Deserialize)]
struct MembersV2 {
    #[serde(default)]
    members: Vec<MemberV2>,
}

#[derive(Debug, Deserialize)]
struct MemberV2 {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "peerURLs", default)]
    peer_urls: Vec<String>,
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MachineV1 {
    key: String,
    value: String,
}

fn parse_expiration(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

impl FlatRecord {
    fn into_info(self) -> ChangeInfo {
        ChangeInfo {
            action: self.action.as_deref().map(Action::parse),
            key: self.key,
            value: self.value,
            index: self.index,
            new_key: self.new_key,
            dir: self.dir,
            previous_value: self.prev_value,
            ttl: self.ttl,
            expiration: parse_expiration(self.expiration.as_deref()),
        }
    }
}

impl NestedNode {
    fn info(&self) -> ChangeInfo {
        ChangeInfo {
            action: None,
            key: self.key.clone(),
            value: self.value.clone(),
            index: self.modified_index.or(self.index),
            new_key: None,
            dir: self.dir,
            previous_value: None,
            ttl: self.ttl,
            expiration: parse_expiration(self.expiration.as_deref()),
        }
    }
}

impl NestedResponse {
    fn into_info(self) -> ChangeInfo {
        let mut info = self.node.as_ref().map(NestedNode::info).unwrap_or_default();
        info.action = self.action.as_deref().map(Action::parse);
        info.previous_value = self.prev_node.as_ref().and_then(|p| p.value.clone());
        info.new_key = Some(self.prev_node.is_none());
        info
    }
}

// ── Protocol dispatch ──────────────────────────────────────────

impl Protocol {
    fn version(self) -> &'static str {
        match self {
            Protocol::V1 => "v1",
            Protocol::V2 => "v2",
        }
    }

    /// Verb used for writes (`set`, `update`).
    pub fn write_method(self) -> Method {
        match self {
            Protocol::V1 => Method::POST,
            Protocol::V2 => Method::PUT,
        }
    }

    /// Path of the membership listing on any node.
    pub fn members_path(self) -> &'static str {
        match self {
            Protocol::V1 => "/v1/keys/_etcd/machines/",
            Protocol::V2 => "/v2/members",
        }
    }

    /// Path of the leader-identity endpoint on any node.
    pub fn leader_path(self) -> &'static str {
        match self {
            Protocol::V1 => "/v1/leader",
            Protocol::V2 => "/v2/members/leader",
        }
    }

    /// Leader-relative path for a key.
    pub fn key_path(self, key: &str) -> String {
        format!("/{}/keys{}", self.version(), encode_key(key))
    }

    /// Leader-relative request for a key operation.
    pub fn key_request(self, method: Method, key: &str) -> Request {
        Request::new(method, self.key_path(key))
    }

    /// Leader-relative long-poll for the next change at or under `prefix`.
    pub fn watch_request(self, prefix: &str, index: Option<u64>) -> Request {
        match self {
            Protocol::V1 => {
                let req = Request::get(format!("/v1/watch{}", encode_key(prefix)));
                match index {
                    Some(i) => req.with_query("index", i),
                    None => req,
                }
            }
            Protocol::V2 => {
                let req = Request::get(self.key_path(prefix))
                    .with_query("wait", "true")
                    .with_query("recursive", "true");
                match index {
                    Some(i) => req.with_query("waitIndex", i),
                    None => req,
                }
            }
        }
    }

    /// Form body for `set`/`update`.
    pub fn write_form(value: &str, ttl: Option<u64>, prev_value: Option<&str>) -> Vec<(String, String)> {
        let mut fields = vec![("value".to_string(), value.to_string())];
        if let Some(prev) = prev_value {
            fields.push(("prevValue".to_string(), prev.to_string()));
        }
        if let Some(ttl) = ttl {
            fields.push(("ttl".to_string(), ttl.to_string()));
        }
        fields
    }

    /// Parse a single change record (watch responses, writes).
    pub fn parse_change(self, body: &[u8]) -> serde_json::Result<ChangeInfo> {
        match self {
            Protocol::V1 => {
                let record: FlatRecord = serde_json::from_slice(body)?;
                Ok(record.into_info())
            }
            Protocol::V2 => {
                let resp: NestedResponse = serde_json::from_slice(body)?;
                Ok(resp.into_info())
            }
        }
    }

    /// Previous value reported by a write or delete.
    pub fn parse_previous_value(self, body: &[u8]) -> serde_json::Result<Option<String>> {
        Ok(self.parse_change(body)?.previous_value)
    }

    /// Values under a key: the leaf value, or a map of direct children.
    ///
    /// Children without a value (sub-directories) are left out of the map.
    pub fn parse_values(self, body: &[u8]) -> serde_json::Result<Option<Lookup<String>>> {
        Ok(match self.parse_info(body)? {
            None => None,
            Some(Lookup::Value(info)) => info.value.map(Lookup::Value),
            Some(Lookup::Listing(children)) => Some(Lookup::Listing(
                children
                    .into_iter()
                    .filter_map(|(k, info)| info.value.map(|v| (k, v)))
                    .collect(),
            )),
        })
    }

    /// Metadata under a key: the leaf info, or a map of child infos.
    ///
    /// The `action` field is cleared; it describes the read itself.
    pub fn parse_info(self, body: &[u8]) -> serde_json::Result<Option<Lookup<ChangeInfo>>> {
        let strip = |mut info: ChangeInfo| {
            info.action = None;
            info
        };
        match self {
            Protocol::V1 => match serde_json::from_slice::<FlatBody>(body)? {
                FlatBody::Listing(records) => Ok(Some(Lookup::Listing(
                    records
                        .into_iter()
                        .map(|r| strip(r.into_info()))
                        .filter_map(|info| info.key.clone().map(|k| (k, info)))
                        .collect(),
                ))),
                FlatBody::Record(record) => Ok(Some(Lookup::Value(strip(record.into_info())))),
            },
            Protocol::V2 => {
                let resp: NestedResponse = serde_json::from_slice(body)?;
                let Some(node) = resp.node else {
                    return Ok(None);
                };
                match &node.nodes {
                    Some(children) => Ok(Some(Lookup::Listing(
                        children
                            .iter()
                            .map(NestedNode::info)
                            .filter_map(|info| info.key.clone().map(|k| (k, info)))
                            .collect(),
                    ))),
                    None => {
                        let mut info = node.info();
                        info.previous_value = resp.prev_node.and_then(|p| p.value);
                        Ok(Some(Lookup::Value(info)))
                    }
                }
            }
        }
    }

    /// Parse the membership listing.
    ///
    /// Members that advertise no client URL cannot be routed to and are
    /// dropped.
    pub fn parse_members(self, body: &[u8]) -> serde_json::Result<Vec<Member>> {
        let members = match self {
            Protocol::V1 => {
                let machines: Vec<MachineV1> = serde_json::from_slice(body)?;
                machines.into_iter().map(machine_to_member).collect::<Vec<_>>()
            }
            Protocol::V2 => {
                let listing: MembersV2 = serde_json::from_slice(body)?;
                listing
                    .members
                    .into_iter()
                    .map(|m| Member {
                        id: m.id,
                        name: m.name,
                        client_urls: m.client_urls,
                        peer_urls: m.peer_urls,
                    })
                    .collect()
            }
        };
        Ok(members
            .into_iter()
            .filter(|m| !m.client_urls.is_empty())
            .collect())
    }

    /// Extract the leader identity from a leader-endpoint response.
    ///
    /// v1 answers with the leader's peer URL as plain text; v2 answers
    /// with the leader's member record.
    pub fn parse_leader_identity(self, body: &[u8]) -> serde_json::Result<String> {
        match self {
            Protocol::V1 => Ok(String::from_utf8_lossy(body).trim().to_string()),
            Protocol::V2 => {
                let member: MemberV2 = serde_json::from_slice(body)?;
                Ok(member.id)
            }
        }
    }

    /// Whether `identity` (from [`parse_leader_identity`](Self::parse_leader_identity))
    /// names this member.
    pub fn identifies(self, member: &Member, identity: &str) -> bool {
        match self {
            Protocol::V1 => member.peer_urls.iter().any(|u| u == identity),
            Protocol::V2 => member.id == identity,
        }
    }
}

/// `{"key":"_etcd/machines/node1","value":"raft=<peer>&etcd=<client>"}`
fn machine_to_member(machine: MachineV1) -> Member {
    let name = machine
        .key
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let mut client_urls = Vec::new();
    let mut peer_urls = Vec::new();
    for part in machine.value.split('&') {
        let Some((kind, url)) = part.split_once('=') else {
            continue;
        };
        let url = urlencoding::decode(url)
            .map(|u| u.into_owned())
            .unwrap_or_else(|_| url.to_string());
        match kind {
            "etcd" => client_urls.push(url),
            "raft" => peer_urls.push(url),
            _ => {}
        }
    }
    Member {
        id: name.clone(),
        name,
        client_urls,
        peer_urls,
    }
}
