//! keel-client: failover-aware client for an etcd-style key-value cluster.
//!
//! Discovers cluster membership from seed URIs, tracks the leader, routes
//! every request to it and keeps long-lived watch subscriptions alive
//! across leader changes.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   ├── FailoverRouter
//!   │   ├── Cluster (atomically published node list)
//!   │   │   └── Node::probe() → running/down, leader?
//!   │   ├── redirect → follow + background refresh
//!   │   └── unreachable → refresh + retry once → AllNodesDown
//!   ├── ObserverRegistry (prefix → WatchSession)
//!   │   └── watch loop: router.watch(prefix, next) → IndexWatermark → callback
//!   └── Heartbeat (optional)
//!       ├── read heartbeat key, mark cluster up/down
//!       └── leader moved / outage over → rerun sessions
//! ```
//!
//! # Protocols
//!
//! Both the flat v1 and the nested v2 JSON APIs are supported. The
//! generation is chosen in [`ClientConfig`]; responses are never
//! shape-sniffed.

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod node;
pub mod observer;
pub mod protocol;
pub mod router;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use cluster::{Cluster, NodeList};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult, ConfigError, ConfigResult, TransportError};
pub use heartbeat::{ClusterStatus, Heartbeat};
pub use node::{Node, NodeStatus};
pub use observer::{ChangeCallback, IndexWatermark, ObserverRegistry, ObserverStatus, WatchSession};
pub use protocol::{encode_key, normalize_key, Action, ChangeInfo, Lookup, Member, Protocol};
pub use router::FailoverRouter;
pub use transport::{HttpTransport, Request, Response, Transport};
