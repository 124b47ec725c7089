//! Public client API.

use std::sync::Arc;

use http::Method;
use tracing::info;

use crate::cluster::Cluster;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::heartbeat::{ClusterStatus, Heartbeat};
use crate::node::Node;
use crate::observer::{ObserverRegistry, ObserverStatus, WatchSession};
use crate::protocol::{ChangeInfo, Lookup, Protocol};
use crate::router::{decode, FailoverRouter};
use crate::transport::{HttpTransport, Transport};

/// Cluster-aware key-value client.
///
/// Every operation goes to the current leader through a
/// [`FailoverRouter`]. Operations report absence as `None`/`false` and
/// fail with [`ClientError::AllNodesDown`] when the cluster is
/// unreachable, or [`ClientError::InvalidRequest`] when a request cannot
/// be built at all.
pub struct Client<T = HttpTransport> {
    config: ClientConfig,
    router: FailoverRouter<T>,
    observers: ObserverRegistry<T>,
    heartbeat: Option<Heartbeat>,
}

impl Client<HttpTransport> {
    /// Discover the cluster over HTTP and start the heartbeat if configured.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        let transport = HttpTransport::new(config.connect_timeout());
        Self::with_transport(config, Arc::new(transport)).await
    }
}

impl<T: Transport> Client<T> {
    /// Like [`Client::connect`] over a caller-supplied transport.
    pub async fn with_transport(config: ClientConfig, transport: Arc<T>) -> ClientResult<Self> {
        let cluster = Cluster::discover(transport.clone(), &config)
            .await
            .map_err(|e| ClientError::connection(&config.seeds, e))?;
        let cluster = Arc::new(cluster);
        info!(
            seed = %cluster.seed(),
            leader = ?cluster.current_leader().map(|n| n.endpoint().to_string()),
            "connected to cluster"
        );

        let router = FailoverRouter::new(cluster, transport);
        let observers = ObserverRegistry::new();
        let heartbeat = Heartbeat::start(
            router.clone(),
            observers.clone(),
            config.heartbeat_interval(),
            &config.heartbeat_key,
        );

        Ok(Self {
            config,
            router,
            observers,
            heartbeat,
        })
    }

    fn protocol(&self) -> Protocol {
        self.router.protocol()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<Cluster<T>> {
        self.router.cluster()
    }

    /// The current leader, discovering the cluster if nothing is cached.
    pub async fn leader(&self) -> ClientResult<Option<Arc<Node>>> {
        self.cluster().leader().await
    }

    /// Value of a key, or the values of its direct children.
    pub async fn get(&self, key: &str) -> ClientResult<Option<Lookup<String>>> {
        let resp = self
            .router
            .execute(self.protocol().key_request(Method::GET, key))
            .await?;
        Ok(decode("get", &resp, |body| self.protocol().parse_values(body)).flatten())
    }

    /// Store a value, returning the value it replaced.
    ///
    /// Like every write, this is at-least-once across a failover: a write
    /// whose response was lost is retried once against the new leader.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> ClientResult<Option<String>> {
        let protocol = self.protocol();
        let request = protocol
            .key_request(protocol.write_method(), key)
            .with_form(Protocol::write_form(value, ttl, None));
        let resp = self.router.execute(request).await?;
        Ok(decode("set", &resp, |body| protocol.parse_previous_value(body)).flatten())
    }

    /// Compare-and-swap: store `value` only if the key currently holds
    /// `prev_value`.
    pub async fn update(
        &self,
        key: &str,
        value: &str,
        prev_value: &str,
        ttl: Option<u64>,
    ) -> ClientResult<bool> {
        let protocol = self.protocol();
        let request = protocol
            .key_request(protocol.write_method(), key)
            .with_form(Protocol::write_form(value, ttl, Some(prev_value)));
        let resp = self.router.execute(request).await?;
        Ok(decode("update", &resp, |_| Ok(())).is_some())
    }

    /// Remove a key, returning the value it held.
    pub async fn delete(&self, key: &str) -> ClientResult<Option<String>> {
        let protocol = self.protocol();
        let resp = self
            .router
            .execute(protocol.key_request(Method::DELETE, key))
            .await?;
        Ok(decode("delete", &resp, |body| protocol.parse_previous_value(body)).flatten())
    }

    pub async fn exists(&self, key: &str) -> ClientResult<bool> {
        Ok(self.info(key).await?.is_some())
    }

    /// Metadata of a key, or of its direct children.
    pub async fn info(&self, key: &str) -> ClientResult<Option<Lookup<ChangeInfo>>> {
        let resp = self
            .router
            .execute(self.protocol().key_request(Method::GET, key))
            .await?;
        Ok(decode("info", &resp, |body| self.protocol().parse_info(body)).flatten())
    }

    /// Block until one change at or under `prefix`, starting at
    /// `from_index` when given.
    pub async fn watch(&self, prefix: &str, from_index: Option<u64>) -> ClientResult<Option<ChangeInfo>> {
        self.router.watch(prefix, from_index).await
    }

    /// Start a continuous subscription on `prefix`. A previous
    /// subscription on the same prefix is cancelled.
    pub async fn observe<F>(&self, prefix: &str, callback: F) -> WatchSession<T>
    where
        F: Fn(&ChangeInfo) + Send + Sync + 'static,
    {
        let session = WatchSession::new(
            prefix,
            self.router.clone(),
            Arc::new(callback),
            self.config.watch_retry_delay(),
            None,
        );
        session.run();
        self.observers.insert(session.clone()).await;
        session
    }

    /// State of every registered subscription.
    pub async fn observers(&self) -> Vec<ObserverStatus> {
        self.observers.overview().await
    }

    /// Reachability as seen by the heartbeat, or by the cached leader when
    /// the heartbeat is disabled.
    pub fn status(&self) -> ClusterStatus {
        match &self.heartbeat {
            Some(heartbeat) => heartbeat.status(),
            None if self.cluster().current_leader().is_some() => ClusterStatus::Up,
            None => ClusterStatus::Down,
        }
    }

    /// Stop the heartbeat and cancel every subscription.
    pub async fn shutdown(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop();
        }
        self.observers.cancel_all().await;
        info!("client shut down");
    }
}
