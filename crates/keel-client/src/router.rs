//! Leader-aware request routing with failover.
//!
//! Requests are built leader-relative (`/v2/keys/foo`) and the router
//! prepends whichever endpoint the cluster currently calls leader. Three
//! failure classes are handled here:
//!
//! - redirect: followed for the current call; a background cluster refresh
//!   is started so later calls go straight to the new leader.
//! - leader unreachable: the cluster is refreshed synchronously and the
//!   request retried once against the re-resolved leader.
//! - no leader known: fail fast without touching the network.
//!
//! Writes are retried like reads. A write that reached the old leader but
//! whose response was lost is sent again to the new one, so writes are
//! at-least-once across a failover.

use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::error::{ClientError, ClientResult, TransportError};
use crate::node::Node;
use crate::protocol::{ChangeInfo, Protocol};
use crate::transport::{resolve_location, HttpTransport, Request, Response, Transport};

/// Redirect hops followed for one request before giving up on it.
pub const MAX_REDIRECTS: usize = 5;

pub struct FailoverRouter<T = HttpTransport> {
    cluster: Arc<Cluster<T>>,
    transport: Arc<T>,
    protocol: Protocol,
}

impl<T> Clone for FailoverRouter<T> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            transport: self.transport.clone(),
            protocol: self.protocol,
        }
    }
}

impl<T: Transport> FailoverRouter<T> {
    pub fn new(cluster: Arc<Cluster<T>>, transport: Arc<T>) -> Self {
        let protocol = cluster.protocol();
        Self {
            cluster,
            transport,
            protocol,
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster<T>> {
        &self.cluster
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Send a leader-relative request to the current leader.
    ///
    /// Availability failures are [`ClientError::AllNodesDown`]; a request
    /// the transport cannot build is [`ClientError::InvalidRequest`] and
    /// never triggers a refresh. HTTP error statuses come back as ordinary
    /// responses.
    pub async fn execute(&self, request: Request) -> ClientResult<Response> {
        let Some(leader) = self.cluster.current_leader() else {
            warn!(path = %request.url, "no leader known, failing fast");
            return Err(ClientError::AllNodesDown);
        };

        let err = match self.send_via(&leader, &request).await {
            Ok(resp) => return Ok(resp),
            Err(e) if !e.is_transient() => {
                warn!(path = %request.url, error = %e, "request rejected before sending");
                return Err(ClientError::InvalidRequest(e.to_string()));
            }
            Err(e) => e,
        };
        warn!(leader = %leader.endpoint(), error = %err, "leader unreachable, refreshing cluster");

        if let Err(e) = self.cluster.refresh().await {
            warn!(error = %e, "cluster refresh during failover failed");
            return Err(ClientError::AllNodesDown);
        }
        let Some(next) = self.cluster.current_leader() else {
            warn!("no leader after refresh");
            return Err(ClientError::AllNodesDown);
        };

        self.send_via(&next, &request).await.map_err(|e| {
            warn!(leader = %next.endpoint(), error = %e, "retry after failover failed");
            if e.is_transient() {
                ClientError::AllNodesDown
            } else {
                ClientError::InvalidRequest(e.to_string())
            }
        })
    }

    /// Block until the next change at or under `prefix`.
    ///
    /// `index` is the first change index of interest; `None` waits for the
    /// next change from now. A long-poll that ends without a readable
    /// change yields `Ok(None)`.
    pub async fn watch(&self, prefix: &str, index: Option<u64>) -> ClientResult<Option<ChangeInfo>> {
        let resp = self.execute(self.protocol.watch_request(prefix, index)).await?;
        if resp.status.is_success() && resp.body.iter().all(u8::is_ascii_whitespace) {
            debug!(%prefix, "watch ended without a change");
            return Ok(None);
        }
        Ok(decode("watch", &resp, |body| self.protocol.parse_change(body)))
    }

    /// Send to `leader`, following redirects.
    async fn send_via(&self, leader: &Node, request: &Request) -> Result<Response, TransportError> {
        let mut url = format!("{}{}", leader.endpoint().trim_end_matches('/'), request.url);
        let mut redirected = false;

        for _ in 0..=MAX_REDIRECTS {
            let attempt = request.retarget(url.clone());
            debug!(method = %attempt.method, url = %attempt.full_url(), "routing request");
            let resp = self.transport.send(attempt).await?;

            let Some(location) = resp.redirect_target() else {
                if redirected {
                    self.refresh_in_background();
                }
                return Ok(resp);
            };

            // Our own query is re-appended to the new target.
            let target = resolve_location(&url, location);
            let target = target.split('?').next().unwrap_or_default().to_string();
            debug!(from = %url, to = %target, status = %resp.status, "following redirect");
            url = target;
            redirected = true;
        }

        Err(TransportError::Io(format!("more than {MAX_REDIRECTS} redirects for {}", request.url)))
    }

    fn refresh_in_background(&self) {
        let cluster = self.cluster.clone();
        tokio::spawn(async move {
            if let Err(e) = cluster.refresh().await {
                warn!(error = %e, "cluster refresh after redirect failed");
            }
        });
    }
}

/// Parse a successful body; anything else reads as absent.
///
/// 404 and 412 are the service's way of saying "no such key" and "compare
/// failed". Other statuses and malformed bodies are logged.
pub(crate) fn decode<R>(
    op: &str,
    resp: &Response,
    parse: impl FnOnce(&[u8]) -> serde_json::Result<R>,
) -> Option<R> {
    match resp.status {
        status if status.is_success() => match parse(&resp.body) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(op, error = %e, "malformed response body");
                None
            }
        },
        StatusCode::NOT_FOUND | StatusCode::PRECONDITION_FAILED => {
            debug!(op, status = %resp.status, "key absent or precondition failed");
            None
        }
        status => {
            warn!(op, %status, body = %resp.text(), "unexpected response status");
            None
        }
    }
}
