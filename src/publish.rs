//! The backend publisher: a task that owns the remote load-balancer's desired
//! pool membership and pushes it over the pool API.
//!
//! The remote apply model separates definition update from runtime reload, so
//! configuring vhosts and syncing are distinct messages. Publish failures are
//! logged and counted, never escalated - the model upstream already reflects
//! the latest Kubernetes state, and the next state-changing event sends a
//! fresh configure/sync pair.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::project::VHostConfig;

/// Messages accepted by the publisher task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PublishMsg {
    /// Merge these vhosts into the pool membership.
    Configure(Vec<VHostConfig>),
    /// Reset the pool membership to exactly this set.
    Replace(Vec<VHostConfig>),
    /// Materialize the pool definition and push it to the remote API.
    Sync,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum PublishError {
    #[error("load-balancer api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid load-balancer url: {0}")]
    InvalidUrl(String),
}

/// An HAProxy-style pool definition, as the remote API expects it: one HTTP
/// frontend whose link-backend map binds host + path-prefix matches to
/// backends, and one backend per route holding the replica endpoints.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub(crate) struct Pool {
    pub name: String,
    pub haproxy: Haproxy,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub(crate) struct Haproxy {
    pub frontends: Vec<Frontend>,
    pub backends: Vec<PoolBackend>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Frontend {
    pub bind_port: u16,
    pub protocol: Protocol,
    pub link_backend: LinkBackend,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LinkBackend {
    pub map: Vec<BackendLink>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BackendLink {
    pub backend: String,
    pub host_eq: String,
    pub path_beg: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub(crate) struct PoolBackend {
    pub name: String,
    pub protocol: Protocol,
    pub services: Vec<PoolService>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub(crate) struct PoolService {
    pub endpoint: PoolEndpoint,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PoolEndpoint {
    pub address: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: EndpointKind,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum Protocol {
    Http,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum EndpointKind {
    Address,
}

/// Backend ids are `host/path`. An empty host is the default vhost and
/// renders as `0.0.0.0`.
fn backend_id(host: &str, path: &str) -> String {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    format!("{host}/{path}")
}

/// Build a full pool definition from the current vhost membership.
///
/// Pure so the mapping is testable without a remote API. Endpoints that don't
/// parse as `ip:port` are skipped with a warning rather than poisoning the
/// whole definition.
pub(crate) fn build_pool(
    name: &str,
    bind_port: u16,
    vhosts: &BTreeMap<String, VHostConfig>,
) -> Pool {
    let mut map = Vec::new();
    let mut backends = Vec::new();

    for vhost in vhosts.values() {
        for route in vhost.routes.values() {
            let id = backend_id(&vhost.host, &route.path);

            map.push(BackendLink {
                backend: id.clone(),
                host_eq: vhost.host.clone(),
                path_beg: route.path.clone(),
            });

            let mut services = Vec::new();
            for endpoint in &route.backend.endpoints {
                let Some((address, port)) = split_endpoint(endpoint) else {
                    warn!(endpoint, backend = id, "skipping unparseable endpoint");
                    continue;
                };
                services.push(PoolService {
                    endpoint: PoolEndpoint {
                        address,
                        port,
                        kind: EndpointKind::Address,
                    },
                });
            }

            backends.push(PoolBackend {
                name: id,
                protocol: Protocol::Http,
                services,
            });
        }
    }

    Pool {
        name: name.to_string(),
        haproxy: Haproxy {
            frontends: vec![Frontend {
                bind_port,
                protocol: Protocol::Http,
                link_backend: LinkBackend { map },
            }],
            backends,
        },
    }
}

fn split_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let (address, port) = endpoint.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((address.to_string(), port))
}

/// A client for the remote pool API: a named pool fetched/created once at
/// startup and replaced wholesale on every sync.
pub(crate) struct PoolClient {
    http: reqwest::Client,
    base: String,
    pool_name: String,
    token: Option<String>,
}

impl PoolClient {
    pub(crate) fn new(
        base: &str,
        pool_name: String,
        token: Option<String>,
    ) -> Result<Self, PublishError> {
        let base = base.trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(PublishError::InvalidUrl(base));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base,
            pool_name,
            token,
        })
    }

    pub(crate) fn pool_name(&self) -> &str {
        &self.pool_name
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}/{path}", self.base));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub(crate) async fn ping(&self) -> Result<(), PublishError> {
        self.request(reqwest::Method::GET, "ping")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Create the pool if the remote API doesn't have it yet. The definition
    /// is always overwritten on the first sync, so an existing pool is left
    /// alone.
    pub(crate) async fn ensure_pool(&self, bind_port: u16) -> Result<(), PublishError> {
        let path = format!("v2/pools/{}", self.pool_name);
        let response = self.request(reqwest::Method::GET, &path).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            info!(pool = self.pool_name, "pool not found, creating it");
            let pool = build_pool(&self.pool_name, bind_port, &BTreeMap::new());
            self.request(reqwest::Method::POST, "v2/pools")
                .json(&pool)
                .send()
                .await?
                .error_for_status()?;
        } else {
            response.error_for_status()?;
            debug!(pool = self.pool_name, "pool already exists");
        }

        Ok(())
    }

    /// Replace the pool definition, retrying transient failures with a short
    /// backoff. This is the only retry in the publish path - anything that
    /// still fails here waits for the next state change to re-publish.
    pub(crate) async fn update_pool(&self, pool: &Pool) -> Result<(), PublishError> {
        const ATTEMPTS: u32 = 3;

        let path = format!("v2/pools/{}", self.pool_name);
        let mut delay = Duration::from_millis(500);
        let mut last_err = None;

        for attempt in 1..=ATTEMPTS {
            let result = async {
                self.request(reqwest::Method::PUT, &path)
                    .json(pool)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<_, PublishError>(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(err = %e, attempt, "pool update attempt failed");
                    last_err = Some(e);
                    if attempt < ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(last_err.expect("at least one attempt must have run"))
    }
}

pub(crate) struct Publisher {
    mailbox: mpsc::UnboundedReceiver<PublishMsg>,
    client: PoolClient,
    bind_port: u16,
    /// Current pool membership, keyed by host.
    vhosts: BTreeMap<String, VHostConfig>,
}

impl Publisher {
    pub(crate) fn new(
        mailbox: mpsc::UnboundedReceiver<PublishMsg>,
        client: PoolClient,
        bind_port: u16,
    ) -> Self {
        Self {
            mailbox,
            client,
            bind_port,
            vhosts: BTreeMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            let mut sync = self.apply(msg);

            // coalesce whatever else is already queued so a burst of host
            // changes produces one request instead of one per change.
            while let Ok(msg) = self.mailbox.try_recv() {
                sync |= self.apply(msg);
            }

            if sync {
                self.sync().await;
            }
        }
        debug!("publisher exiting: all senders dropped");
    }

    /// Apply one message to the membership. Returns true if a sync was
    /// requested.
    fn apply(&mut self, msg: PublishMsg) -> bool {
        match msg {
            PublishMsg::Configure(vhosts) => {
                for vhost in vhosts {
                    self.vhosts.insert(vhost.host.clone(), vhost);
                }
                false
            }
            PublishMsg::Replace(vhosts) => {
                self.vhosts = vhosts
                    .into_iter()
                    .map(|vhost| (vhost.host.clone(), vhost))
                    .collect();
                false
            }
            PublishMsg::Sync => true,
        }
    }

    async fn sync(&self) {
        let _timer = crate::metrics::scoped_timer!("publish_time");

        let pool = build_pool(self.client.pool_name(), self.bind_port, &self.vhosts);
        debug!(
            pool = pool.name,
            backends = pool.haproxy.backends.len(),
            "pushing pool definition"
        );

        if let Err(e) = self.client.update_pool(&pool).await {
            metrics::counter!("publish_errors").increment(1);
            warn!(err = %e, "pool update failed, will retry on the next state change");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::project::{Backend, RouteConfig};

    fn vhost_config(host: &str, routes: &[(&str, &[&str])]) -> VHostConfig {
        let routes = routes
            .iter()
            .map(|(path, endpoints)| {
                (
                    path.to_string(),
                    RouteConfig {
                        path: path.to_string(),
                        backend: Backend {
                            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
                        },
                    },
                )
            })
            .collect();

        VHostConfig {
            host: host.to_string(),
            routes,
        }
    }

    fn membership(vhosts: Vec<VHostConfig>) -> BTreeMap<String, VHostConfig> {
        vhosts.into_iter().map(|v| (v.host.clone(), v)).collect()
    }

    #[test]
    fn test_build_pool_maps_routes() {
        let vhosts = membership(vec![vhost_config(
            "a.example.com",
            &[("/x", &["10.0.0.5:8080"]), ("/y", &["10.0.0.6:9090"])],
        )]);

        let pool = build_pool("k8s", 8080, &vhosts);

        let map = &pool.haproxy.frontends[0].link_backend.map;
        assert_eq!(map.len(), 2);
        assert_eq!(map[0].backend, "a.example.com//x");
        assert_eq!(map[0].host_eq, "a.example.com");
        assert_eq!(map[0].path_beg, "/x");

        assert_eq!(pool.haproxy.backends.len(), 2);
        let backend = &pool.haproxy.backends[0];
        assert_eq!(backend.name, "a.example.com//x");
        assert_eq!(backend.services.len(), 1);
        assert_eq!(backend.services[0].endpoint.address, "10.0.0.5");
        assert_eq!(backend.services[0].endpoint.port, 8080);
    }

    #[test]
    fn test_build_pool_default_vhost_and_bad_endpoints() {
        let vhosts = membership(vec![vhost_config(
            "",
            &[("/x", &["10.0.0.5:8080", "not-an-endpoint", "10.0.0.6:bad"])],
        )]);

        let pool = build_pool("k8s", 8080, &vhosts);

        let backend = &pool.haproxy.backends[0];
        assert_eq!(backend.name, "0.0.0.0//x");
        // the two unparseable endpoints are dropped, not fatal.
        assert_eq!(backend.services.len(), 1);
    }

    #[test]
    fn test_pool_serializes_to_remote_shape() {
        let vhosts = membership(vec![vhost_config("a", &[("/x", &["10.0.0.5:8080"])])]);
        let pool = build_pool("k8s", 8080, &vhosts);

        let json = serde_json::to_value(&pool).unwrap();
        assert_eq!(json["name"], "k8s");
        assert_eq!(json["haproxy"]["frontends"][0]["bindPort"], 8080);
        assert_eq!(json["haproxy"]["frontends"][0]["protocol"], "HTTP");
        assert_eq!(
            json["haproxy"]["frontends"][0]["linkBackend"]["map"][0]["hostEq"],
            "a"
        );
        assert_eq!(
            json["haproxy"]["backends"][0]["services"][0]["endpoint"]["type"],
            "ADDRESS"
        );
    }

    #[test]
    fn test_publisher_membership_transitions() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let client = PoolClient::new("https://lb.example.com", "k8s".to_string(), None).unwrap();
        let mut publisher = Publisher::new(rx, client, 8080);

        // configure merges.
        assert!(!publisher.apply(PublishMsg::Configure(vec![vhost_config("a", &[])])));
        assert!(!publisher.apply(PublishMsg::Configure(vec![vhost_config("b", &[])])));
        assert_eq!(
            publisher.vhosts.keys().collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        // replace resets.
        assert!(!publisher.apply(PublishMsg::Replace(vec![vhost_config("c", &[])])));
        assert_eq!(publisher.vhosts.keys().collect::<Vec<_>>(), vec!["c"]);

        // sync requests a push.
        assert!(publisher.apply(PublishMsg::Sync));
    }
}
