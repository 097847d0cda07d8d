//! The desired-state model the reconciler owns: which services are exposed,
//! at which (host, path) coordinates, and which replicas back them.
//!
//! Everything here is struct-keyed. The maps in the reconciler use
//! [ServiceName], [Url], and plain path strings as keys directly, so there is
//! no string-concatenation key format that could collide when a namespace or
//! name contains a delimiter. The `Display` impls exist for logging only.

use std::collections::{BTreeMap, BTreeSet};

/// The identity of a Kubernetes Service: `{namespace, name}`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ServiceName {
    pub namespace: String,
    pub name: String,
}

impl ServiceName {
    pub(crate) fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A (host, path) coordinate. The join key between a [Service]'s exposure
/// points and a [VHost]'s routes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Url {
    pub host: String,
    pub path: String,
}

impl std::fmt::Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.path)
    }
}

/// One reachable replica of a service. Recomputed wholesale on every
/// endpoints refresh, never diffed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub service: ServiceName,
    /// `ip:port`.
    pub address: String,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.service, self.address)
    }
}

/// A backend service the controller has been asked to expose.
///
/// `endpoints` is fully replaced every time endpoint information is refreshed.
/// `urls` records every (host, path) pair this service is reachable under;
/// several ingress rules may expose the same service at different paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Service {
    pub name: ServiceName,
    pub endpoints: Vec<Endpoint>,
    pub urls: BTreeSet<Url>,
}

impl Service {
    pub(crate) fn new(name: ServiceName) -> Self {
        Self {
            name,
            endpoints: Vec::new(),
            urls: BTreeSet::new(),
        }
    }
}

/// A (path -> service) binding within a [VHost].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Route {
    pub path: String,
    pub service: ServiceName,
}

/// One externally visible virtual host. Rebuilt from scratch whenever any
/// ingress rule for its host changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct VHost {
    pub host: String,
    /// Routes keyed by path.
    pub routes: BTreeMap<String, Route>,
}

impl VHost {
    pub(crate) fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            routes: BTreeMap::new(),
        }
    }
}

impl std::fmt::Display for VHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.host)
    }
}
