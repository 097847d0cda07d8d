//! Projection from the reconciler's domain model to the configuration pushed
//! at the load-balancer.
//!
//! Projection is pure and deterministic: the model maps are all BTree-ordered,
//! so the same model snapshot always yields the same [LbConfig]. A route whose
//! service is not (or no longer) tracked is omitted from the output rather
//! than being an error - the service may simply not have been upserted yet.

use std::collections::BTreeMap;

use crate::state::{Service, ServiceName, VHost};

/// A full load-balancer configuration: every virtual host with its routes
/// resolved down to literal `ip:port` backends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LbConfig {
    pub vhosts: BTreeMap<String, VHostConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct VHostConfig {
    pub host: String,
    /// Routes keyed by path.
    pub routes: BTreeMap<String, RouteConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RouteConfig {
    pub path: String,
    pub backend: Backend,
}

/// The replicas serving one route.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Backend {
    pub endpoints: Vec<String>,
}

pub(crate) fn project(
    vhosts: &BTreeMap<String, VHost>,
    services: &BTreeMap<ServiceName, Service>,
) -> LbConfig {
    let vhosts = vhosts
        .values()
        .map(|vhost| (vhost.host.clone(), vhost_config(vhost, services)))
        .collect();

    LbConfig { vhosts }
}

pub(crate) fn vhost_config(
    vhost: &VHost,
    services: &BTreeMap<ServiceName, Service>,
) -> VHostConfig {
    let mut routes = BTreeMap::new();

    for route in vhost.routes.values() {
        let Some(service) = services.get(&route.service) else {
            continue;
        };

        let endpoints = service.endpoints.iter().map(|e| e.address.clone()).collect();
        routes.insert(
            route.path.clone(),
            RouteConfig {
                path: route.path.clone(),
                backend: Backend { endpoints },
            },
        );
    }

    VHostConfig {
        host: vhost.host.clone(),
        routes,
    }
}
