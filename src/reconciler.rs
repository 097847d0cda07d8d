//! The reconciliation core: a single task that owns the desired-state model
//! and processes one message at a time from an unbounded mailbox.
//!
//! Watch adapters and the reconciler itself are the only producers; the
//! reconciler task is the only consumer and the only writer of the model, so
//! no locking is needed anywhere. Each message is handled to completion
//! before the next is dequeued. A failure to project or publish never rolls
//! back the model - the model always tracks the latest observed Kubernetes
//! state, and the next state-changing event re-publishes from scratch.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::networking::v1::{Ingress, IngressRule};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt as _;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::project;
use crate::publish::PublishMsg;
use crate::state::{Endpoint, Route, Service, ServiceName, Url, VHost};

/// The closed set of messages the reconciler accepts.
///
/// Resource-level ingress messages fan out into per-rule messages sent back
/// to the reconciler's own mailbox, so every rule change is its own atomic
/// processing step.
#[derive(Clone, Debug)]
pub(crate) enum Message {
    IngressApplied(Ingress),
    IngressDeleted(Ingress),
    IngressRuleApplied { namespace: String, rule: IngressRule },
    IngressRuleDeleted { namespace: String, rule: IngressRule },
    /// A Service or its Endpoints changed: recompute the tracked service's
    /// backend list in full.
    EndpointsChanged(ServiceName),
    ServiceDeleted(ServiceName),
    /// A virtual host changed: project it and push it downstream.
    HostChanged(String),
    /// Publish the entire current vhost set. Sent once after the baseline
    /// sync.
    FullSync,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReconcileError {
    #[error("no vhost tracked for host {0:?}")]
    VHostNotFound(String),
}

pub(crate) struct Reconciler {
    /// Services the controller has been asked to expose, keyed by identity.
    services: BTreeMap<ServiceName, Service>,
    /// Virtual hosts keyed by hostname.
    vhosts: BTreeMap<String, VHost>,
    /// Read handle into the Endpoints watch cache.
    endpoints: Store<Endpoints>,
    mailbox: mpsc::UnboundedReceiver<Message>,
    /// Sender half of our own mailbox, for per-rule fan-out.
    self_tx: mpsc::UnboundedSender<Message>,
    publish: mpsc::UnboundedSender<PublishMsg>,
}

impl Reconciler {
    pub(crate) fn new(
        mailbox: mpsc::UnboundedReceiver<Message>,
        self_tx: mpsc::UnboundedSender<Message>,
        endpoints: Store<Endpoints>,
        publish: mpsc::UnboundedSender<PublishMsg>,
    ) -> Self {
        Self {
            services: BTreeMap::new(),
            vhosts: BTreeMap::new(),
            endpoints,
            mailbox,
            self_tx,
            publish,
        }
    }

    /// Build the baseline from the already-synced Ingress cache, publish it,
    /// then drain the mailbox until every sender is gone.
    ///
    /// The caller must have waited for cache sync before calling this; watch
    /// messages that accumulated in the meantime replay through the same
    /// idempotent rebuild path.
    pub(crate) async fn run(mut self, ingresses: Store<Ingress>) {
        self.sync(&ingresses);
        info!(vhosts = self.vhosts.len(), "baseline sync complete");

        if let Err(e) = self.handle(Message::FullSync) {
            warn!(err = %e, "full sync failed");
        }

        while let Some(msg) = self.mailbox.recv().await {
            let _timer = crate::metrics::scoped_timer!("reconcile_time");
            if let Err(e) = self.handle(msg) {
                warn!(err = %e, "reconcile failed");
            }
        }
        debug!("reconciler exiting: all senders dropped");
    }

    /// Walk every Ingress the watch cache knows about and rebuild vhosts
    /// through the same path live updates take.
    fn sync(&mut self, ingresses: &Store<Ingress>) {
        for ingress in ingresses.state() {
            let namespace = ingress.namespace().unwrap_or_default();
            for rule in spec_rules(&ingress) {
                self.apply_rule(&namespace, rule);
            }
        }
    }

    fn handle(&mut self, msg: Message) -> Result<(), ReconcileError> {
        match msg {
            Message::IngressApplied(ingress) => {
                let namespace = ingress.namespace().unwrap_or_default();
                let rules = spec_rules(&ingress);
                debug!(ingress = %ingress.name_any(), rules = rules.len(), "ingress applied");

                for rule in rules {
                    self.send_self(Message::IngressRuleApplied {
                        namespace: namespace.clone(),
                        rule: rule.clone(),
                    });
                }
                Ok(())
            }
            Message::IngressDeleted(ingress) => {
                let namespace = ingress.namespace().unwrap_or_default();
                let rules = spec_rules(&ingress);
                debug!(ingress = %ingress.name_any(), rules = rules.len(), "ingress deleted");

                for rule in rules {
                    self.send_self(Message::IngressRuleDeleted {
                        namespace: namespace.clone(),
                        rule: rule.clone(),
                    });
                }
                Ok(())
            }
            Message::IngressRuleApplied { namespace, rule } => {
                let host = self.apply_rule(&namespace, &rule);
                self.send_self(Message::HostChanged(host));
                Ok(())
            }
            Message::IngressRuleDeleted { namespace, rule } => {
                self.delete_rule(&namespace, &rule)?;
                // present the backend with everything that remains, minus the
                // deleted vhost.
                self.publish_all(true);
                Ok(())
            }
            Message::EndpointsChanged(name) => {
                for host in self.refresh_endpoints(&name) {
                    self.send_self(Message::HostChanged(host));
                }
                Ok(())
            }
            Message::ServiceDeleted(name) => {
                let hosts = self.delete_service(&name);
                if !hosts.is_empty() {
                    debug!(service = %name, hosts = hosts.len(), "deleted service was exposed, republishing");
                    self.publish_all(true);
                }
                Ok(())
            }
            Message::HostChanged(host) => {
                // the vhost may have been deleted between the fan-out and
                // now; that's not an error, the delete already republished.
                let Some(vhost) = self.vhosts.get(&host) else {
                    debug!(host, "skipping publish for a host no longer tracked");
                    return Ok(());
                };

                let config = project::vhost_config(vhost, &self.services);
                let _ = self.publish.send(PublishMsg::Configure(vec![config]));
                let _ = self.publish.send(PublishMsg::Sync);
                Ok(())
            }
            Message::FullSync => {
                self.publish_all(false);
                Ok(())
            }
        }
    }

    fn send_self(&self, msg: Message) {
        // can only fail if our own receiver is gone, which means we're
        // already shutting down.
        let _ = self.self_tx.send(msg);
    }

    fn publish_all(&self, replace: bool) {
        let config = project::project(&self.vhosts, &self.services);
        let vhosts: Vec<_> = config.vhosts.into_values().collect();
        let msg = if replace {
            PublishMsg::Replace(vhosts)
        } else {
            PublishMsg::Configure(vhosts)
        };
        let _ = self.publish.send(msg);
        let _ = self.publish.send(PublishMsg::Sync);
    }

    /// Rebuild the vhost for a rule's host from scratch: drop any existing
    /// vhost, record every path's service and URL association, refresh the
    /// service's endpoints, and install the new routes.
    ///
    /// Returns the host that was rebuilt.
    fn apply_rule(&mut self, namespace: &str, rule: &IngressRule) -> String {
        let host = rule.host.clone().unwrap_or_default();
        self.vhosts.remove(&host);

        let mut vhost = VHost::new(&host);
        debug!(%vhost, "rebuilding vhost");

        for path_spec in rule_paths(rule) {
            let Some(backend) = path_spec.backend.service.as_ref() else {
                debug!(host, "skipping ingress path with no service backend");
                continue;
            };

            let path = path_spec.path.clone().unwrap_or_default();
            let name = ServiceName::new(namespace, &backend.name);
            let url = Url {
                host: host.clone(),
                path: path.clone(),
            };

            debug!(service = %name, %url, "exposing service");
            self.services
                .entry(name.clone())
                .or_insert_with(|| Service::new(name.clone()))
                .urls
                .insert(url);

            self.refresh_endpoints(&name);

            vhost.routes.insert(
                path.clone(),
                Route {
                    path,
                    service: name,
                },
            );
        }

        self.vhosts.insert(host.clone(), vhost);
        host
    }

    /// Remove the vhost for a rule's host and every URL association the rule
    /// created. Service entries themselves are retained - another vhost may
    /// still reference them, and a future rule may re-expose them.
    fn delete_rule(&mut self, namespace: &str, rule: &IngressRule) -> Result<(), ReconcileError> {
        let host = rule.host.clone().unwrap_or_default();
        if self.vhosts.remove(&host).is_none() {
            return Err(ReconcileError::VHostNotFound(host));
        }

        for path_spec in rule_paths(rule) {
            let Some(backend) = path_spec.backend.service.as_ref() else {
                continue;
            };

            let name = ServiceName::new(namespace, &backend.name);
            if let Some(service) = self.services.get_mut(&name) {
                service.urls.remove(&Url {
                    host: host.clone(),
                    path: path_spec.path.clone().unwrap_or_default(),
                });
            }
        }

        Ok(())
    }

    /// Recompute a tracked service's endpoint list in full from the current
    /// Endpoints object: every ready and not-ready address crossed with every
    /// declared port. No-op for services no ingress rule exposes.
    ///
    /// Returns the hosts of every vhost that references the service.
    fn refresh_endpoints(&mut self, name: &ServiceName) -> Vec<String> {
        let Some(service) = self.services.get_mut(name) else {
            debug!(service = %name, "endpoints changed for a service no ingress exposes, skipping");
            return Vec::new();
        };

        service.endpoints.clear();

        let obj_ref = ObjectRef::new(&name.name).within(&name.namespace);
        match self.endpoints.get(&obj_ref) {
            Some(endpoints) => {
                for subset in endpoints.subsets.iter().flatten() {
                    let ready = subset.addresses.iter().flatten();
                    let not_ready = subset.not_ready_addresses.iter().flatten();

                    for address in ready.chain(not_ready) {
                        for port in subset.ports.iter().flatten() {
                            service.endpoints.push(Endpoint {
                                service: name.clone(),
                                address: format!("{}:{}", address.ip, port.port),
                            });
                        }
                    }
                }
                debug!(service = %name, endpoints = service.endpoints.len(), "refreshed endpoints");
            }
            None => {
                debug!(service = %name, "no endpoints object in cache, backend list is empty");
            }
        }

        let hosts: BTreeSet<_> = service
            .urls
            .iter()
            .filter(|url| self.vhosts.contains_key(&url.host))
            .map(|url| url.host.clone())
            .collect();
        hosts.into_iter().collect()
    }

    /// Drop a service entry entirely. Returns the hosts that were exposing
    /// it, so the caller can decide whether to re-render.
    fn delete_service(&mut self, name: &ServiceName) -> Vec<String> {
        let Some(service) = self.services.remove(name) else {
            return Vec::new();
        };

        let hosts: BTreeSet<_> = service.urls.into_iter().map(|url| url.host).collect();
        hosts.into_iter().collect()
    }

    #[cfg(test)]
    fn drain(&mut self) {
        while let Ok(msg) = self.mailbox.try_recv() {
            if let Err(e) = self.handle(msg) {
                warn!(err = %e, "reconcile failed");
            }
        }
    }
}

fn spec_rules(ingress: &Ingress) -> &[IngressRule] {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_deref())
        .unwrap_or_default()
}

fn rule_paths(rule: &IngressRule) -> &[k8s_openapi::api::networking::v1::HTTPIngressPath] {
    rule.http.as_ref().map(|http| http.paths.as_slice()).unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset};
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressServiceBackend,
        IngressSpec, ServiceBackendPort,
    };
    use kube::core::ObjectMeta;
    use kube::runtime::reflector::{self, store::Writer};
    use kube::runtime::watcher;

    struct TestReconciler {
        reconciler: Reconciler,
        endpoints: Writer<Endpoints>,
        publish_rx: mpsc::UnboundedReceiver<PublishMsg>,
    }

    impl TestReconciler {
        fn new() -> Self {
            let (store, writer) = reflector::store();
            let (publish_tx, publish_rx) = mpsc::unbounded_channel();
            let (msg_tx, msg_rx) = mpsc::unbounded_channel();
            let reconciler = Reconciler::new(msg_rx, msg_tx, store, publish_tx);
            Self {
                reconciler,
                endpoints: writer,
                publish_rx,
            }
        }

        fn set_endpoints(&mut self, endpoints: Endpoints) {
            self.endpoints
                .apply_watcher_event(&watcher::Event::Apply(endpoints));
        }

        fn handle(&mut self, msg: Message) -> Result<(), ReconcileError> {
            let result = self.reconciler.handle(msg);
            self.reconciler.drain();
            result
        }

        fn published(&mut self) -> Vec<PublishMsg> {
            let mut msgs = Vec::new();
            while let Ok(msg) = self.publish_rx.try_recv() {
                msgs.push(msg);
            }
            msgs
        }

        fn project(&self) -> project::LbConfig {
            project::project(&self.reconciler.vhosts, &self.reconciler.services)
        }
    }

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn rule(host: &str, paths: &[(&str, &str)]) -> IngressRule {
        let paths = paths
            .iter()
            .map(|(path, svc)| HTTPIngressPath {
                path: Some(path.to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: svc.to_string(),
                        port: Some(ServiceBackendPort {
                            number: Some(80),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            })
            .collect();

        IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue { paths }),
        }
    }

    fn ingress(namespace: &str, name: &str, rules: Vec<IngressRule>) -> Ingress {
        Ingress {
            metadata: meta(namespace, name),
            spec: Some(IngressSpec {
                rules: Some(rules),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn endpoints(namespace: &str, name: &str, ips: &[&str], ports: &[i32]) -> Endpoints {
        Endpoints {
            metadata: meta(namespace, name),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ports: Some(
                    ports
                        .iter()
                        .map(|port| EndpointPort {
                            port: *port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
        }
    }

    fn applied(namespace: &str, r: IngressRule) -> Message {
        Message::IngressRuleApplied {
            namespace: namespace.to_string(),
            rule: r,
        }
    }

    fn deleted(namespace: &str, r: IngressRule) -> Message {
        Message::IngressRuleDeleted {
            namespace: namespace.to_string(),
            rule: r,
        }
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let mut t = TestReconciler::new();
        t.set_endpoints(endpoints("default", "svc1", &["10.0.0.5"], &[8080]));

        t.handle(applied("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        let once = (t.reconciler.vhosts.clone(), t.reconciler.services.clone());

        t.handle(applied("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        let twice = (t.reconciler.vhosts.clone(), t.reconciler.services.clone());

        assert_eq!(once, twice);
    }

    #[test]
    fn test_delete_then_recreate_converges() {
        let mut t = TestReconciler::new();
        t.set_endpoints(endpoints("default", "svc1", &["10.0.0.5"], &[8080]));

        t.handle(applied("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        let before = (t.reconciler.vhosts.clone(), t.reconciler.services.clone());

        t.handle(deleted("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        t.handle(applied("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        let after = (t.reconciler.vhosts.clone(), t.reconciler.services.clone());

        assert_eq!(before, after);
    }

    #[test]
    fn test_endpoint_refresh_replaces() {
        let mut t = TestReconciler::new();
        let svc1 = ServiceName::new("default", "svc1");

        t.set_endpoints(endpoints("default", "svc1", &["10.0.0.1", "10.0.0.2"], &[80]));
        t.handle(applied("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        let addresses: Vec<_> = t.reconciler.services[&svc1]
            .endpoints
            .iter()
            .map(|e| e.address.clone())
            .collect();
        assert_eq!(addresses, vec!["10.0.0.1:80", "10.0.0.2:80"]);

        // a refresh reporting only a new replica wipes out the old ones.
        t.set_endpoints(endpoints("default", "svc1", &["10.0.0.3"], &[80]));
        t.handle(Message::EndpointsChanged(svc1.clone())).unwrap();
        let addresses: Vec<_> = t.reconciler.services[&svc1]
            .endpoints
            .iter()
            .map(|e| e.address.clone())
            .collect();
        assert_eq!(addresses, vec!["10.0.0.3:80"]);
    }

    #[test]
    fn test_endpoint_cross_product_includes_not_ready() {
        let mut t = TestReconciler::new();
        let svc1 = ServiceName::new("default", "svc1");

        let mut eps = endpoints("default", "svc1", &["10.0.0.1"], &[80, 443]);
        eps.subsets.as_mut().unwrap()[0].not_ready_addresses = Some(vec![EndpointAddress {
            ip: "10.0.0.9".to_string(),
            ..Default::default()
        }]);
        t.set_endpoints(eps);

        t.handle(applied("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        let addresses: Vec<_> = t.reconciler.services[&svc1]
            .endpoints
            .iter()
            .map(|e| e.address.clone())
            .collect();
        assert_eq!(
            addresses,
            vec!["10.0.0.1:80", "10.0.0.1:443", "10.0.0.9:80", "10.0.0.9:443"]
        );
    }

    #[test]
    fn test_shared_service_fans_out() {
        let mut t = TestReconciler::new();
        let shared = ServiceName::new("default", "shared");

        t.set_endpoints(endpoints("default", "shared", &["10.0.0.1"], &[80]));
        t.handle(applied("default", rule("v1.example.com", &[("/a", "shared")])))
            .unwrap();
        t.handle(applied("default", rule("v2.example.com", &[("/b", "shared")])))
            .unwrap();
        t.published();

        t.set_endpoints(endpoints("default", "shared", &["10.0.0.7"], &[80]));
        t.handle(Message::EndpointsChanged(shared)).unwrap();

        let config = t.project();
        assert_eq!(
            config.vhosts["v1.example.com"].routes["/a"].backend.endpoints,
            vec!["10.0.0.7:80"]
        );
        assert_eq!(
            config.vhosts["v2.example.com"].routes["/b"].backend.endpoints,
            vec!["10.0.0.7:80"]
        );

        // one endpoints change publishes both affected vhosts.
        let published = t.published();
        let configured: Vec<_> = published
            .iter()
            .filter_map(|msg| match msg {
                PublishMsg::Configure(vhosts) => Some(vhosts[0].host.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(configured, vec!["v1.example.com", "v2.example.com"]);
    }

    #[test]
    fn test_missing_service_omitted_from_projection() {
        let mut t = TestReconciler::new();

        t.handle(applied("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        t.handle(Message::ServiceDeleted(ServiceName::new("default", "svc1")))
            .unwrap();

        let config = t.project();
        assert!(config.vhosts["a.example.com"].routes.is_empty());
    }

    #[test]
    fn test_end_to_end_scenario() {
        let mut t = TestReconciler::new();
        t.set_endpoints(endpoints("default", "svc1", &["10.0.0.5"], &[8080]));

        t.handle(Message::IngressApplied(ingress(
            "default",
            "web",
            vec![rule("a.example.com", &[("/x", "svc1")])],
        )))
        .unwrap();

        let config = t.project();
        let vhost = &config.vhosts["a.example.com"];
        assert_eq!(vhost.routes.len(), 1);
        assert_eq!(vhost.routes["/x"].backend.endpoints, vec!["10.0.0.5:8080"]);

        // the fan-out ends in a configure-then-sync pair for the host.
        let published = t.published();
        assert!(matches!(
            &published[..],
            [PublishMsg::Configure(vhosts), PublishMsg::Sync] if vhosts[0].host == "a.example.com"
        ));
    }

    #[test]
    fn test_delete_does_not_cascade_to_services() {
        let mut t = TestReconciler::new();
        let svc1 = ServiceName::new("default", "svc1");

        t.set_endpoints(endpoints("default", "svc1", &["10.0.0.5"], &[8080]));
        t.handle(applied("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        t.handle(deleted("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();

        assert!(!t.reconciler.vhosts.contains_key("a.example.com"));
        // the service entry and its endpoints survive the vhost.
        let service = &t.reconciler.services[&svc1];
        assert_eq!(service.endpoints.len(), 1);
        assert!(service.urls.is_empty());
    }

    #[test]
    fn test_delete_missing_vhost_is_an_error() {
        let mut t = TestReconciler::new();
        let result = t.handle(deleted("default", rule("nope.example.com", &[("/x", "svc1")])));

        assert!(matches!(
            result,
            Err(ReconcileError::VHostNotFound(host)) if host == "nope.example.com"
        ));
    }

    #[test]
    fn test_delete_republishes_remaining_vhosts() {
        let mut t = TestReconciler::new();

        t.set_endpoints(endpoints("default", "svc1", &["10.0.0.5"], &[8080]));
        t.handle(applied("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();
        t.handle(applied("default", rule("b.example.com", &[("/y", "svc1")])))
            .unwrap();
        t.published();

        t.handle(deleted("default", rule("a.example.com", &[("/x", "svc1")])))
            .unwrap();

        let published = t.published();
        assert!(matches!(
            &published[..],
            [PublishMsg::Replace(vhosts), PublishMsg::Sync]
                if vhosts.len() == 1 && vhosts[0].host == "b.example.com"
        ));
    }

    #[test]
    fn test_untracked_endpoints_are_skipped() {
        let mut t = TestReconciler::new();
        t.set_endpoints(endpoints("default", "lonely", &["10.0.0.1"], &[80]));

        t.handle(Message::EndpointsChanged(ServiceName::new("default", "lonely")))
            .unwrap();

        assert!(t.reconciler.services.is_empty());
        assert!(t.published().is_empty());
    }
}
