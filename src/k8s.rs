//! Source adapters: one watch task per resource kind, each translating raw
//! Kubernetes watch events into the reconciler's message vocabulary.
//!
//! Adapters do no business logic. Every event is applied to the kind's
//! reflector store *before* the translated message is enqueued, so by the
//! time the reconciler processes a message, its store lookups see state at
//! least as new as the event that produced the message. Per-kind delivery
//! order is preserved end to end; nothing is guaranteed across kinds.

use futures::TryStreamExt;
use k8s_openapi::{
    api::{
        core::v1::{Endpoints, Service},
        networking::v1::Ingress,
    },
    serde::Deserialize,
};
use kube::{
    runtime::{
        self,
        reflector::{self, store::Writer, Store},
        watcher, WatchStreamExt,
    },
    Resource, ResourceExt as _,
};
use std::{fmt::Debug, future::Future};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::{reconciler::Message, state::ServiceName};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WatchOp {
    Apply,
    Delete,
}

pub(crate) trait WatchedResource:
    Clone + Debug + for<'de> Deserialize<'de> + Resource<DynamicType = ()> + Send + Sync + 'static
{
    fn static_kind() -> &'static str;

    /// Drop fields that churn without affecting routing, so the stores don't
    /// hold them.
    fn strip(&mut self);

    /// Translate a watch event into a reconciler message. `None` drops the
    /// event.
    fn message(op: WatchOp, obj: &Self) -> Option<Message>;
}

const LAST_APPLIED_CONFIG: &str = "kubectl.kubernetes.io/last-applied-configuration";

fn service_name<K: kube::Resource<DynamicType = ()>>(obj: &K) -> ServiceName {
    ServiceName::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

impl WatchedResource for Ingress {
    fn static_kind() -> &'static str {
        <Ingress as k8s_openapi::Resource>::KIND
    }

    fn strip(&mut self) {
        self.annotations_mut().remove(LAST_APPLIED_CONFIG);
        self.managed_fields_mut().clear();
        self.status = None;
    }

    fn message(op: WatchOp, obj: &Self) -> Option<Message> {
        // the reconciler re-derives everything from the full resource, so
        // pass the whole payload through.
        match op {
            WatchOp::Apply => Some(Message::IngressApplied(obj.clone())),
            WatchOp::Delete => Some(Message::IngressDeleted(obj.clone())),
        }
    }
}

impl WatchedResource for Service {
    fn static_kind() -> &'static str {
        <Service as k8s_openapi::Resource>::KIND
    }

    fn strip(&mut self) {
        self.annotations_mut().remove(LAST_APPLIED_CONFIG);
        self.managed_fields_mut().clear();
        self.status = None;
    }

    fn message(op: WatchOp, obj: &Self) -> Option<Message> {
        match op {
            WatchOp::Apply => Some(Message::EndpointsChanged(service_name(obj))),
            WatchOp::Delete => Some(Message::ServiceDeleted(service_name(obj))),
        }
    }
}

impl WatchedResource for Endpoints {
    fn static_kind() -> &'static str {
        <Endpoints as k8s_openapi::Resource>::KIND
    }

    fn strip(&mut self) {
        self.annotations_mut().remove(LAST_APPLIED_CONFIG);
        self.managed_fields_mut().clear();
    }

    fn message(_op: WatchOp, obj: &Self) -> Option<Message> {
        // a deleted Endpoints object recomputes to an empty backend list via
        // the store, so delete is just another refresh.
        Some(Message::EndpointsChanged(service_name(obj)))
    }
}

/// Start watching a resource kind, feeding translated messages into the
/// reconciler's mailbox. Returns a read handle to the kind's reflector store
/// and the future that drives the watch.
pub(crate) fn watch<K: WatchedResource>(
    api: kube::Api<K>,
    mailbox: UnboundedSender<Message>,
) -> (
    Store<K>,
    impl Future<Output = Result<(), watcher::Error>> + Send + 'static,
) {
    let (store, writer) = reflector::store();
    (store.clone(), run_watch(api, writer, mailbox))
}

async fn run_watch<K: WatchedResource>(
    api: kube::Api<K>,
    mut writer: Writer<K>,
    mailbox: UnboundedSender<Message>,
) -> Result<(), watcher::Error> {
    let stream = runtime::watcher(api, runtime::watcher::Config::default().any_semantic())
        .default_backoff()
        .modify(K::strip);
    let mut stream = std::pin::pin!(stream);

    debug!(kind = K::static_kind(), "watch starting");
    while let Some(event) = stream.try_next().await? {
        writer.apply_watcher_event(&event);

        // the initial list is replayed as InitApply events through the same
        // upsert path as live updates. the reconciler's rebuild is
        // idempotent, so replaying resources it already saw during the
        // baseline sync is harmless.
        let msg = match &event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                K::message(WatchOp::Apply, obj)
            }
            watcher::Event::Delete(obj) => K::message(WatchOp::Delete, obj),
            watcher::Event::Init | watcher::Event::InitDone => None,
        };

        if let Some(msg) = msg {
            if mailbox.send(msg).is_err() {
                debug!(kind = K::static_kind(), "watch ended: mailbox closed");
                break;
            }
        }
    }

    debug!(kind = K::static_kind(), "watch exiting");
    Ok(())
}
