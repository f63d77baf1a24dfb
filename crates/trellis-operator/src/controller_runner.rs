//! Controller runner - builds controller futures for the broker and trigger controllers
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;

use trellis_broker::BrokerContext;
use trellis_common::crd::{Broker, Subscription, Trigger};
use trellis_common::duck::DuckRegistry;
use trellis_common::kube_utils::build_api_resource;
use trellis_common::{EventingConfig, ObjectKey, Tracker};
use trellis_trigger::controller::broker_key;
use trellis_trigger::TriggerContext;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A kind triggers may reference as subscriber or dependency, written `<apiVersion>/<Kind>`
///
/// Changes to objects of a watched kind re-queue the triggers that read them.
/// Triggers referencing other kinds notice changes on their periodic requeue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedKind {
    /// apiVersion, e.g. `v1` or `sources.trellis.dev/v1`
    pub api_version: String,
    /// Kind, e.g. `Service`
    pub kind: String,
}

impl FromStr for WatchedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().rsplit_once('/') {
            Some((api_version, kind)) if !api_version.is_empty() && !kind.is_empty() => Ok(Self {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
            _ => Err(format!("expected <apiVersion>/<Kind>, got {s:?}")),
        }
    }
}

impl fmt::Display for WatchedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Build the broker controller future
pub fn build_broker_controllers(
    client: Client,
    ducks: Arc<DuckRegistry>,
    config: EventingConfig,
    shutdown: CancellationToken,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(BrokerContext::from_client(
        client.clone(),
        ducks,
        config,
        shutdown,
    ));
    let brokers: Api<Broker> = Api::all(client);

    tracing::info!("- Broker controller");

    vec![Box::pin(
        Controller::new(brokers, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(trellis_broker::reconcile, trellis_broker::error_policy, ctx)
            .for_each(log_reconcile_result("Broker")),
    )]
}

/// Build the trigger controller future
///
/// Triggers are re-queued when their subscriptions change and when a broker
/// or an object of a watched kind they read on their last pass changes.
pub fn build_trigger_controllers(
    client: Client,
    ducks: Arc<DuckRegistry>,
    tracker: Arc<Tracker>,
    config: EventingConfig,
    watch_kinds: &[WatchedKind],
    shutdown: CancellationToken,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(TriggerContext::from_client(
        client.clone(),
        ducks,
        tracker.clone(),
        config,
        shutdown,
    ));
    let triggers: Api<Trigger> = Api::all(client.clone());
    let subscriptions: Api<Subscription> = Api::all(client.clone());
    let brokers: Api<Broker> = Api::all(client.clone());

    tracing::info!("- Trigger controller");

    let controller = Controller::new(triggers, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(
            subscriptions,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        );
    // Triggers missing from the controller's cache are gone
    let store = controller.store();

    let broker_tracker = tracker.clone();
    let broker_store = store.clone();
    let mut controller = controller.watches(
        brokers,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        move |broker| {
            triggers_for_broker(&broker_tracker, &broker, |t| broker_store.get(t).is_some())
        },
    );

    for watched in watch_kinds {
        tracing::info!(kind = %watched, "  watching referenced kind");
        let ar = build_api_resource(&watched.api_version, &watched.kind);
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        let tracker = tracker.clone();
        let store = store.clone();
        let kind = watched.clone();
        controller = controller.watches_with(
            api,
            ar,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |obj| triggers_for_object(&tracker, &kind, &obj, |t| store.get(t).is_some()),
        );
    }

    vec![Box::pin(
        controller
            .shutdown_on_signal()
            .run(trellis_trigger::reconcile, trellis_trigger::error_policy, ctx)
            .for_each(log_reconcile_result("Trigger")),
    )]
}

/// Triggers that read `broker` on their last pass and still exist
pub fn triggers_for_broker(
    tracker: &Tracker,
    broker: &Broker,
    is_live: impl Fn(&ObjectRef<Trigger>) -> bool,
) -> Vec<ObjectRef<Trigger>> {
    let Some(namespace) = broker.namespace() else {
        return vec![];
    };
    dependents_of(tracker, &broker_key(&namespace, &broker.name_any()), is_live)
}

/// Triggers that read `obj`, an object of a watched kind, on their last pass and still exist
pub fn triggers_for_object(
    tracker: &Tracker,
    kind: &WatchedKind,
    obj: &DynamicObject,
    is_live: impl Fn(&ObjectRef<Trigger>) -> bool,
) -> Vec<ObjectRef<Trigger>> {
    let Some(namespace) = obj.namespace() else {
        return vec![];
    };
    let key = ObjectKey::new(&kind.api_version, &kind.kind, namespace, obj.name_any());
    dependents_of(tracker, &key, is_live)
}

/// Live dependents of `reference`.
///
/// Triggers have no finalizer, so a deleted trigger never gets a last pass.
/// Its tracker entries are dropped here, the first time a change to something
/// it read finds it gone.
pub fn dependents_of(
    tracker: &Tracker,
    reference: &ObjectKey,
    is_live: impl Fn(&ObjectRef<Trigger>) -> bool,
) -> Vec<ObjectRef<Trigger>> {
    let mut affected = Vec::new();
    for key in tracker.dependents(reference) {
        let trigger = ObjectRef::<Trigger>::new(&key.name).within(&key.namespace);
        if is_live(&trigger) {
            affected.push(trigger);
        } else {
            tracing::debug!(trigger = %key, "dropping references of deleted trigger");
            tracker.forget(&key);
        }
    }

    tracing::debug!(
        reference = %reference,
        affected_count = affected.len(),
        "Triggering re-reconciliation of dependent triggers"
    );
    affected
}

/// Token cancelled on SIGINT or SIGTERM; in-flight passes stop at their next store call
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received, cancelling in-flight reconciliations");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use trellis_common::crd::BrokerSpec;
    use trellis_trigger::controller::trigger_key;

    fn broker(namespace: Option<&str>, name: &str) -> Broker {
        Broker {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            },
            spec: BrokerSpec::default(),
            status: None,
        }
    }

    /// Story: a broker change re-queues exactly the triggers that read it
    #[test]
    fn story_broker_change_maps_to_dependent_triggers() {
        let tracker = Tracker::new();
        tracker.track(broker_key("tenant-a", "default"), &trigger_key("tenant-a", "orders"));
        tracker.track(broker_key("tenant-a", "default"), &trigger_key("tenant-a", "audit"));
        tracker.track(broker_key("tenant-b", "default"), &trigger_key("tenant-b", "billing"));

        let refs = triggers_for_broker(&tracker, &broker(Some("tenant-a"), "default"), |_| true);
        assert_eq!(
            refs,
            vec![
                ObjectRef::<Trigger>::new("audit").within("tenant-a"),
                ObjectRef::<Trigger>::new("orders").within("tenant-a"),
            ]
        );
    }

    #[test]
    fn unknown_or_cluster_scoped_broker_maps_to_nothing() {
        let tracker = Tracker::new();
        tracker.track(broker_key("tenant-a", "default"), &trigger_key("tenant-a", "orders"));

        assert!(
            triggers_for_broker(&tracker, &broker(Some("tenant-a"), "other"), |_| true).is_empty()
        );
        assert!(triggers_for_broker(&tracker, &broker(None, "default"), |_| true).is_empty());
    }

    /// Story: a deleted trigger is dropped from the tracker the next time its broker changes
    #[test]
    fn story_deleted_trigger_references_are_pruned() {
        let tracker = Tracker::new();
        let orders = trigger_key("tenant-a", "orders");
        let audit = trigger_key("tenant-a", "audit");
        tracker.track(broker_key("tenant-a", "default"), &orders);
        tracker.track(broker_key("tenant-a", "default"), &audit);
        tracker.track(ObjectKey::new("v1", "Service", "tenant-a", "audit-sink"), &audit);

        let live = ObjectRef::<Trigger>::new("orders").within("tenant-a");
        let refs = triggers_for_broker(&tracker, &broker(Some("tenant-a"), "default"), |t| {
            *t == live
        });
        assert_eq!(refs, vec![live.clone()]);

        // Everything audit read is gone, not just the broker entry
        assert_eq!(tracker.dependents(&broker_key("tenant-a", "default")), vec![orders]);
        assert!(tracker
            .dependents(&ObjectKey::new("v1", "Service", "tenant-a", "audit-sink"))
            .is_empty());
        assert_eq!(tracker.len(), 1);
    }

    /// Story: a subscriber Service change re-queues the triggers that resolved it
    #[test]
    fn story_watched_kind_change_maps_to_dependent_triggers() {
        let tracker = Tracker::new();
        let service_key = ObjectKey::new("v1", "Service", "tenant-a", "handler");
        tracker.track(service_key, &trigger_key("tenant-a", "orders"));

        let kind: WatchedKind = "v1/Service".parse().expect("kind should parse");
        let ar = build_api_resource(&kind.api_version, &kind.kind);
        let service = DynamicObject::new("handler", &ar).within("tenant-a");
        let other = DynamicObject::new("handler", &ar).within("tenant-b");

        assert_eq!(
            triggers_for_object(&tracker, &kind, &service, |_| true),
            vec![ObjectRef::<Trigger>::new("orders").within("tenant-a")]
        );
        assert!(triggers_for_object(&tracker, &kind, &other, |_| true).is_empty());
    }

    #[test]
    fn watched_kind_splits_at_the_last_slash() {
        let core: WatchedKind = "v1/Service".parse().expect("core kind should parse");
        assert_eq!(core.api_version, "v1");
        assert_eq!(core.kind, "Service");

        let grouped: WatchedKind = "sources.trellis.dev/v1/PingSource"
            .parse()
            .expect("grouped kind should parse");
        assert_eq!(grouped.api_version, "sources.trellis.dev/v1");
        assert_eq!(grouped.kind, "PingSource");
        assert_eq!(grouped.to_string(), "sources.trellis.dev/v1/PingSource");

        assert!("Service".parse::<WatchedKind>().is_err());
        assert!("v1/".parse::<WatchedKind>().is_err());
        assert!("/Service".parse::<WatchedKind>().is_err());
    }

    #[tokio::test]
    async fn shutdown_token_starts_uncancelled() {
        let token = shutdown_token();
        assert!(!token.is_cancelled());
    }
}
