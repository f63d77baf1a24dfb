//! Trigger controller implementation
//!
//! A pass checks the trigger's broker, its dependency and its subscriber,
//! then converges the subscription. Each check becomes one condition; the
//! status is derived from the previous status and these observations and is
//! written at most once, only when it changed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use trellis_common::conditions::{
    ConditionUpdate, BROKER_READY, DEPENDENCY_READY, SUBSCRIBED, SUBSCRIBER_RESOLVED,
    TRIGGER_CONDITIONS,
};
use trellis_common::crd::{Broker, ConditionStatus, Subscription, Trigger, TriggerStatus};
use trellis_common::duck::DuckRegistry;
use trellis_common::events::{actions, reasons, EventPublisher};
use trellis_common::kube_utils::namespaced_name;
use trellis_common::{
    Error, EventingConfig, KubeEventPublisher, ObjectKey, PassGuard, Tracker, FIELD_MANAGER,
};

use crate::dependency::DependencyTracker;
use crate::resolver::{AddressResolver, KubeResourceGetter, ResourceGetter};
use crate::subscription::SubscriptionReconciler;
use crate::Observation;

/// Requeue interval once the trigger is ready
const READY_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue interval while the trigger waits on its subscriber, dependency or subscription
const NOT_READY_REQUEUE: Duration = Duration::from_secs(10);
/// Requeue interval after a child ownership conflict
const OWNERSHIP_REQUEUE: Duration = Duration::from_secs(300);

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Trait abstracting Kubernetes client operations for the trigger controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TriggerKubeClient: Send + Sync {
    /// Get a broker by name
    async fn get_broker(&self, name: &str, namespace: &str) -> Result<Option<Broker>, Error>;

    /// Get a subscription by name
    async fn get_subscription(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Subscription>, Error>;

    /// Create a subscription
    async fn create_subscription(&self, subscription: &Subscription) -> Result<Subscription, Error>;

    /// Delete a subscription; deleting one that is already gone succeeds
    async fn delete_subscription(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Write trigger status, guarded by resourceVersion
    async fn update_trigger_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: &str,
        status: &TriggerStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct TriggerKubeClientImpl {
    client: Client,
}

impl TriggerKubeClientImpl {
    /// Create a new TriggerKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TriggerKubeClient for TriggerKubeClientImpl {
    async fn get_broker(&self, name: &str, namespace: &str) -> Result<Option<Broker>, Error> {
        let api: Api<Broker> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(broker) => Ok(Some(broker)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_subscription(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Subscription>, Error> {
        let api: Api<Subscription> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(sub) => Ok(Some(sub)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_subscription(&self, subscription: &Subscription) -> Result<Subscription, Error> {
        let namespace = subscription.namespace().unwrap_or_default();
        let api: Api<Subscription> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, subscription)
            .await
            .map_err(|e| Error::from_write(namespaced_name(&namespace, &subscription.name_any()), e))
    }

    async fn delete_subscription(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Subscription> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from_write(namespaced_name(namespace, name), e)),
        }
    }

    async fn update_trigger_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: &str,
        status: &TriggerStatus,
    ) -> Result<(), Error> {
        let api: Api<Trigger> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_write(namespaced_name(namespace, name), e))?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context shared across all trigger reconciliations
pub struct TriggerContext {
    /// Kubernetes client for typed API operations
    pub kube: Arc<dyn TriggerKubeClient>,
    /// Reader for subscriber and dependency objects of any kind
    pub resources: Arc<dyn ResourceGetter>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Capability registry used to read addresses and readiness
    pub ducks: Arc<DuckRegistry>,
    /// References read by each trigger on its last pass
    pub tracker: Arc<Tracker>,
    /// Shared eventing configuration
    pub config: EventingConfig,
    /// Cancelled when the controller shuts down
    pub shutdown: CancellationToken,
}

impl TriggerContext {
    /// Create a new TriggerContext with the given dependencies
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kube: Arc<dyn TriggerKubeClient>,
        resources: Arc<dyn ResourceGetter>,
        events: Arc<dyn EventPublisher>,
        ducks: Arc<DuckRegistry>,
        tracker: Arc<Tracker>,
        config: EventingConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            kube,
            resources,
            events,
            ducks,
            tracker,
            config,
            shutdown,
        }
    }

    /// Create a TriggerContext from a Kubernetes client
    pub fn from_client(
        client: Client,
        ducks: Arc<DuckRegistry>,
        tracker: Arc<Tracker>,
        config: EventingConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            "trellis-trigger-controller",
        ));
        Self::new(
            Arc::new(TriggerKubeClientImpl::new(client.clone())),
            Arc::new(KubeResourceGetter::new(client)),
            events,
            ducks,
            tracker,
            config,
            shutdown,
        )
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn TriggerKubeClient>,
        resources: Arc<dyn ResourceGetter>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self::new(
            kube,
            resources,
            events,
            Arc::new(DuckRegistry::with_builtin_kinds()),
            Arc::new(Tracker::new()),
            EventingConfig::default(),
            CancellationToken::new(),
        )
    }

    fn pass_guard(&self) -> PassGuard {
        PassGuard::new(self.shutdown.child_token(), self.config.reconcile_timeout)
    }

    fn resolver(&self) -> AddressResolver {
        AddressResolver::new(
            self.resources.clone(),
            self.ducks.clone(),
            self.tracker.clone(),
            self.config.cluster_domain.clone(),
        )
    }

    fn dependencies(&self) -> DependencyTracker {
        DependencyTracker::new(
            self.resources.clone(),
            self.ducks.clone(),
            self.tracker.clone(),
        )
    }

    fn subscriptions(&self) -> SubscriptionReconciler {
        SubscriptionReconciler::new(self.kube.clone(), self.events.clone())
    }
}

/// Tracker key for a trigger
pub fn trigger_key(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey::new(&Trigger::api_version(&()), Trigger::kind(&()), namespace, name)
}

/// Tracker key for a broker
pub fn broker_key(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey::new(&Broker::api_version(&()), Broker::kind(&()), namespace, name)
}

// =============================================================================
// Observations and status derivation
// =============================================================================

/// Outcome of resolving the subscriber this pass
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberObservation {
    /// The subscriber's absolute URI
    Resolved(String),
    /// Why it could not be resolved
    Failed(ConditionUpdate),
}

/// Everything one pass learned about the world
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerObservations {
    /// BrokerReady
    pub broker: ConditionUpdate,
    /// DependencyReady; `None` when the pass stopped before checking
    pub dependency: Option<ConditionUpdate>,
    /// SubscriberResolved and the subscriber URI
    pub subscriber: Option<SubscriberObservation>,
    /// Subscribed
    pub subscription: Option<ConditionUpdate>,
}

impl TriggerObservations {
    fn broker_only(broker: ConditionUpdate) -> Self {
        Self {
            broker,
            dependency: None,
            subscriber: None,
            subscription: None,
        }
    }
}

/// Derive the next trigger status from the previous one and this pass's observations.
///
/// Conditions the pass did not observe keep their previous values.
pub fn derive_status(
    previous: Option<&TriggerStatus>,
    generation: Option<i64>,
    obs: &TriggerObservations,
) -> TriggerStatus {
    let mut status = previous.cloned().unwrap_or_default();
    status.observed_generation = generation;
    TRIGGER_CONDITIONS.initialize(&mut status.conditions);

    TRIGGER_CONDITIONS.apply(&mut status.conditions, BROKER_READY, &obs.broker);
    if let Some(dependency) = &obs.dependency {
        TRIGGER_CONDITIONS.apply(&mut status.conditions, DEPENDENCY_READY, dependency);
    }
    match &obs.subscriber {
        Some(SubscriberObservation::Resolved(uri)) => {
            status.subscriber_uri = Some(uri.clone());
            TRIGGER_CONDITIONS.mark_true(&mut status.conditions, SUBSCRIBER_RESOLVED);
        }
        Some(SubscriberObservation::Failed(condition)) => {
            status.subscriber_uri = None;
            TRIGGER_CONDITIONS.apply(&mut status.conditions, SUBSCRIBER_RESOLVED, condition);
        }
        None => {}
    }
    if let Some(subscription) = &obs.subscription {
        TRIGGER_CONDITIONS.apply(&mut status.conditions, SUBSCRIBED, subscription);
    }

    status
}

/// BrokerReady for an existing broker
fn broker_condition(broker: &Broker) -> ConditionUpdate {
    match broker.ready_condition() {
        Some(ready) if ready.status == ConditionStatus::True => ConditionUpdate::ready(),
        Some(ready) => ConditionUpdate::mirror(ready),
        None => ConditionUpdate::unknown("BrokerNotReconciled", "Broker has not yet been reconciled."),
    }
}

// =============================================================================
// Trigger reconciliation
// =============================================================================

/// Reconcile a Trigger resource
///
/// Checks the broker, dependency and subscriber, converges the subscription
/// and writes the derived status when it differs from what is stored.
#[instrument(skip(trigger, ctx), fields(trigger = %trigger.name_any()))]
pub async fn reconcile(trigger: Arc<Trigger>, ctx: Arc<TriggerContext>) -> Result<Action, Error> {
    let guard = ctx.pass_guard();
    let name = trigger.name_any();
    let namespace = trigger
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "Trigger is missing namespace"))?;
    info!(broker = %trigger.spec.broker, "reconciling trigger");

    let key = trigger_key(&namespace, &name);
    // References are re-recorded from scratch every pass
    ctx.tracker.forget(&key);

    let (obs, pass_error) = observe(&trigger, &namespace, &key, &ctx, &guard).await?;

    if trigger.is_deleting() {
        debug!("trigger is being deleted, dropping tracked references");
        ctx.tracker.forget(&key);
    }

    let status = derive_status(trigger.status.as_ref(), trigger.meta().generation, &obs);

    if trigger.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
    } else {
        write_status(&trigger, &namespace, &status, &ctx, &guard).await?;
        if pass_error.is_none() {
            ctx.events
                .publish(
                    &trigger.object_ref(&()),
                    EventType::Normal,
                    reasons::TRIGGER_RECONCILED,
                    actions::RECONCILE,
                    Some("Trigger reconciled".to_string()),
                )
                .await;
        }
    }

    if let Some(e) = pass_error {
        warn!(error = %e, "trigger reconcile failed");
        ctx.events
            .publish(
                &trigger.object_ref(&()),
                EventType::Warning,
                reasons::TRIGGER_RECONCILE_FAILED,
                actions::RECONCILE,
                Some(format!("Trigger reconcile failed: {}", e)),
            )
            .await;
        return Err(e);
    }

    if TRIGGER_CONDITIONS.is_ready(&status.conditions) {
        Ok(Action::requeue(READY_REQUEUE))
    } else {
        Ok(Action::requeue(NOT_READY_REQUEUE))
    }
}

/// Error policy for the trigger controller
///
/// - Ownership conflicts: requeue after 5 minutes (someone else's object may go away)
/// - Retryable errors (transient): requeue after 30 seconds
/// - Non-retryable errors (spec problems): await spec change
pub fn error_policy(trigger: Arc<Trigger>, error: &Error, _ctx: Arc<TriggerContext>) -> Action {
    error!(
        ?error,
        trigger = %trigger.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_ownership_conflict() {
        Action::requeue(OWNERSHIP_REQUEUE)
    } else if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

/// Gather this pass's observations.
///
/// Returns the first error the pass should end with alongside the
/// observations. Cancellation aborts without observations.
async fn observe(
    trigger: &Trigger,
    namespace: &str,
    key: &ObjectKey,
    ctx: &TriggerContext,
    guard: &PassGuard,
) -> Result<(TriggerObservations, Option<Error>), Error> {
    let broker_name = &trigger.spec.broker;
    ctx.tracker.track(broker_key(namespace, broker_name), key);

    guard.check("get broker")?;
    let broker = match ctx.kube.get_broker(broker_name, namespace).await {
        Ok(Some(broker)) if !broker.is_deleting() => broker,
        Ok(_) => {
            debug!(broker = %broker_name, "broker does not exist");
            let condition = ConditionUpdate::failed(
                "BrokerDoesNotExist",
                format!("Broker \"{}\" does not exist", broker_name),
            );
            return Ok((TriggerObservations::broker_only(condition), None));
        }
        Err(e @ Error::Cancelled { .. }) => return Err(e),
        Err(e) => {
            warn!(broker = %broker_name, error = %e, "failed to get broker");
            let condition = ConditionUpdate::unknown("BrokerUnavailable", e.to_string());
            return Ok((TriggerObservations::broker_only(condition), Some(e)));
        }
    };

    let mut pass_error = None;
    let mut record = |observation: Observation| {
        if let Some(e) = observation.error {
            pass_error.get_or_insert(e);
        }
        observation.condition
    };

    let broker_ready = broker_condition(&broker);
    let dependency = record(
        ctx.dependencies()
            .check(trigger, namespace, key, guard)
            .await?,
    );

    let resolved = ctx
        .resolver()
        .resolve(&trigger.spec.subscriber, namespace, key, guard)
        .await;
    let (subscriber, subscription) = match resolved {
        Ok(uri) => {
            let subscription = if trigger.is_deleting() {
                ctx.subscriptions().observe(trigger, guard).await?
            } else {
                ctx.subscriptions()
                    .reconcile(trigger, &broker, &uri, guard)
                    .await?
            };
            (
                SubscriberObservation::Resolved(uri),
                Some(record(subscription)),
            )
        }
        Err(e) if e.is_cancelled() => return Err(e.into_error()),
        Err(e) => {
            warn!(error = %e, "failed to resolve subscriber");
            let condition = e.condition();
            record(Observation::failed(condition.clone(), e.into_error()));
            (SubscriberObservation::Failed(condition), None)
        }
    };

    Ok((
        TriggerObservations {
            broker: broker_ready,
            dependency: Some(dependency),
            subscriber: Some(subscriber),
            subscription,
        },
        pass_error,
    ))
}

async fn write_status(
    trigger: &Trigger,
    namespace: &str,
    status: &TriggerStatus,
    ctx: &TriggerContext,
    guard: &PassGuard,
) -> Result<(), Error> {
    guard.check("update trigger status")?;
    let name = trigger.name_any();
    if let Err(e) = ctx
        .kube
        .update_trigger_status(
            &name,
            namespace,
            &trigger.resource_version().unwrap_or_default(),
            status,
        )
        .await
    {
        warn!(error = %e, "failed to update trigger status");
        ctx.events
            .publish(
                &trigger.object_ref(&()),
                EventType::Warning,
                reasons::TRIGGER_UPDATE_STATUS_FAILED,
                actions::UPDATE,
                Some(format!("Failed to update Trigger's status: {}", e)),
            )
            .await;
        return Err(e);
    }
    Ok(())
}
