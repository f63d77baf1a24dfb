//! Broker controller implementation
//!
//! Each pass observes the broker's trigger channel and the shared filter and
//! ingress services, derives the broker status from those observations and
//! writes it only if it changed. The controller also owns the broker
//! finalizer; owned children are left to cascade deletion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use trellis_common::conditions::{
    ConditionUpdate, ADDRESSABLE, BROKER_CONDITIONS, FILTER_READY, INGRESS_READY, TRIGGER_CHANNEL,
};
use trellis_common::crd::{AddressStatus, Broker, BrokerStatus, BROKER_FINALIZER};
use trellis_common::duck::DuckRegistry;
use trellis_common::events::{actions, reasons, EventPublisher};
use trellis_common::kube_utils::namespaced_name;
use trellis_common::{Error, EventingConfig, KubeEventPublisher, PassGuard, FIELD_MANAGER};

use crate::channel::{observe_channel, ChannelObservation, DesiredChannel};

/// Requeue interval once the broker is ready
const READY_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue interval while the broker is waiting on its channel or services
const NOT_READY_REQUEUE: Duration = Duration::from_secs(10);
/// Requeue interval after a trigger channel ownership conflict
const OWNERSHIP_REQUEUE: Duration = Duration::from_secs(300);

/// Message used when a broker has no channel template
const CHANNEL_TEMPLATE_NIL: &str = "Broker.Spec.ChannelTemplate is nil";

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Trait abstracting Kubernetes client operations for the broker controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerKubeClient: Send + Sync {
    /// Replace the broker's finalizers, guarded by resourceVersion.
    ///
    /// Returns the broker's new resourceVersion.
    async fn patch_finalizers(
        &self,
        name: &str,
        namespace: &str,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<String, Error>;

    /// Write broker status, guarded by resourceVersion
    async fn update_broker_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: &str,
        status: &BrokerStatus,
    ) -> Result<(), Error>;

    /// Get a channel of a runtime-known kind
    async fn get_channel(
        &self,
        api_resource: &ApiResource,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Create a channel of a runtime-known kind
    async fn create_channel(
        &self,
        api_resource: &ApiResource,
        channel: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Get the endpoints backing a service
    async fn get_endpoints(&self, name: &str, namespace: &str) -> Result<Option<Endpoints>, Error>;
}

/// Real Kubernetes client implementation
pub struct BrokerKubeClientImpl {
    client: Client,
}

impl BrokerKubeClientImpl {
    /// Create a new BrokerKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BrokerKubeClient for BrokerKubeClientImpl {
    async fn patch_finalizers(
        &self,
        name: &str,
        namespace: &str,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<String, Error> {
        let api: Api<Broker> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": resource_version,
            }
        });
        let updated = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_write(namespaced_name(namespace, name), e))?;
        Ok(updated.resource_version().unwrap_or_default())
    }

    async fn update_broker_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: &str,
        status: &BrokerStatus,
    ) -> Result<(), Error> {
        let api: Api<Broker> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_write(namespaced_name(namespace, name), e))?;
        Ok(())
    }

    async fn get_channel(
        &self,
        api_resource: &ApiResource,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, api_resource);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_channel(
        &self,
        api_resource: &ApiResource,
        channel: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let namespace = channel.namespace().unwrap_or_default();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, api_resource);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, channel).await?)
    }

    async fn get_endpoints(&self, name: &str, namespace: &str) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(ep) => Ok(Some(ep)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context shared across all broker reconciliations
pub struct BrokerContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn BrokerKubeClient>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Capability registry used to read channel addresses
    pub ducks: Arc<DuckRegistry>,
    /// Shared eventing configuration
    pub config: EventingConfig,
    /// Cancelled when the controller shuts down
    pub shutdown: CancellationToken,
}

impl BrokerContext {
    /// Create a new BrokerContext with the given dependencies
    pub fn new(
        kube: Arc<dyn BrokerKubeClient>,
        events: Arc<dyn EventPublisher>,
        ducks: Arc<DuckRegistry>,
        config: EventingConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            kube,
            events,
            ducks,
            config,
            shutdown,
        }
    }

    /// Create a BrokerContext from a Kubernetes client
    pub fn from_client(
        client: Client,
        ducks: Arc<DuckRegistry>,
        config: EventingConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            "trellis-broker-controller",
        ));
        Self::new(
            Arc::new(BrokerKubeClientImpl::new(client)),
            events,
            ducks,
            config,
            shutdown,
        )
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn BrokerKubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self::new(
            kube,
            events,
            Arc::new(DuckRegistry::with_builtin_kinds()),
            EventingConfig::default(),
            CancellationToken::new(),
        )
    }

    fn pass_guard(&self) -> PassGuard {
        PassGuard::new(self.shutdown.child_token(), self.config.reconcile_timeout)
    }
}

// =============================================================================
// Observations and status derivation
// =============================================================================

/// Readiness of a service, judged by its endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointsObservation {
    /// At least one backing address
    Ready,
    /// Missing or empty endpoints
    Unavailable,
    /// Reading the endpoints failed
    Failed(String),
}

impl EndpointsObservation {
    fn from_endpoints(endpoints: Option<&Endpoints>) -> Self {
        let has_address = endpoints
            .and_then(|ep| ep.subsets.as_ref())
            .is_some_and(|subsets| {
                subsets
                    .iter()
                    .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
            });
        if has_address {
            Self::Ready
        } else {
            Self::Unavailable
        }
    }

    fn condition(&self, service: &str) -> ConditionUpdate {
        match self {
            Self::Ready => ConditionUpdate::ready(),
            Self::Unavailable => ConditionUpdate::failed(
                "EndpointsUnavailable",
                format!("Endpoints \"{}\" are unavailable.", service),
            ),
            Self::Failed(message) => ConditionUpdate::failed("ServiceFailure", message.clone()),
        }
    }
}

/// Everything one pass learned about the world
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerObservations {
    /// Trigger channel state
    pub channel: ChannelObservation,
    /// Filter service readiness; `None` when the pass stopped before checking
    pub filter: Option<EndpointsObservation>,
    /// Ingress service readiness; `None` when the pass stopped before checking
    pub ingress: Option<EndpointsObservation>,
    /// Public broker address, computed once the channel is ready
    pub address: Option<String>,
}

/// Derive the next broker status from the previous one and this pass's observations.
///
/// Conditions the pass did not observe keep their previous values.
pub fn derive_status(
    previous: Option<&BrokerStatus>,
    generation: Option<i64>,
    obs: &BrokerObservations,
    config: &EventingConfig,
) -> BrokerStatus {
    let mut status = previous.cloned().unwrap_or_default();
    status.observed_generation = generation;
    BROKER_CONDITIONS.initialize(&mut status.conditions);

    let channel = match &obs.channel {
        ChannelObservation::TemplateMissing => ConditionUpdate::failed(
            "ChannelTemplateFailed",
            format!("Error on setting up the ChannelTemplate: {}", CHANNEL_TEMPLATE_NIL),
        ),
        ChannelObservation::Failed(message) => {
            ConditionUpdate::failed("ChannelFailure", message.clone())
        }
        ChannelObservation::NoAddress => {
            ConditionUpdate::failed("NoAddress", "Channel does not have an address.")
        }
        ChannelObservation::Ready { reference, .. } => {
            status.channel = Some(reference.clone());
            ConditionUpdate::ready()
        }
    };
    BROKER_CONDITIONS.apply(&mut status.conditions, TRIGGER_CHANNEL, &channel);

    if let Some(filter) = &obs.filter {
        BROKER_CONDITIONS.apply(
            &mut status.conditions,
            FILTER_READY,
            &filter.condition(&config.filter_service),
        );
    }
    if let Some(ingress) = &obs.ingress {
        BROKER_CONDITIONS.apply(
            &mut status.conditions,
            INGRESS_READY,
            &ingress.condition(&config.ingress_service),
        );
    }
    if let Some(address) = &obs.address {
        status.address = Some(AddressStatus {
            url: Some(address.clone()),
        });
        BROKER_CONDITIONS.mark_true(&mut status.conditions, ADDRESSABLE);
    }

    status
}

// =============================================================================
// Broker reconciliation
// =============================================================================

/// Reconcile a Broker resource
///
/// Ensures the trigger channel exists, checks the filter and ingress
/// services, and writes the derived status when it differs from what is
/// stored.
#[instrument(skip(broker, ctx), fields(broker = %broker.name_any()))]
pub async fn reconcile(broker: Arc<Broker>, ctx: Arc<BrokerContext>) -> Result<Action, Error> {
    let guard = ctx.pass_guard();
    let name = broker.name_any();
    let namespace = broker
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "Broker is missing namespace"))?;
    info!("reconciling broker");

    if broker.is_deleting() {
        return finalize(&broker, &namespace, &ctx, &guard).await;
    }

    let resource_version = match ensure_finalizer(&broker, &namespace, &ctx, &guard).await? {
        Some(updated) => updated,
        None => broker.resource_version().unwrap_or_default(),
    };

    let (obs, pass_error) = observe(&broker, &namespace, &ctx, &guard).await?;
    let status = derive_status(
        broker.status.as_ref(),
        broker.meta().generation,
        &obs,
        &ctx.config,
    );

    if broker.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
    } else {
        write_status(&broker, &namespace, &resource_version, &status, &ctx, &guard).await?;
        if pass_error.is_none() {
            ctx.events
                .publish(
                    &broker.object_ref(&()),
                    EventType::Normal,
                    reasons::BROKER_RECONCILED,
                    actions::RECONCILE,
                    Some(format!(
                        "Broker reconciled: \"{}\"",
                        namespaced_name(&namespace, &name)
                    )),
                )
                .await;
        }
    }

    if let Some(e) = pass_error {
        return Err(e);
    }

    if BROKER_CONDITIONS.is_ready(&status.conditions) {
        Ok(Action::requeue(READY_REQUEUE))
    } else {
        Ok(Action::requeue(NOT_READY_REQUEUE))
    }
}

/// Error policy for the broker controller
///
/// - Ownership conflicts: requeue after 5 minutes (someone else's channel may go away)
/// - Retryable errors (transient): requeue after 30 seconds
/// - Non-retryable errors (spec problems): await spec change
pub fn error_policy(broker: Arc<Broker>, error: &Error, _ctx: Arc<BrokerContext>) -> Action {
    error!(
        ?error,
        broker = %broker.name_any(),
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
/// Returns the error the pass should end with, if any, alongside the
/// observations so status is still written for failures that are reported
/// through conditions. Cancellation aborts without observations.
async fn observe(
    broker: &Broker,
    namespace: &str,
    ctx: &BrokerContext,
    guard: &PassGuard,
) -> Result<(BrokerObservations, Option<Error>), Error> {
    let stopped = |channel| BrokerObservations {
        channel,
        filter: None,
        ingress: None,
        address: None,
    };

    let Some(template) = broker.spec.channel_template.as_ref() else {
        warn!("broker has no channel template");
        ctx.events
            .publish(
                &broker.object_ref(&()),
                EventType::Warning,
                reasons::INTERNAL_ERROR,
                actions::RECONCILE,
                Some(CHANNEL_TEMPLATE_NIL.to_string()),
            )
            .await;
        let err = Error::validation_for_field(
            namespaced_name(namespace, &broker.name_any()),
            "spec.channelTemplate",
            CHANNEL_TEMPLATE_NIL,
        );
        return Ok((stopped(ChannelObservation::TemplateMissing), Some(err)));
    };

    let channel = match reconcile_channel(broker, template, namespace, ctx, guard).await {
        Ok(obs) => obs,
        Err(e @ Error::Cancelled { .. }) => return Err(e),
        Err(e) => {
            warn!(error = %e, "failed to reconcile trigger channel");
            ctx.events
                .publish(
                    &broker.object_ref(&()),
                    EventType::Warning,
                    reasons::INTERNAL_ERROR,
                    actions::RECONCILE,
                    Some(format!("Failed to reconcile trigger channel: {}", e)),
                )
                .await;
            let obs = stopped(ChannelObservation::Failed(e.to_string()));
            return Ok((obs, Some(e)));
        }
    };

    if !matches!(channel, ChannelObservation::Ready { .. }) {
        debug!(?channel, "trigger channel not ready");
        return Ok((stopped(channel), None));
    }

    let mut pass_error = None;
    let filter = check_endpoints(&ctx.config.filter_service, ctx, guard, &mut pass_error).await?;
    let ingress = check_endpoints(&ctx.config.ingress_service, ctx, guard, &mut pass_error).await?;

    Ok((
        BrokerObservations {
            channel,
            filter: Some(filter),
            ingress: Some(ingress),
            address: Some(ctx.config.broker_address(namespace, &broker.name_any())),
        },
        pass_error,
    ))
}

/// Get or create the trigger channel and read its address.
async fn reconcile_channel(
    broker: &Broker,
    template: &trellis_common::crd::ChannelTemplateSpec,
    namespace: &str,
    ctx: &BrokerContext,
    guard: &PassGuard,
) -> Result<ChannelObservation, Error> {
    let desired = DesiredChannel::for_broker(broker, template)?;
    let name = desired.name();

    guard.check("get trigger channel")?;
    let existing = ctx
        .kube
        .get_channel(&desired.api_resource, &name, namespace)
        .await?;

    let channel = match existing {
        Some(channel) => channel,
        None => {
            guard.check("create trigger channel")?;
            info!(channel = %name, kind = %template.kind, "creating trigger channel");
            ctx.kube
                .create_channel(&desired.api_resource, &desired.object)
                .await?
        }
    };

    observe_channel(
        broker,
        &channel,
        template,
        &ctx.ducks,
        &ctx.config.cluster_domain,
    )
}

/// Check one system service's endpoints.
///
/// Lookup failures are reported through the condition and recorded as the
/// pass error; the other service is still checked.
async fn check_endpoints(
    service: &str,
    ctx: &BrokerContext,
    guard: &PassGuard,
    pass_error: &mut Option<Error>,
) -> Result<EndpointsObservation, Error> {
    guard.check("get endpoints")?;
    match ctx
        .kube
        .get_endpoints(service, &ctx.config.system_namespace)
        .await
    {
        Ok(endpoints) => Ok(EndpointsObservation::from_endpoints(endpoints.as_ref())),
        Err(e) => {
            warn!(service, error = %e, "failed to read service endpoints");
            let obs = EndpointsObservation::Failed(e.to_string());
            pass_error.get_or_insert(e);
            Ok(obs)
        }
    }
}

/// Add the broker finalizer if it is missing.
///
/// Returns the new resourceVersion when the broker was patched.
async fn ensure_finalizer(
    broker: &Broker,
    namespace: &str,
    ctx: &BrokerContext,
    guard: &PassGuard,
) -> Result<Option<String>, Error> {
    if broker.finalizers().iter().any(|f| f == BROKER_FINALIZER) {
        return Ok(None);
    }
    let mut finalizers = broker.finalizers().to_vec();
    finalizers.push(BROKER_FINALIZER.to_string());
    set_finalizers(broker, namespace, finalizers, ctx, guard)
        .await
        .map(Some)
}

/// Remove the broker finalizer so the object can go away.
///
/// Nothing needs cleaning up explicitly: the trigger channel is owned by
/// the broker and is garbage collected with it.
async fn finalize(
    broker: &Broker,
    namespace: &str,
    ctx: &BrokerContext,
    guard: &PassGuard,
) -> Result<Action, Error> {
    if broker.finalizers().iter().any(|f| f == BROKER_FINALIZER) {
        info!("removing broker finalizer");
        let finalizers: Vec<String> = broker
            .finalizers()
            .iter()
            .filter(|f| *f != BROKER_FINALIZER)
            .cloned()
            .collect();
        set_finalizers(broker, namespace, finalizers, ctx, guard).await?;
    }
    Ok(Action::await_change())
}

async fn set_finalizers(
    broker: &Broker,
    namespace: &str,
    finalizers: Vec<String>,
    ctx: &BrokerContext,
    guard: &PassGuard,
) -> Result<String, Error> {
    guard.check("update finalizers")?;
    let name = broker.name_any();
    let resource_version = ctx
        .kube
        .patch_finalizers(
            &name,
            namespace,
            &broker.resource_version().unwrap_or_default(),
            finalizers,
        )
        .await?;
    ctx.events
        .publish(
            &broker.object_ref(&()),
            EventType::Normal,
            reasons::FINALIZER_UPDATE,
            actions::UPDATE,
            Some(format!("Updated \"{}\" finalizers", name)),
        )
        .await;
    Ok(resource_version)
}

async fn write_status(
    broker: &Broker,
    namespace: &str,
    resource_version: &str,
    status: &BrokerStatus,
    ctx: &BrokerContext,
    guard: &PassGuard,
) -> Result<(), Error> {
    guard.check("update broker status")?;
    let name = broker.name_any();
    if let Err(e) = ctx
        .kube
        .update_broker_status(&name, namespace, resource_version, status)
        .await
    {
        warn!(error = %e, "failed to update broker status");
        ctx.events
            .publish(
                &broker.object_ref(&()),
                EventType::Warning,
                reasons::UPDATE_FAILED,
                actions::UPDATE,
                Some(format!("Failed to update status for \"{}\": {}", name, e)),
            )
            .await;
        return Err(e);
    }
    Ok(())
}
