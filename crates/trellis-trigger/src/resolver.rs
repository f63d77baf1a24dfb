//! Subscriber address resolution
//!
//! A trigger's subscriber is a literal URI, a reference to an addressable
//! object, or a reference plus a URI relative to that object's address.
//! References may point at any kind; the object's address is read through the
//! capability registered for its group/kind.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[cfg(test)]
use mockall::automock;

use trellis_common::conditions::ConditionUpdate;
use trellis_common::crd::{Destination, KReference};
use trellis_common::duck::{DuckRegistry, GroupKind};
use trellis_common::kube_utils::{build_api_resource, not_found_message};
use trellis_common::{Error, ObjectKey, PassGuard, Tracker};

/// Condition reason used whenever the subscriber cannot be resolved
pub const SUBSCRIBER_UNRESOLVED: &str = "Unable to get the Subscriber's URI";

/// Read objects of kinds only known at runtime
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceGetter: Send + Sync {
    /// Get the referenced object; the reference's own namespace wins over `namespace`
    async fn get_resource(
        &self,
        reference: &KReference,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error>;
}

/// Real getter over the dynamic API
pub struct KubeResourceGetter {
    client: Client,
}

impl KubeResourceGetter {
    /// Create a new getter wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceGetter for KubeResourceGetter {
    async fn get_resource(
        &self,
        reference: &KReference,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let ar = build_api_resource(&reference.api_version, &reference.kind);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), reference.namespace_or(namespace), &ar);
        match api.get(&reference.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Why a destination could not be resolved
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The referenced object does not exist
    #[error("{message}")]
    NotFound {
        /// API-server style not-found message
        message: String,
    },

    /// The referenced object has not published an address yet
    #[error("address not set for {kind} \"{name}\"")]
    NoAddress {
        /// Group-qualified kind of the referent
        kind: String,
        /// Name of the referent
        name: String,
    },

    /// The URI is not usable
    #[error("invalid URI {uri:?}: {message}")]
    InvalidUri {
        /// The offending URI
        uri: String,
        /// Parser message
        message: String,
    },

    /// Neither a URI nor a reference was given
    #[error("destination has neither a ref nor a uri")]
    MissingDestination,

    /// Reading the referent failed
    #[error(transparent)]
    Store(Error),
}

impl ResolveError {
    /// The SubscriberResolved condition describing this failure.
    ///
    /// A referent without an address yet is expected to get one, so it is
    /// Unknown; so is a failed read. Everything else is False.
    pub fn condition(&self) -> ConditionUpdate {
        match self {
            Self::NoAddress { .. } | Self::Store(_) => {
                ConditionUpdate::unknown(SUBSCRIBER_UNRESOLVED, self.to_string())
            }
            _ => ConditionUpdate::failed(SUBSCRIBER_UNRESOLVED, self.to_string()),
        }
    }

    /// The error the pass ends with.
    ///
    /// Bad destinations need a spec edit; a missing or unaddressed referent is
    /// retried.
    pub fn into_error(self) -> Error {
        match self {
            Self::Store(e) => e,
            Self::NotFound { .. } => Error::reference("NotFound", self.to_string()),
            Self::NoAddress { .. } => Error::reference("NoAddress", self.to_string()),
            Self::InvalidUri { .. } | Self::MissingDestination => {
                Error::validation_for_field("trigger", "spec.subscriber", self.to_string())
            }
        }
    }

    /// Whether the pass was cancelled while resolving
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Store(Error::Cancelled { .. }))
    }
}

/// Resolves destinations to absolute URIs and tracks every referent it reads
pub struct AddressResolver {
    getter: Arc<dyn ResourceGetter>,
    ducks: Arc<DuckRegistry>,
    tracker: Arc<Tracker>,
    cluster_domain: String,
}

impl AddressResolver {
    /// Create a resolver
    pub fn new(
        getter: Arc<dyn ResourceGetter>,
        ducks: Arc<DuckRegistry>,
        tracker: Arc<Tracker>,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self {
            getter,
            ducks,
            tracker,
            cluster_domain: cluster_domain.into(),
        }
    }

    /// Resolve `destination` for `dependent`, whose namespace is `namespace`.
    ///
    /// A literal URI is returned exactly as written. A referent is tracked
    /// before it is read so that its creation re-queues the dependent. With a
    /// referent the URI may only be relative to the referent's address.
    pub async fn resolve(
        &self,
        destination: &Destination,
        namespace: &str,
        dependent: &ObjectKey,
        guard: &PassGuard,
    ) -> Result<String, ResolveError> {
        let reference = match (&destination.ref_, &destination.uri) {
            (None, None) => return Err(ResolveError::MissingDestination),
            (None, Some(uri)) => {
                Url::parse(uri).map_err(|e| ResolveError::InvalidUri {
                    uri: uri.clone(),
                    message: e.to_string(),
                })?;
                return Ok(uri.clone());
            }
            (Some(_), Some(uri)) if Url::parse(uri).is_ok() => {
                return Err(ResolveError::InvalidUri {
                    uri: uri.clone(),
                    message: "absolute URI is not allowed when a ref is set".to_string(),
                });
            }
            (Some(reference), _) => reference,
        };

        let ref_namespace = reference.namespace_or(namespace);
        self.tracker.track(
            ObjectKey::new(
                &reference.api_version,
                &reference.kind,
                ref_namespace,
                &reference.name,
            ),
            dependent,
        );

        guard.check("get subscriber").map_err(ResolveError::Store)?;
        let obj = self
            .getter
            .get_resource(reference, namespace)
            .await
            .map_err(ResolveError::Store)?
            .ok_or_else(|| ResolveError::NotFound {
                message: not_found_message(
                    &reference.api_version,
                    &reference.kind,
                    &reference.name,
                ),
            })?;

        let kind = GroupKind::from_api_version(&reference.api_version, &reference.kind);
        let base = self
            .ducks
            .address_capability(&kind)
            .address(&obj, &self.cluster_domain)
            .ok_or_else(|| ResolveError::NoAddress {
                kind: kind.to_string(),
                name: obj.name_any(),
            })?;

        let resolved = match &destination.uri {
            Some(relative) => base.join(relative).map_err(|e| ResolveError::InvalidUri {
                uri: relative.clone(),
                message: e.to_string(),
            })?,
            None => base,
        };
        debug!(subscriber = %resolved, referent = %kind, "resolved destination");
        Ok(resolved.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const NS: &str = "test-namespace";

    fn dependent() -> ObjectKey {
        ObjectKey::new("eventing.trellis.dev/v1", "Trigger", NS, "test-trigger")
    }

    fn guard() -> PassGuard {
        PassGuard::new(CancellationToken::new(), Duration::from_secs(30))
    }

    fn service_ref() -> KReference {
        KReference {
            kind: "Service".to_string(),
            api_version: "v1".to_string(),
            name: "handler".to_string(),
            namespace: None,
        }
    }

    fn object(reference: &KReference, data: serde_json::Value) -> DynamicObject {
        let ar = build_api_resource(&reference.api_version, &reference.kind);
        DynamicObject::new(&reference.name, &ar).within(NS).data(data)
    }

    fn resolver(getter: MockResourceGetter) -> (AddressResolver, Arc<Tracker>) {
        let tracker = Arc::new(Tracker::new());
        let resolver = AddressResolver::new(
            Arc::new(getter),
            Arc::new(DuckRegistry::with_builtin_kinds()),
            tracker.clone(),
            "cluster.local",
        );
        (resolver, tracker)
    }

    #[tokio::test]
    async fn literal_uri_is_returned_unchanged() {
        let mut getter = MockResourceGetter::new();
        getter.expect_get_resource().never();
        let (resolver, tracker) = resolver(getter);

        let uri = resolver
            .resolve(
                &Destination::uri("http://example.com/subscriber"),
                NS,
                &dependent(),
                &guard(),
            )
            .await
            .expect("literal uri should resolve");
        assert_eq!(uri, "http://example.com/subscriber");
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn relative_literal_uri_is_invalid() {
        let (resolver, _) = resolver(MockResourceGetter::new());
        let err = resolver
            .resolve(&Destination::uri("/events"), NS, &dependent(), &guard())
            .await
            .expect_err("relative uri alone should fail");
        assert!(matches!(err, ResolveError::InvalidUri { .. }));
        assert_eq!(err.condition().status, trellis_common::crd::ConditionStatus::False);
        assert!(!err.into_error().is_retryable());
    }

    #[tokio::test]
    async fn empty_destination_is_rejected() {
        let (resolver, _) = resolver(MockResourceGetter::new());
        let err = resolver
            .resolve(&Destination::default(), NS, &dependent(), &guard())
            .await
            .expect_err("empty destination should fail");
        assert!(matches!(err, ResolveError::MissingDestination));
    }

    #[tokio::test]
    async fn absolute_uri_next_to_ref_is_rejected() {
        let mut getter = MockResourceGetter::new();
        getter.expect_get_resource().never();
        let (resolver, tracker) = resolver(getter);

        let destination = Destination {
            ref_: Some(service_ref()),
            uri: Some("http://elsewhere.example.com/events".to_string()),
        };
        let err = resolver
            .resolve(&destination, NS, &dependent(), &guard())
            .await
            .expect_err("absolute uri with a ref should fail");
        assert_eq!(
            err.to_string(),
            "invalid URI \"http://elsewhere.example.com/events\": absolute URI is not allowed when a ref is set"
        );
        assert_eq!(err.condition().status, trellis_common::crd::ConditionStatus::False);
        assert!(tracker.is_empty());
        assert!(!err.into_error().is_retryable());
    }

    /// Story: a Service reference plus a relative path resolves to the service's DNS name
    #[tokio::test]
    async fn story_service_ref_with_relative_uri() {
        let mut getter = MockResourceGetter::new();
        getter
            .expect_get_resource()
            .times(1)
            .withf(|r, ns| r.name == "handler" && ns == NS)
            .returning(|r, _| Ok(Some(object(r, json!({})))));
        let (resolver, tracker) = resolver(getter);

        let destination = Destination {
            ref_: Some(service_ref()),
            uri: Some("/events".to_string()),
        };
        let uri = resolver
            .resolve(&destination, NS, &dependent(), &guard())
            .await
            .expect("service ref should resolve");
        assert_eq!(uri, "http://handler.test-namespace.svc.cluster.local/events");

        let key = ObjectKey::new("v1", "Service", NS, "handler");
        assert_eq!(tracker.dependents(&key), vec![dependent()]);
    }

    #[tokio::test]
    async fn addressable_ref_uses_status_address() {
        let reference = KReference {
            kind: "Service".to_string(),
            api_version: "serving.knative.dev/v1".to_string(),
            name: "ksvc".to_string(),
            namespace: Some("other".to_string()),
        };
        let mut getter = MockResourceGetter::new();
        getter.expect_get_resource().returning(|r, _| {
            Ok(Some(object(
                r,
                json!({"status": {"address": {"url": "http://ksvc.other.example.com"}}}),
            )))
        });
        let (resolver, tracker) = resolver(getter);

        let uri = resolver
            .resolve(&Destination::reference(reference), NS, &dependent(), &guard())
            .await
            .expect("addressable should resolve");
        assert_eq!(uri, "http://ksvc.other.example.com/");

        let key = ObjectKey::new("serving.knative.dev/v1", "Service", "other", "ksvc");
        assert_eq!(tracker.dependents(&key), vec![dependent()]);
    }

    #[tokio::test]
    async fn missing_ref_is_not_found_and_still_tracked() {
        let mut getter = MockResourceGetter::new();
        getter.expect_get_resource().returning(|_, _| Ok(None));
        let (resolver, tracker) = resolver(getter);

        let err = resolver
            .resolve(&Destination::reference(service_ref()), NS, &dependent(), &guard())
            .await
            .expect_err("missing ref should fail");
        assert_eq!(err.to_string(), "services \"handler\" not found");
        let condition = err.condition();
        assert_eq!(condition.reason, SUBSCRIBER_UNRESOLVED);
        assert_eq!(condition.status, trellis_common::crd::ConditionStatus::False);
        assert!(err.into_error().is_retryable());
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn ref_without_address_is_unknown() {
        let reference = KReference {
            kind: "InMemoryChannel".to_string(),
            api_version: "messaging.trellis.dev/v1".to_string(),
            name: "pending".to_string(),
            namespace: None,
        };
        let mut getter = MockResourceGetter::new();
        getter
            .expect_get_resource()
            .returning(|r, _| Ok(Some(object(r, json!({"status": {}})))));
        let (resolver, _) = resolver(getter);

        let err = resolver
            .resolve(&Destination::reference(reference), NS, &dependent(), &guard())
            .await
            .expect_err("unaddressed ref should fail");
        assert!(matches!(err, ResolveError::NoAddress { .. }));
        assert_eq!(
            err.condition().status,
            trellis_common::crd::ConditionStatus::Unknown
        );
    }

    #[tokio::test]
    async fn cancelled_pass_stops_before_lookup() {
        let mut getter = MockResourceGetter::new();
        getter.expect_get_resource().never();
        let (resolver, _) = resolver(getter);

        let token = CancellationToken::new();
        let guard = PassGuard::new(token.clone(), Duration::from_secs(30));
        token.cancel();

        let err = resolver
            .resolve(&Destination::reference(service_ref()), NS, &dependent(), &guard)
            .await
            .expect_err("cancelled pass should fail");
        assert!(err.is_cancelled());
    }
}
