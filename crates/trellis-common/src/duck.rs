//! Capability views over arbitrary Kubernetes objects
//!
//! Subscribers and dependencies may be of any kind. Instead of probing
//! unknown objects ad hoc, each kind maps to an explicit capability
//! implementation in a [`DuckRegistry`] that is populated at startup:
//!
//! - [`AddressCapability`]: where does this object accept events?
//! - [`ConditionCapability`]: is this object Ready, and is that observation current?
//!
//! Kinds without a registered address capability get the standard status
//! contract (`status.address.url`). Readiness always follows
//! `status.conditions` and `status.observedGeneration`.

use std::sync::Arc;

use dashmap::DashMap;
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::debug;
use url::Url;

use crate::conditions::READY;
use crate::crd::Condition;
use crate::kube_utils::parse_api_version;

/// API group and kind identifying a capability implementation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKind {
    /// API group ("" for the core group)
    pub group: String,
    /// Kind
    pub kind: String,
}

impl GroupKind {
    /// Build from an apiVersion (version is ignored) and kind
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, _) = parse_api_version(api_version);
        Self {
            group,
            kind: kind.to_string(),
        }
    }
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Read the address an object accepts events on
pub trait AddressCapability: Send + Sync {
    /// The object's address, or `None` if it has not published one yet
    fn address(&self, obj: &DynamicObject, cluster_domain: &str) -> Option<Url>;
}

/// Read readiness from an object
pub trait ConditionCapability: Send + Sync {
    /// The object's Ready condition, if reported
    fn ready_condition(&self, obj: &DynamicObject) -> Option<Condition>;

    /// `metadata.generation`
    fn generation(&self, obj: &DynamicObject) -> Option<i64> {
        obj.metadata.generation
    }

    /// `status.observedGeneration`
    fn observed_generation(&self, obj: &DynamicObject) -> Option<i64>;
}

/// Addressable contract: `status.address.url`, falling back to `status.address.hostname`
pub struct StatusAddress;

impl AddressCapability for StatusAddress {
    fn address(&self, obj: &DynamicObject, _cluster_domain: &str) -> Option<Url> {
        let address = obj.data.get("status")?.get("address")?;
        if let Some(url) = address.get("url").and_then(|u| u.as_str()) {
            return Url::parse(url).ok();
        }
        let hostname = address.get("hostname").and_then(|h| h.as_str())?;
        Url::parse(&format!("http://{}/", hostname)).ok()
    }
}

/// Core `v1/Service`: addressed by its cluster-local DNS name
pub struct ServiceAddress;

impl AddressCapability for ServiceAddress {
    fn address(&self, obj: &DynamicObject, cluster_domain: &str) -> Option<Url> {
        let namespace = obj.namespace()?;
        Url::parse(&format!(
            "http://{}.{}.svc.{}/",
            obj.name_any(),
            namespace,
            cluster_domain
        ))
        .ok()
    }
}

/// Conditions contract: `status.conditions` and `status.observedGeneration`
pub struct StatusConditions;

impl ConditionCapability for StatusConditions {
    fn ready_condition(&self, obj: &DynamicObject) -> Option<Condition> {
        let conditions = obj.data.get("status")?.get("conditions")?.as_array()?;
        conditions
            .iter()
            .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(READY))
            .and_then(|c| serde_json::from_value(c.clone()).ok())
    }

    fn observed_generation(&self, obj: &DynamicObject) -> Option<i64> {
        obj.data
            .get("status")?
            .get("observedGeneration")?
            .as_i64()
    }
}

/// Registry of capability implementations keyed by group/kind
///
/// Readiness is read through the conditions contract for every kind; only
/// addresses vary per kind.
pub struct DuckRegistry {
    addresses: DashMap<GroupKind, Arc<dyn AddressCapability>>,
    default_address: Arc<dyn AddressCapability>,
    conditions: Arc<dyn ConditionCapability>,
}

impl Default for DuckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DuckRegistry {
    /// Empty registry using the status contracts for every kind
    pub fn new() -> Self {
        Self {
            addresses: DashMap::new(),
            default_address: Arc::new(StatusAddress),
            conditions: Arc::new(StatusConditions),
        }
    }

    /// Registry with the built-in kinds registered
    pub fn with_builtin_kinds() -> Self {
        let registry = Self::new();
        registry.register_address(GroupKind::from_api_version("v1", "Service"), Arc::new(ServiceAddress));
        registry
    }

    /// Register an address capability for a kind
    pub fn register_address(&self, kind: GroupKind, capability: Arc<dyn AddressCapability>) {
        debug!(kind = %kind, "registered address capability");
        self.addresses.insert(kind, capability);
    }

    /// Address capability for a kind
    pub fn address_capability(&self, kind: &GroupKind) -> Arc<dyn AddressCapability> {
        self.addresses
            .get(kind)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.default_address.clone())
    }

    /// Condition capability for a kind
    pub fn condition_capability(&self, _kind: &GroupKind) -> Arc<dyn ConditionCapability> {
        self.conditions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ApiResource;
    use serde_json::json;

    fn dynamic(api_version: &str, kind: &str, name: &str, data: serde_json::Value) -> DynamicObject {
        let ar = ApiResource {
            group: parse_api_version(api_version).0,
            version: parse_api_version(api_version).1,
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            plural: format!("{}s", kind.to_lowercase()),
        };
        DynamicObject::new(name, &ar).within("tenant-a").data(data)
    }

    #[test]
    fn status_address_prefers_url() {
        let obj = dynamic(
            "messaging.trellis.dev/v1",
            "InMemoryChannel",
            "ch",
            json!({"status": {"address": {"url": "http://ch.tenant-a.svc.cluster.local/", "hostname": "ignored"}}}),
        );
        let url = StatusAddress.address(&obj, "cluster.local");
        assert_eq!(
            url.map(|u| u.to_string()).as_deref(),
            Some("http://ch.tenant-a.svc.cluster.local/")
        );
    }

    #[test]
    fn status_address_falls_back_to_hostname() {
        let obj = dynamic(
            "messaging.trellis.dev/v1",
            "InMemoryChannel",
            "ch",
            json!({"status": {"address": {"hostname": "ch.tenant-a.svc.cluster.local"}}}),
        );
        let url = StatusAddress.address(&obj, "cluster.local");
        assert_eq!(
            url.map(|u| u.to_string()).as_deref(),
            Some("http://ch.tenant-a.svc.cluster.local/")
        );
    }

    #[test]
    fn status_address_absent_is_none() {
        let obj = dynamic("serving.knative.dev/v1", "Service", "svc", json!({"status": {}}));
        assert!(StatusAddress.address(&obj, "cluster.local").is_none());
    }

    #[test]
    fn core_service_is_addressed_by_dns_name() {
        let obj = dynamic("v1", "Service", "subscriber-name", json!({}));
        let url = ServiceAddress.address(&obj, "cluster.local");
        assert_eq!(
            url.map(|u| u.to_string()).as_deref(),
            Some("http://subscriber-name.tenant-a.svc.cluster.local/")
        );
    }

    #[test]
    fn status_conditions_reads_ready_and_generations() {
        let mut obj = dynamic(
            "sources.trellis.dev/v1",
            "PingSource",
            "ping",
            json!({"status": {
                "observedGeneration": 2,
                "conditions": [
                    {"type": "Deployed", "status": "True"},
                    {"type": "Ready", "status": "False", "reason": "Broken", "message": "it broke"}
                ]
            }}),
        );
        obj.metadata.generation = Some(3);

        let ready = StatusConditions
            .ready_condition(&obj)
            .expect("ready should be found");
        assert_eq!(ready.reason, "Broken");
        assert_eq!(StatusConditions.generation(&obj), Some(3));
        assert_eq!(StatusConditions.observed_generation(&obj), Some(2));
    }

    /// Story: only registered kinds get special treatment
    #[test]
    fn story_registry_routes_by_group_and_kind() {
        let registry = DuckRegistry::with_builtin_kinds();
        let core_service = dynamic("v1", "Service", "svc", json!({}));
        let serving_service = dynamic("serving.knative.dev/v1", "Service", "svc", json!({}));

        let core = registry.address_capability(&GroupKind::from_api_version("v1", "Service"));
        assert!(core.address(&core_service, "cluster.local").is_some());

        // Same kind in another group uses the status contract and has no address yet
        let serving = registry
            .address_capability(&GroupKind::from_api_version("serving.knative.dev/v1", "Service"));
        assert!(serving.address(&serving_service, "cluster.local").is_none());
    }

    #[test]
    fn group_kind_display() {
        assert_eq!(GroupKind::from_api_version("v1", "Service").to_string(), "Service");
        assert_eq!(
            GroupKind::from_api_version("messaging.trellis.dev/v1", "InMemoryChannel").to_string(),
            "InMemoryChannel.messaging.trellis.dev"
        );
    }
}
