//! Dependency readiness
//!
//! A trigger may name one object whose readiness gates its own, through the
//! `eventing.trellis.dev/dependency` annotation. The object lives in the
//! trigger's namespace and is re-read on every pass.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use trellis_common::conditions::ConditionUpdate;
use trellis_common::crd::{ConditionStatus, KReference, Trigger};
use trellis_common::duck::{DuckRegistry, GroupKind};
use trellis_common::kube_utils::not_found_message;
use trellis_common::{Error, ObjectKey, PassGuard, Tracker};

use crate::resolver::ResourceGetter;
use crate::Observation;

/// Object named by the dependency annotation
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct DependencyReference {
    kind: String,
    name: String,
    api_version: String,
}

impl DependencyReference {
    fn parse(annotation: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(annotation)
    }

    fn as_kreference(&self) -> KReference {
        KReference {
            kind: self.kind.clone(),
            api_version: self.api_version.clone(),
            name: self.name.clone(),
            namespace: None,
        }
    }
}

/// Checks the trigger's dependency annotation
pub struct DependencyTracker {
    getter: Arc<dyn ResourceGetter>,
    ducks: Arc<DuckRegistry>,
    tracker: Arc<Tracker>,
}

impl DependencyTracker {
    /// Create a dependency tracker
    pub fn new(getter: Arc<dyn ResourceGetter>, ducks: Arc<DuckRegistry>, tracker: Arc<Tracker>) -> Self {
        Self {
            getter,
            ducks,
            tracker,
        }
    }

    /// Observe the DependencyReady condition for `trigger`.
    ///
    /// Only cancellation is returned as an error; every other failure is an
    /// observation.
    pub async fn check(
        &self,
        trigger: &Trigger,
        namespace: &str,
        dependent: &ObjectKey,
        guard: &PassGuard,
    ) -> Result<Observation, Error> {
        let Some(annotation) = trigger.dependency_annotation() else {
            return Ok(Observation::ok(ConditionUpdate::ready()));
        };

        let dependency = match DependencyReference::parse(annotation) {
            Ok(dependency) => dependency,
            Err(e) => {
                return Ok(Observation::ok(ConditionUpdate::failed(
                    "ReferenceError",
                    format!(
                        "Unable to unmarshal objectReference from dependency annotation of trigger: {}",
                        e
                    ),
                )))
            }
        };

        self.tracker.track(
            ObjectKey::new(
                &dependency.api_version,
                &dependency.kind,
                namespace,
                &dependency.name,
            ),
            dependent,
        );

        guard.check("get dependency")?;
        let obj = match self
            .getter
            .get_resource(&dependency.as_kreference(), namespace)
            .await
        {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                let not_found =
                    not_found_message(&dependency.api_version, &dependency.kind, &dependency.name);
                let err = Error::reference(
                    "DependencyDoesNotExist",
                    format!(
                        "propagating dependency readiness: getting the dependency: {}",
                        not_found
                    ),
                );
                return Ok(Observation::failed(
                    ConditionUpdate::failed(
                        "DependencyDoesNotExist",
                        format!("Dependency does not exist: {}", not_found),
                    ),
                    err,
                ));
            }
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) => {
                return Ok(Observation::failed(
                    ConditionUpdate::unknown("DependencyUnavailable", e.to_string()),
                    e,
                ))
            }
        };

        let conditions = self
            .ducks
            .condition_capability(&GroupKind::from_api_version(&dependency.api_version, &dependency.kind));

        let generation = conditions.generation(&obj).unwrap_or_default();
        let observed = conditions.observed_generation(&obj).unwrap_or_default();
        if generation != observed {
            debug!(generation, observed, "dependency status is stale");
            return Ok(Observation::ok(ConditionUpdate::unknown(
                "GenerationNotEqual",
                format!(
                    "The dependency's metadata.generation, \"{}\", is not equal to its status.observedGeneration, \"{}\".",
                    generation, observed
                ),
            )));
        }

        let condition = match conditions.ready_condition(&obj) {
            Some(ready) if ready.status == ConditionStatus::True => ConditionUpdate::ready(),
            Some(ready) => ConditionUpdate::mirror(&ready),
            None => ConditionUpdate::unknown("", ""),
        };
        Ok(Observation::ok(condition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::api::DynamicObject;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use trellis_common::crd::{Destination, TriggerSpec, DEPENDENCY_ANNOTATION};
    use trellis_common::kube_utils::build_api_resource;

    use crate::resolver::MockResourceGetter;

    const NS: &str = "test-namespace";
    const ANNOTATION: &str =
        r#"{"kind":"PingSource","name":"test-ping-source","apiVersion":"sources.trellis.dev/v1"}"#;

    fn trigger(annotation: Option<&str>) -> Trigger {
        Trigger {
            metadata: ObjectMeta {
                name: Some("test-trigger".to_string()),
                namespace: Some(NS.to_string()),
                annotations: annotation.map(|a| {
                    [(DEPENDENCY_ANNOTATION.to_string(), a.to_string())]
                        .into_iter()
                        .collect()
                }),
                ..Default::default()
            },
            spec: TriggerSpec {
                broker: "test-broker".to_string(),
                subscriber: Destination::uri("http://example.com/"),
                ..Default::default()
            },
            status: None,
        }
    }

    fn ping_source(generation: i64, status: serde_json::Value) -> DynamicObject {
        let ar = build_api_resource("sources.trellis.dev/v1", "PingSource");
        let mut obj = DynamicObject::new("test-ping-source", &ar)
            .within(NS)
            .data(json!({ "status": status }));
        obj.metadata.generation = Some(generation);
        obj
    }

    fn key() -> ObjectKey {
        ObjectKey::new("eventing.trellis.dev/v1", "Trigger", NS, "test-trigger")
    }

    fn guard() -> PassGuard {
        PassGuard::new(CancellationToken::new(), Duration::from_secs(30))
    }

    fn tracker_for(getter: MockResourceGetter) -> (DependencyTracker, Arc<Tracker>) {
        let tracker = Arc::new(Tracker::new());
        let deps = DependencyTracker::new(
            Arc::new(getter),
            Arc::new(DuckRegistry::new()),
            tracker.clone(),
        );
        (deps, tracker)
    }

    async fn check_with(source: Option<DynamicObject>, annotation: Option<&str>) -> Observation {
        let mut getter = MockResourceGetter::new();
        getter
            .expect_get_resource()
            .returning(move |_, _| Ok(source.clone()));
        let (deps, _) = tracker_for(getter);
        deps.check(&trigger(annotation), NS, &key(), &guard())
            .await
            .expect("check should not be cancelled")
    }

    #[tokio::test]
    async fn no_annotation_is_ready() {
        let obs = check_with(None, None).await;
        assert_eq!(obs.condition, ConditionUpdate::ready());
        assert!(obs.error.is_none());
    }

    #[tokio::test]
    async fn malformed_annotation_is_reference_error() {
        let obs = check_with(None, Some("{not json")).await;
        assert_eq!(obs.condition.status, ConditionStatus::False);
        assert_eq!(obs.condition.reason, "ReferenceError");
        assert!(obs.condition.message.starts_with(
            "Unable to unmarshal objectReference from dependency annotation of trigger: "
        ));
        assert!(obs.error.is_none());
    }

    /// Story: a dependency that does not exist fails the trigger and the pass
    #[tokio::test]
    async fn story_missing_dependency() {
        let obs = check_with(None, Some(ANNOTATION)).await;
        assert_eq!(obs.condition.status, ConditionStatus::False);
        assert_eq!(obs.condition.reason, "DependencyDoesNotExist");
        assert_eq!(
            obs.condition.message,
            "Dependency does not exist: pingsources.sources.trellis.dev \"test-ping-source\" not found"
        );
        let err = obs.error.expect("missing dependency should fail the pass");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "propagating dependency readiness: getting the dependency: pingsources.sources.trellis.dev \"test-ping-source\" not found"
        );
    }

    /// Story: a dependency whose status lags its spec is Unknown
    #[tokio::test]
    async fn story_generation_mismatch() {
        let source = ping_source(
            2,
            json!({"observedGeneration": 1, "conditions": [{"type": "Ready", "status": "True"}]}),
        );
        let obs = check_with(Some(source), Some(ANNOTATION)).await;
        assert_eq!(obs.condition.status, ConditionStatus::Unknown);
        assert_eq!(obs.condition.reason, "GenerationNotEqual");
        assert_eq!(
            obs.condition.message,
            "The dependency's metadata.generation, \"2\", is not equal to its status.observedGeneration, \"1\"."
        );
        assert!(obs.error.is_none());
    }

    #[tokio::test]
    async fn false_dependency_is_propagated_verbatim() {
        let source = ping_source(
            1,
            json!({"observedGeneration": 1, "conditions": [{"type": "Ready", "status": "False", "reason": "NotFound"}]}),
        );
        let obs = check_with(Some(source), Some(ANNOTATION)).await;
        assert_eq!(obs.condition, ConditionUpdate::failed("NotFound", ""));
    }

    #[tokio::test]
    async fn unknown_dependency_is_propagated_verbatim() {
        let source = ping_source(
            1,
            json!({"observedGeneration": 1, "conditions": [{"type": "Ready", "status": "Unknown"}]}),
        );
        let obs = check_with(Some(source), Some(ANNOTATION)).await;
        assert_eq!(obs.condition, ConditionUpdate::unknown("", ""));

        let no_ready = ping_source(1, json!({"observedGeneration": 1}));
        let obs = check_with(Some(no_ready), Some(ANNOTATION)).await;
        assert_eq!(obs.condition, ConditionUpdate::unknown("", ""));
    }

    #[tokio::test]
    async fn ready_dependency_is_ready_and_tracked() {
        let source = ping_source(
            3,
            json!({"observedGeneration": 3, "conditions": [{"type": "Ready", "status": "True"}]}),
        );
        let mut getter = MockResourceGetter::new();
        getter
            .expect_get_resource()
            .withf(|r, ns| r.kind == "PingSource" && r.name == "test-ping-source" && ns == NS)
            .returning(move |_, _| Ok(Some(source.clone())));
        let (deps, tracker) = tracker_for(getter);

        let obs = deps
            .check(&trigger(Some(ANNOTATION)), NS, &key(), &guard())
            .await
            .expect("check should not be cancelled");
        assert_eq!(obs.condition, ConditionUpdate::ready());

        let source_key = ObjectKey::new("sources.trellis.dev/v1", "PingSource", NS, "test-ping-source");
        assert_eq!(tracker.dependents(&source_key), vec![key()]);
    }

    #[tokio::test]
    async fn store_failure_is_unknown_and_fails_pass() {
        let mut getter = MockResourceGetter::new();
        getter
            .expect_get_resource()
            .returning(|_, _| Err(Error::internal("connection refused")));
        let (deps, _) = tracker_for(getter);

        let obs = deps
            .check(&trigger(Some(ANNOTATION)), NS, &key(), &guard())
            .await
            .expect("check should not be cancelled");
        assert_eq!(obs.condition.status, ConditionStatus::Unknown);
        assert_eq!(obs.condition.reason, "DependencyUnavailable");
        assert!(obs.error.is_some());
    }
}
