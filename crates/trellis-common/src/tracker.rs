//! Reference tracker
//!
//! Records which objects a reconciled object looked at during its last pass
//! (its broker, subscriber reference, dependency). When a referenced object
//! changes, the controller runner asks the tracker which dependents to
//! re-queue. The tracker lives as long as the controller and is shared by
//! `Arc`; entries are replaced wholesale on every pass and dropped when the
//! dependent goes away.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::trace;

use crate::kube_utils::parse_api_version;

/// Identity of a tracked object: group, kind, namespace and name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// API group ("" for the core group)
    pub group: String,
    /// Kind
    pub kind: String,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Build a key from an apiVersion (the version is not part of identity)
    pub fn new(
        api_version: &str,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let (group, _) = parse_api_version(api_version);
        Self {
            group,
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
        } else {
            write!(
                f,
                "{}.{}:{}/{}",
                self.kind, self.group, self.namespace, self.name
            )
        }
    }
}

/// Concurrent reference -> dependents index
#[derive(Default)]
pub struct Tracker {
    /// referenced object -> objects that looked at it
    dependents: DashMap<ObjectKey, HashSet<ObjectKey>>,
    /// dependent -> objects it looked at (for cleanup)
    references: DashMap<ObjectKey, HashSet<ObjectKey>>,
}

impl Tracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` read `reference`. Returns the reference key.
    pub fn track(&self, reference: ObjectKey, dependent: &ObjectKey) -> ObjectKey {
        trace!(reference = %reference, dependent = %dependent, "tracking reference");
        self.dependents
            .entry(reference.clone())
            .or_default()
            .insert(dependent.clone());
        self.references
            .entry(dependent.clone())
            .or_default()
            .insert(reference.clone());
        reference
    }

    /// Dependents that read `reference` during their last pass
    pub fn dependents(&self, reference: &ObjectKey) -> Vec<ObjectKey> {
        let mut out: Vec<ObjectKey> = self
            .dependents
            .get(reference)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        out
    }

    /// Drop everything `dependent` tracked, e.g. before a fresh pass or after deletion
    pub fn forget(&self, dependent: &ObjectKey) {
        let Some((_, refs)) = self.references.remove(dependent) else {
            return;
        };
        for reference in refs {
            let now_empty = match self.dependents.get_mut(&reference) {
                Some(mut set) => {
                    set.remove(dependent);
                    set.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.dependents.remove_if(&reference, |_, set| set.is_empty());
            }
        }
    }

    /// Number of referenced objects currently tracked
    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }
}
