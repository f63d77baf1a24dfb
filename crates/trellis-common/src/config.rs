//! Eventing control-plane configuration
//!
//! Values shared by the broker and trigger controllers. The operator binary
//! fills this from its command line and environment.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

/// Default namespace of the shared filter/ingress services
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "trellis-eventing";
/// Default cluster DNS domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
/// Default name of the broker filter service
pub const DEFAULT_FILTER_SERVICE: &str = "broker-filter";
/// Default name of the broker ingress service
pub const DEFAULT_INGRESS_SERVICE: &str = "broker-ingress";
/// Default per-pass reconcile timeout
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared configuration for the eventing controllers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventingConfig {
    /// Namespace the filter and ingress services run in
    pub system_namespace: String,
    /// Cluster DNS domain used for service addresses
    pub cluster_domain: String,
    /// Name of the filter service
    pub filter_service: String,
    /// Name of the ingress service
    pub ingress_service: String,
    /// Upper bound on a single reconciliation pass
    pub reconcile_timeout: Duration,
}

impl Default for EventingConfig {
    fn default() -> Self {
        Self {
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            filter_service: DEFAULT_FILTER_SERVICE.to_string(),
            ingress_service: DEFAULT_INGRESS_SERVICE.to_string(),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }
}

impl EventingConfig {
    /// Public address of a broker's ingress
    ///
    /// `http://<ingress>.<system-namespace>.svc.<cluster-domain>/<namespace>/<broker>`
    pub fn broker_address(&self, namespace: &str, broker: &str) -> String {
        format!(
            "http://{}.{}.svc.{}/{}/{}",
            self.ingress_service, self.system_namespace, self.cluster_domain, namespace, broker
        )
    }
}

/// Detect the cluster domain from a resolv.conf file.
///
/// Pods get a search path like `ns.svc.cluster.local svc.cluster.local
/// cluster.local`; the domain is whatever follows the first `svc.` entry.
pub fn detect_cluster_domain(resolv_conf: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(resolv_conf).ok()?;
    let domain = cluster_domain_from_resolv_conf(&contents);
    debug!(path = %resolv_conf.display(), ?domain, "cluster domain detection");
    domain
}

fn cluster_domain_from_resolv_conf(contents: &str) -> Option<String> {
    contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("search"))
        .flat_map(str::split_whitespace)
        .find_map(|entry| {
            entry
                .split_once("svc.")
                .map(|(_, domain)| domain.trim_end_matches('.'))
                .filter(|domain| !domain.is_empty())
                .map(str::to_string)
        })
}
