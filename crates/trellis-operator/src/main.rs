//! Trellis Operator - Broker and Trigger reconciliation for the eventing control plane

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Api, Client, CustomResourceExt};

use trellis_common::config::{
    detect_cluster_domain, DEFAULT_CLUSTER_DOMAIN, DEFAULT_FILTER_SERVICE,
    DEFAULT_INGRESS_SERVICE, DEFAULT_SYSTEM_NAMESPACE,
};
use trellis_common::crd::{Broker, Subscription, Trigger};
use trellis_common::duck::DuckRegistry;
use trellis_common::telemetry::{init_telemetry, TelemetryConfig};
use trellis_common::{EventingConfig, Tracker, FIELD_MANAGER};
use trellis_operator::controller_runner::{
    build_broker_controllers, build_trigger_controllers, shutdown_token, WatchedKind,
};

/// Where pods find their DNS search path
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Trellis - multi-tenant event broker control plane
#[derive(Parser, Debug)]
#[command(name = "trellis-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace of the shared filter and ingress services
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    system_namespace: String,

    /// Cluster DNS domain; detected from /etc/resolv.conf when unset
    #[arg(long, env = "CLUSTER_DOMAIN")]
    cluster_domain: Option<String>,

    /// Name of the broker filter service
    #[arg(long, env = "FILTER_SERVICE", default_value = DEFAULT_FILTER_SERVICE)]
    filter_service: String,

    /// Name of the broker ingress service
    #[arg(long, env = "INGRESS_SERVICE", default_value = DEFAULT_INGRESS_SERVICE)]
    ingress_service: String,

    /// Upper bound on one reconciliation pass, in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 30)]
    reconcile_timeout_secs: u64,

    /// Kinds whose changes re-queue the triggers referencing them, as <apiVersion>/<Kind>
    #[arg(
        long = "watch-kind",
        env = "WATCH_KINDS",
        value_delimiter = ',',
        default_value = "v1/Service"
    )]
    watch_kinds: Vec<WatchedKind>,

    /// Emit human-readable logs instead of JSON
    #[arg(long)]
    text_logs: bool,
}

impl Cli {
    /// Build the controllers' configuration, detecting the cluster domain if needed
    fn eventing_config(&self, resolv_conf: &Path) -> EventingConfig {
        let cluster_domain = self
            .cluster_domain
            .clone()
            .or_else(|| detect_cluster_domain(resolv_conf))
            .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string());
        EventingConfig {
            system_namespace: self.system_namespace.clone(),
            cluster_domain,
            filter_service: self.filter_service.clone(),
            ingress_service: self.ingress_service.clone(),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs every TLS connection to the API server
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The operator cannot reach the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in [Broker::crd(), Trigger::crd(), Subscription::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "trellis-operator".to_string(),
        json: !cli.text_logs,
    })?;

    run_controllers(cli.eventing_config(Path::new(RESOLV_CONF)), &cli.watch_kinds).await
}

/// Ensure all Trellis CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Broker::crd(), Trigger::crd(), Subscription::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All Trellis CRDs installed/updated");
    Ok(())
}

async fn run_controllers(config: EventingConfig, watch_kinds: &[WatchedKind]) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    tracing::info!(
        system_namespace = %config.system_namespace,
        cluster_domain = %config.cluster_domain,
        timeout_secs = config.reconcile_timeout.as_secs(),
        "Starting Trellis controllers"
    );

    let ducks = Arc::new(DuckRegistry::with_builtin_kinds());
    let tracker = Arc::new(Tracker::new());
    let shutdown = shutdown_token();

    let mut controllers = build_broker_controllers(
        client.clone(),
        ducks.clone(),
        config.clone(),
        shutdown.clone(),
    );
    controllers.extend(build_trigger_controllers(
        client,
        ducks,
        tracker,
        config,
        watch_kinds,
        shutdown,
    ));

    futures::future::join_all(controllers).await;
    tracing::info!("Trellis controllers stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_system_install() {
        let cli = Cli::parse_from(["trellis-operator"]);
        let config = cli.eventing_config(Path::new("/nonexistent/resolv.conf"));
        assert_eq!(config, EventingConfig::default());
        assert!(!cli.crd);
        assert_eq!(
            cli.watch_kinds,
            vec![WatchedKind {
                api_version: "v1".to_string(),
                kind: "Service".to_string(),
            }]
        );
    }

    #[test]
    fn watch_kinds_accept_a_comma_separated_list() {
        let cli = Cli::parse_from([
            "trellis-operator",
            "--watch-kind",
            "v1/Service,sources.trellis.dev/v1/PingSource",
        ]);
        let kinds: Vec<String> = cli.watch_kinds.iter().map(ToString::to_string).collect();
        assert_eq!(kinds, vec!["v1/Service", "sources.trellis.dev/v1/PingSource"]);

        assert!(Cli::try_parse_from(["trellis-operator", "--watch-kind", "Service"]).is_err());
    }

    #[test]
    fn explicit_flags_override_defaults() {
        let cli = Cli::parse_from([
            "trellis-operator",
            "--system-namespace",
            "eventing",
            "--cluster-domain",
            "corp.internal",
            "--reconcile-timeout-secs",
            "5",
        ]);
        let config = cli.eventing_config(Path::new("/nonexistent/resolv.conf"));
        assert_eq!(config.system_namespace, "eventing");
        assert_eq!(config.cluster_domain, "corp.internal");
        assert_eq!(config.reconcile_timeout, Duration::from_secs(5));
        assert_eq!(
            config.broker_address("tenant-a", "default"),
            "http://broker-ingress.eventing.svc.corp.internal/tenant-a/default"
        );
    }
}
