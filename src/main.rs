use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::core::DynamicObject;
use kube::runtime::{controller, watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use united::controller::analysis::PrometheusGate;
use united::controller::clock::SystemClock;
use united::controller::events::KubeEventRecorder;
use united::controller::revision::KubeRevisionStore;
use united::controller::store::KubeUnitedDeploymentStore;
use united::controller::subset::advanced::{advanced_statefulset_resource, AdvancedStatefulSetControl};
use united::controller::subset::statefulset::StatefulSetControl;
use united::controller::subset::SubsetControls;
use united::controller::{error_policy, reconcile, Context};
use united::crd::UnitedDeployment;
use united::server::{
    create_metrics, run_health_server, run_leader_election, shutdown_channel, wait_for_signal,
    LeaderConfig, LeaderState, ReadinessState,
};

const DEFAULT_HEALTH_PORT: u16 = 8080;
const DEFAULT_CONCURRENCY: u16 = 4;

/// Timeout for a single Prometheus query made by the analysis gate
const ANALYSIS_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup settings read from the environment
#[derive(Debug, Clone, PartialEq)]
struct Settings {
    leader_election: bool,
    concurrency: u16,
    prometheus_address: Option<String>,
    advanced_statefulset: bool,
    health_port: u16,
    pod_name: Option<String>,
}

fn flag(value: Option<String>) -> bool {
    value.is_some_and(|v| v == "true" || v == "1")
}

impl Settings {
    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to their defaults
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Settings {
            leader_election: flag(lookup("UNITED_LEADER_ELECTION")),
            concurrency: lookup("UNITED_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_CONCURRENCY),
            prometheus_address: lookup("UNITED_PROMETHEUS_ADDRESS").filter(|v| !v.is_empty()),
            advanced_statefulset: flag(lookup("UNITED_ENABLE_ADVANCED_STATEFULSET")),
            health_port: lookup("UNITED_HEALTH_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HEALTH_PORT),
            pod_name: lookup("POD_NAME").filter(|v| !v.is_empty()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // reqwest and kube both sit on rustls; pick ring before either builds a client
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = Settings::from_env();
    info!(?settings, "Starting UnitedDeployment controller");

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;
    let leader_state = LeaderState::new();

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = settings.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let leader_handle = if settings.leader_election {
        let config = LeaderConfig::from_env();
        info!(holder_id = %config.holder_id, "Leader election enabled");
        let election = run_leader_election(
            client.clone(),
            config,
            leader_state.clone(),
            shutdown_signal.clone(),
        );
        Some(tokio::spawn(election))
    } else {
        info!("Leader election disabled - running as single instance");
        leader_state.set_leader(true);
        None
    };

    let mut subsets =
        SubsetControls::new().with(Arc::new(StatefulSetControl::new(client.clone())));
    if settings.advanced_statefulset {
        subsets = subsets.with(Arc::new(AdvancedStatefulSetControl::new(client.clone())));
    }

    if settings.prometheus_address.is_none() {
        info!("No default Prometheus address - analysis runs only where a spec names one");
    }

    let mut ctx = Context::new(
        Arc::new(KubeUnitedDeploymentStore::new(client.clone())),
        Arc::new(KubeRevisionStore::new(client.clone())),
        subsets,
        Arc::new(PrometheusGate::new(
            settings.prometheus_address.clone(),
            ANALYSIS_QUERY_TIMEOUT,
        )),
        Arc::new(KubeEventRecorder::new(client.clone(), settings.pod_name.clone())),
        Arc::new(SystemClock),
        Some(metrics.clone()),
    );
    if settings.leader_election {
        ctx = ctx.with_leader(leader_state.clone());
    }
    let ctx = Arc::new(ctx);

    let watch_config = watcher::Config::default();
    let mut united_controller = Controller::new(
        Api::<UnitedDeployment>::all(client.clone()),
        watch_config.clone(),
    )
    .owns(Api::<StatefulSet>::all(client.clone()), watch_config.clone());
    if settings.advanced_statefulset {
        let resource = advanced_statefulset_resource();
        united_controller = united_controller.owns_with(
            Api::<DynamicObject>::all_with(client.clone(), &resource),
            resource,
            watch_config,
        );
    }

    // Readiness means "initialized", not "leading"; followers stay ready so
    // they can serve admission requests and take over the lease
    readiness.set_ready();
    info!(
        concurrency = settings.concurrency,
        "Controller ready, starting reconciliation loop"
    );

    let reconciler = united_controller
        .with_config(controller::Config::default().concurrency(settings.concurrency))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            // errors are logged by error_policy
            if let Ok((obj, action)) = res {
                info!(
                    united_deployment = %obj.name,
                    namespace = ?obj.namespace,
                    ?action,
                    "Reconciled"
                );
            }
        });

    tokio::select! {
        _ = reconciler => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Signal handler failed, shutting down"),
            }
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();

    if let Some(handle) = leader_handle {
        // let the election loop release leadership before aborting it
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
    health_handle.abort();

    info!("UnitedDeployment controller shut down");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
