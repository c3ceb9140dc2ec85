//! Lease-based leader election
//!
//! Every replica runs the controller, but only the holder of the
//! `coordination.k8s.io/v1` Lease reconciles. Followers keep polling the
//! lease and take over once the holder stops renewing it.

use crate::server::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a lease stays valid without renewal
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// How often the holder renews (and followers retry)
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_LEASE_NAME: &str = "united-controller-leader";
const DEFAULT_LEASE_NAMESPACE: &str = "united-system";

/// Shared leadership flag read by the reconciler
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    is_leader: Arc<AtomicBool>,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::SeqCst);
    }
}

/// Leader election settings
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Identity written into `holderIdentity`
    pub holder_id: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i32,
    pub renew_interval: Duration,
}

impl LeaderConfig {
    /// Build from the downward API environment
    ///
    /// Identity comes from `POD_NAME`, then `HOSTNAME`, then a random
    /// `united-<uuid>`. The lease lives in `POD_NAMESPACE` (default
    /// `united-system`).
    pub fn from_env() -> Self {
        let holder_id = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("united-{}", uuid::Uuid::new_v4()));
        let lease_namespace = std::env::var("POD_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_LEASE_NAMESPACE.to_string());

        Self {
            holder_id,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace,
            lease_duration_seconds: DEFAULT_LEASE_TTL.as_secs() as i32,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// A lease with missing timing fields counts as expired
pub fn is_lease_expired(
    renew_time: Option<&MicroTime>,
    lease_duration_seconds: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    match (renew_time, lease_duration_seconds) {
        (Some(renewed), Some(duration)) => {
            now > renewed.0 + chrono::Duration::seconds(i64::from(duration))
        }
        _ => true,
    }
}

/// Outcome of one acquire-or-renew attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Acquired,
    Renewed,
    HeldByOther,
}

fn lease_spec(config: &LeaderConfig, now: DateTime<Utc>, acquired: bool) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(config.holder_id.clone()),
        lease_duration_seconds: Some(config.lease_duration_seconds),
        renew_time: Some(MicroTime(now)),
        acquire_time: acquired.then_some(MicroTime(now)),
        ..Default::default()
    }
}

async fn try_acquire_or_renew(
    api: &Api<Lease>,
    config: &LeaderConfig,
) -> Result<Attempt, kube::Error> {
    let now = Utc::now();

    let Some(mut lease) = api.get_opt(&config.lease_name).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(config.lease_name.clone()),
                namespace: Some(config.lease_namespace.clone()),
                ..Default::default()
            },
            spec: Some(lease_spec(config, now, true)),
        };
        api.create(&PostParams::default(), &lease).await?;
        return Ok(Attempt::Acquired);
    };

    let spec = lease.spec.clone().unwrap_or_default();
    let ours = spec.holder_identity.as_deref() == Some(config.holder_id.as_str());
    let expired = is_lease_expired(spec.renew_time.as_ref(), spec.lease_duration_seconds, now);

    if !ours && !expired {
        return Ok(Attempt::HeldByOther);
    }

    let mut next = lease_spec(config, now, !ours);
    if ours {
        next.acquire_time = spec.acquire_time;
        next.lease_transitions = spec.lease_transitions;
    } else {
        next.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
    }
    lease.spec = Some(next);

    // replace carries resourceVersion, so two followers racing for an
    // expired lease cannot both win
    api.replace(&config.lease_name, &PostParams::default(), &lease)
        .await?;

    Ok(if ours {
        Attempt::Renewed
    } else {
        Attempt::Acquired
    })
}

/// Run the election loop until shutdown
///
/// Any API error drops leadership until the next successful renewal.
pub async fn run_leader_election(
    client: Client,
    config: LeaderConfig,
    state: LeaderState,
    mut shutdown: ShutdownSignal,
) {
    let api: Api<Lease> = Api::namespaced(client, &config.lease_namespace);
    let mut interval = tokio::time::interval(config.renew_interval);

    info!(
        holder_id = %config.holder_id,
        lease = %config.lease_name,
        namespace = %config.lease_namespace,
        "Leader election started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait() => {
                if state.is_leader() {
                    info!(holder_id = %config.holder_id, "Stepping down as leader");
                }
                state.set_leader(false);
                return;
            }
        }

        let was_leader = state.is_leader();
        match try_acquire_or_renew(&api, &config).await {
            Ok(Attempt::Acquired) => {
                info!(holder_id = %config.holder_id, "Acquired leadership");
                state.set_leader(true);
            }
            Ok(Attempt::Renewed) => {
                debug!(holder_id = %config.holder_id, "Renewed lease");
                state.set_leader(true);
            }
            Ok(Attempt::HeldByOther) => {
                if was_leader {
                    warn!(holder_id = %config.holder_id, "Lost leadership");
                }
                state.set_leader(false);
            }
            Err(e) => {
                warn!(error = %e, holder_id = %config.holder_id, "Lease update failed");
                state.set_leader(false);
            }
        }
    }
}
