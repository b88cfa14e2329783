use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use addon_manager::{config::OperatorConfig, controller, crd::Addon, Error};
use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// List the Addons in the cluster
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch; empty watches all namespaces
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Seconds an addon may stay uninstalled before it is marked Failed
    #[arg(long, env = "ADDON_INSTALL_TTL_SECS", default_value_t = 3600)]
    install_ttl_secs: u64,

    /// Addons reconciled in parallel
    #[arg(long, env = "ADDON_CONCURRENCY", default_value_t = 5)]
    concurrency: u16,

    /// Address the metrics and health endpoints bind to
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Only run the controller while holding the leader lease
    #[arg(long, env = "ENABLE_LEADER_ELECTION")]
    enable_leader_election: bool,

    /// Debug logging
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to list; empty lists all namespaces
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("addon-manager v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<Addon> = if args.namespace.is_empty() {
        Api::all(client)
    } else {
        Api::namespaced(client, &args.namespace)
    };
    let addons = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Managed Addons: {}", addons.items.len());
    for addon in &addons.items {
        let phase = addon
            .install_phase()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}/{}  {}:{}  {}",
            addon.namespace().unwrap_or_default(),
            addon.name_any(),
            addon.spec.pkg_name,
            addon.spec.pkg_version,
            phase
        );
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    addon_manager::telemetry::init_tracing(args.debug, args.json_logs)?;

    info!("Starting addon-manager v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let config = OperatorConfig::new(
        Some(args.namespace.clone()),
        args.install_ttl_secs,
        args.concurrency,
    );

    #[cfg(feature = "metrics")]
    {
        let addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = addon_manager::rest_api::run_server(addr).await {
                error!("Metrics server error: {:?}", e);
            }
        });
    }
    #[cfg(not(feature = "metrics"))]
    info!(
        "Metrics disabled at build time, ignoring --metrics-addr {}",
        args.metrics_addr
    );

    let is_leader = Arc::new(AtomicBool::new(false));
    if args.enable_leader_election {
        let leader_namespace = std::env::var("POD_NAMESPACE")
            .ok()
            .or_else(|| config.namespace.clone())
            .unwrap_or_else(|| "default".to_string());
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });

        info!(
            "Leader election using holder ID {} in namespace {}",
            holder_identity, leader_namespace
        );

        let lease_client = client.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            run_leader_election(lease_client, &leader_namespace, &holder_identity, is_leader_bg)
                .await;
        });

        wait_for_leadership(&is_leader).await;
    }

    let state = Arc::new(controller::ControllerState::new(client, config));

    let result = if args.enable_leader_election {
        tokio::select! {
            result = controller::run_controller(state) => result,
            _ = leadership_lost(&is_leader) => {
                error!("Lost leadership for lease {}, shutting down", LEASE_NAME);
                Err(Error::ConfigError(format!("lost leadership for lease {}", LEASE_NAME)))
            }
        }
    } else {
        controller::run_controller(state).await
    };

    // Flush any remaining traces
    addon_manager::telemetry::shutdown_telemetry();

    result
}

const LEASE_NAME: &str = "addon-manager-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

async fn wait_for_leadership(is_leader: &AtomicBool) {
    info!("Waiting to acquire lease {}", LEASE_NAME);
    while !is_leader.load(Ordering::Relaxed) {
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

async fn leadership_lost(is_leader: &AtomicBool) {
    loop {
        tokio::time::sleep(RETRY_INTERVAL).await;
        if !is_leader.load(Ordering::Relaxed) {
            return;
        }
    }
}

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    now > renew.0 + chrono::Duration::seconds(i64::from(duration))
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }

            info!("Lease held by {:?} has expired, taking over", current_holder);
            let patch = serde_json::json!({
                "spec": {
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            });
            leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(true)
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}
