// ABOUTME: Entry point for the keelson management node binary.
// ABOUTME: Loads configuration, wires the persisters, rebind manager, and HA manager, then runs until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use keelson_core::{HighAvailabilityMode, MementoKind};
use keelson_ha::{HaConfig, HighAvailabilityManager, PromotionListener, Rebinder};
use keelson_rebind::{ManagedGraph, RebindFailureMode, RebindManager, TypeRegistry};
use keelson_store::{
    FileObjectStore, MementoPersister, ObjectStore, PersistMode, StoreMementoPersister,
    StoreSyncRecordPersister, SyncRecordPersister,
};

const SHUTDOWN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Command line flags. Each one overrides its KEELSON_* environment variable.
#[derive(Parser, Debug)]
#[command(name = "keelson", version, about)]
struct Cli {
    /// Persistence directory shared by the management plane
    #[arg(long)]
    home: Option<PathBuf>,

    /// This node's id
    #[arg(long)]
    node_id: Option<String>,

    /// auto, master, standby, hot-standby, or disabled
    #[arg(long)]
    ha_mode: Option<HighAvailabilityMode>,

    /// fail-fast, continue, or fail-at-end
    #[arg(long)]
    rebind_failure_mode: Option<RebindFailureMode>,

    /// How existing persisted state is treated: auto, rebind, or clean
    #[arg(long, default_value = "auto")]
    persist_mode: PersistMode,

    /// Address other nodes can reach this node on
    #[arg(long)]
    uri: Option<String>,

    /// Entity types to restore as plain objects
    #[arg(long = "entity-type", default_value = "basic")]
    entity_types: Vec<String>,

    /// Location types to restore as plain objects
    #[arg(long = "location-type", default_value = "basic")]
    location_types: Vec<String>,

    /// Policy types to restore as plain objects
    #[arg(long = "policy-type", default_value = "basic")]
    policy_types: Vec<String>,
}

struct LogPromotion {
    node_id: String,
}

impl PromotionListener for LogPromotion {
    fn promoting_to_master(&self) {
        tracing::info!(node_id = %self.node_id, "this node is now the management plane master");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keelson=debug")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = HaConfig::from_env().context("loading configuration")?;
    if let Some(home) = cli.home {
        config.home = home;
    }
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(mode) = cli.ha_mode {
        config.mode = mode;
    }
    if let Some(failure_mode) = cli.rebind_failure_mode {
        config.failure_mode = failure_mode;
    }

    tracing::info!(
        node_id = %config.node_id,
        home = %config.home.display(),
        mode = %config.mode,
        "keelson starting up"
    );

    let mut registry = TypeRegistry::new();
    for (kind, types) in [
        (MementoKind::Entity, &cli.entity_types),
        (MementoKind::Location, &cli.location_types),
        (MementoKind::Policy, &cli.policy_types),
    ] {
        for object_type in types {
            registry
                .register_basic(kind, object_type)
                .with_context(|| format!("registering {kind} type {object_type}"))?;
        }
    }

    // Separate store handles: stopping one persister closes its store
    let memento_store = FileObjectStore::new(&config.home);
    memento_store
        .prepare_for_use(cli.persist_mode)
        .context("preparing memento store")?;
    let sync_store = FileObjectStore::new(&config.home);
    sync_store
        .prepare_for_use(PersistMode::Auto)
        .context("preparing sync record store")?;

    let memento_persister: Arc<dyn MementoPersister> =
        Arc::new(StoreMementoPersister::new(Arc::new(memento_store)));
    let sync_persister: Arc<dyn SyncRecordPersister> =
        Arc::new(StoreSyncRecordPersister::new(Arc::new(sync_store)));

    let rebind = Arc::new(
        RebindManager::new(
            Arc::clone(&memento_persister),
            Arc::new(registry),
            Arc::new(ManagedGraph::new()),
        )
        .with_failure_mode(config.failure_mode)
        .with_persist_period(config.persist_period),
    );

    let mut ha = HighAvailabilityManager::new(config.node_id.clone(), Arc::clone(&sync_persister))
        .with_poll_period(config.poll_period)
        .with_heartbeat_timeout(config.heartbeat_timeout)
        .with_rebinder(Arc::clone(&rebind) as Arc<dyn Rebinder>)
        .with_promotion_listener(Arc::new(LogPromotion {
            node_id: config.node_id.clone(),
        }));
    if let Some(uri) = cli.uri {
        ha = ha.with_uri(uri);
    }
    let ha = Arc::new(ha);

    ha.start(config.mode)
        .await
        .context("starting high availability")?;
    tracing::info!(node_id = %config.node_id, state = %ha.node_state(), "node running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");

    if let Err(e) = rebind.flush_now().await {
        tracing::warn!(error = %e, "final delta flush failed");
    }
    ha.stop().await;
    for (name, result) in [
        (
            "memento",
            memento_persister
                .wait_for_writes_completed(SHUTDOWN_WRITE_TIMEOUT)
                .await,
        ),
        (
            "sync record",
            sync_persister
                .wait_for_writes_completed(SHUTDOWN_WRITE_TIMEOUT)
                .await,
        ),
    ] {
        if let Err(e) = result {
            tracing::warn!(persister = name, error = %e, "writes did not complete before shutdown");
        }
    }
    memento_persister.stop().await;
    sync_persister.stop().await;

    Ok(())
}
