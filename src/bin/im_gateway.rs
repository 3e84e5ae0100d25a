//! IM Gateway - runs the comet, dispatch, store and push tiers in one process
//! over an in-memory queue and presence store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use im_gateway::auth::StaticTokenValidator;
use im_gateway::comet::Comet;
use im_gateway::config::GatewayConfig;
use im_gateway::dispatch::Dispatcher;
use im_gateway::membership::MemoryMembership;
use im_gateway::monitor::GatewayMonitor;
use im_gateway::presence::MemoryPresence;
use im_gateway::push::{LogNotifier, MemoryInbox, OfflineInbox, PushService};
use im_gateway::queue::{MemoryQueue, QueueTransport};
use im_gateway::store::{FileMessageStore, StoreService};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address the comet listens on
    #[arg(short, long)]
    listen: Option<String>,

    /// Snowflake worker id for the dispatch tier
    #[arg(long)]
    worker_id: Option<i64>,

    /// Directory holding the message log
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Membership seed file ({"groupId": [uid, ...]})
    #[arg(short, long)]
    membership: Option<PathBuf>,

    /// Token accepted by the credential validator
    #[arg(long)]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path).with_context(|| format!("loading config {:?}", path))?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.comet.listen_addr = listen;
    }
    if let Some(worker_id) = args.worker_id {
        config.dispatch.worker_id = worker_id;
    }
    if let Some(dir) = args.data_dir {
        config.store.message_store_url = format!("file://{}", dir.join("messages.log").display());
    }
    if let Some(path) = args.membership {
        config.membership_file = Some(path.display().to_string());
    }
    if let Some(token) = args.auth_token {
        config.auth_token = token;
    }

    info!("Starting IM gateway on {}", config.comet.listen_addr);

    let monitor = Arc::new(GatewayMonitor::new());
    let queue: Arc<dyn QueueTransport> = Arc::new(MemoryQueue::with_capacity(config.comet.queue_capacity));
    let presence = Arc::new(MemoryPresence::new());
    let inbox: Arc<dyn OfflineInbox> = Arc::new(MemoryInbox::new(config.push.inbox_capacity));

    let membership = match &config.membership_file {
        Some(path) => MemoryMembership::load_json(path).with_context(|| format!("loading membership {}", path))?,
        None => MemoryMembership::new(),
    };
    info!("Membership ready with {} groups", membership.group_count());

    // 1. Store
    let store = FileMessageStore::open(config.store.message_store_path())
        .with_context(|| format!("opening message log {}", config.store.message_store_path()))?;
    let store_service = Arc::new(StoreService::new(
        config.store.clone(),
        Arc::new(store),
        Arc::clone(&queue),
        Arc::clone(&monitor),
    ));
    store_service.start().await?;

    // 2. Push
    let push = Arc::new(PushService::new(
        &config.push,
        Arc::clone(&queue),
        presence.clone(),
        Arc::new(LogNotifier),
        Some(Arc::clone(&inbox)),
        Arc::clone(&monitor),
    ));
    push.start().await?;

    // 3. Dispatch
    let dispatcher = Arc::new(Dispatcher::new(
        &config.dispatch,
        Arc::clone(&queue),
        Arc::new(membership),
        Arc::clone(&monitor),
    )?);
    dispatcher.start().await?;

    // 4. Comet
    let comet = Arc::new(Comet::new(
        config.comet.clone(),
        Arc::clone(&queue),
        presence,
        Arc::new(StaticTokenValidator::new(config.auth_token.clone())),
        Some(inbox),
        Arc::clone(&monitor),
    ));
    let listener = comet.bind().await.with_context(|| format!("binding {}", config.comet.listen_addr))?;
    let server = tokio::spawn(Arc::clone(&comet).serve(listener));

    // Handle Shutdown
    let stop = CancellationToken::new();
    let stop_ctrlc = stop.clone();
    ctrlc::set_handler(move || {
        println!("\n[Shutdown] Stop signal received. Draining tiers...");
        stop_ctrlc.cancel();
    })?;
    stop.cancelled().await;

    comet.shutdown().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Comet exited with error: {}", e),
        Err(e) => error!("Comet task failed: {}", e),
    }
    dispatcher.shutdown().await;
    push.shutdown().await;
    store_service.shutdown().await;

    monitor.render_summary();
    Ok(())
}
