use clap::Parser;
use pageprobe::{
    broker::ConnectionBroker,
    config::read_config_file,
    roles::NodeRoleRegistry,
    spawn_shutdown_listener, storage,
    util::node_id,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("pageprobe", LevelFilter::DEBUG),
        ("server", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let store = storage::open(&config.storage).await?;
    let health = store.health_check().await?;
    if !health.healthy {
        anyhow::bail!("store is not usable: {}", health.message);
    }
    info!("store ready: {}", health.message);

    let registry = NodeRoleRegistry::new(store.clone(), node_id());
    registry.claim_server().await?;

    let broker = ConnectionBroker::bind(&config.server, store.clone()).await?;

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    broker.run(cancel).await;

    if let Err(e) = registry.release().await {
        error!("failed to release server role: {e}");
    }
    store.close().await?;
    info!("server stopped");

    Ok(())
}
