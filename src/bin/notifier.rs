use std::sync::Arc;

use clap::Parser;
use pageprobe::{
    config::read_config_file,
    model::Role,
    notifier::{NotificationEngine, SmtpMailer, SmtpSettings},
    roles::NodeRoleRegistry,
    spawn_shutdown_listener, storage,
    util::node_id,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("pageprobe", LevelFilter::DEBUG),
        ("notifier", LevelFilter::TRACE),
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
    let mailer = Arc::new(SmtpMailer::new(SmtpSettings::from_env()?)?);

    let registry = NodeRoleRegistry::new(store.clone(), node_id());
    registry.assume(Role::Notifier, None).await?;

    let engine = NotificationEngine::new(store.clone(), mailer, &config.notifier);

    if args.once {
        let report = engine.sweep(chrono::Utc::now()).await?;
        info!("sweep finished: {report:?}");
    } else {
        let cancel = CancellationToken::new();
        spawn_shutdown_listener(cancel.clone());
        engine.run(cancel).await;
    }

    registry.release().await?;
    store.close().await?;
    Ok(())
}
