use clap::{Parser, Subcommand};
use pageprobe::{
    config::{Config, read_config_file},
    model::{BrowserProfile, Role},
    probe::{self, InstanceLock, LockError, WorkerPool},
    roles::NodeRoleRegistry,
    storage,
    util::node_id,
};
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code when another probe holds the lock
const ALREADY_RUNNING: i32 = 3;

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run one measurement unit on stdin/stdout
    #[command(hide = true)]
    Unit {
        #[arg(long)]
        profile: BrowserProfile,
    },
}

fn init() {
    dotenv::dotenv().ok();

    // stdout of a unit process is its result channel
    let filter = filter::Targets::new().with_targets(vec![
        ("pageprobe", LevelFilter::DEBUG),
        ("probe", LevelFilter::TRACE),
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

    match args.command {
        Some(Command::Unit { profile }) => run_unit(&config, profile).await,
        None => run_probe(&config, &args.file).await,
    }
}

async fn run_unit(config: &Config, profile: BrowserProfile) -> anyhow::Result<()> {
    let unit = probe::browser_unit(&config.probe, profile)?;
    probe::serve_unit(Box::new(unit), tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}

async fn run_probe(config: &Config, config_file: &str) -> anyhow::Result<()> {
    let _lock = match InstanceLock::acquire(&config.probe.lock_file) {
        Ok(lock) => lock,
        Err(LockError::AlreadyRunning { pid }) => {
            eprintln!("probe already running with pid {pid}");
            std::process::exit(ALREADY_RUNNING);
        }
        Err(e) => return Err(e.into()),
    };

    let group_id = group_id(config).await;

    let program = std::env::current_exe()?;
    let pool = WorkerPool::start(probe::process_units(&config.probe, &program, config_file));
    info!("started {} measurement units", pool.len());

    let result = async {
        let session = probe::connect(&config.probe.server, config.probe.handshake_port).await?;
        probe::run_session(session, &pool, group_id).await
    }
    .await;

    pool.shutdown().await;

    let summary = result?;
    info!(
        "session finished after {} URLs ({} samples)",
        summary.assignments, summary.samples
    );
    Ok(())
}

/// Group from the node's client role when a store is reachable, else from config
async fn group_id(config: &Config) -> Option<i64> {
    let store = match storage::open(&config.storage).await {
        Ok(store) => store,
        Err(e) => {
            warn!("store not reachable, using configured group: {e}");
            return config.probe.group_id;
        }
    };

    let registry = NodeRoleRegistry::new(store, node_id());
    match registry.current().await {
        Ok(Some(role)) if role.role == Role::Client && role.group_id.is_some() => role.group_id,
        Ok(_) => config.probe.group_id,
        Err(e) => {
            warn!("cannot read node role: {e}");
            config.probe.group_id
        }
    }
}
