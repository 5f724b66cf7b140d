use std::sync::Arc;

use clap::{Parser, Subcommand};
use pageprobe::{
    config::read_config_file,
    model::{AlertKind, MetricName, NewAlertRule, Role},
    roles::NodeRoleRegistry,
    storage::{self, Store},
    targets,
    util::node_id,
};
use tracing::{level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Follow a URL (adds a follower if it is already tracked)
    Follow {
        url: String,

        /// Keep the URL as given instead of following its redirects
        #[arg(long)]
        no_resolve: bool,
    },

    /// Drop a follower and its alert rules for the URL
    Unfollow {
        #[arg(long)]
        owner: i64,
        url_id: i64,
    },

    /// Take a URL out of dispatch
    Deactivate { url_id: i64 },

    /// Put a deactivated URL back into dispatch
    Activate { url_id: i64 },

    /// List tracked URLs
    Targets,

    #[command(subcommand)]
    Rule(RuleCommand),

    #[command(subcommand)]
    Role(RoleCommand),
}

#[derive(Debug, Clone, Subcommand)]
enum RuleCommand {
    Add {
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        url_id: i64,
        #[arg(long)]
        kind: AlertKind,
        #[arg(long)]
        metric: Option<MetricName>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        destination: String,
    },
    Enable { id: i64 },
    Disable { id: i64 },
    Remove { id: i64 },
    List {
        #[arg(long)]
        owner: Option<i64>,
    },
}

#[derive(Debug, Clone, Subcommand)]
enum RoleCommand {
    /// Register this machine under a role
    Set {
        role: Role,
        #[arg(long)]
        group: Option<i64>,
    },
    Show,
    Release,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("pageprobe", LevelFilter::INFO),
        ("ctl", LevelFilter::DEBUG),
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

    let result = execute(args.command, store.clone()).await;
    store.close().await?;
    result
}

async fn execute(command: Command, store: Arc<dyn Store>) -> anyhow::Result<()> {
    match command {
        Command::Follow { url, no_resolve } => {
            let mut url = targets::normalize(&url)?;
            if !no_resolve {
                url = targets::resolve(&url, targets::RESOLVE_TIMEOUT).await;
            }
            let target = store.follow_url(&url).await?;
            println!(
                "following {} (id {}, {} followers)",
                target.url, target.id, target.reference_count
            );
        }
        Command::Unfollow { owner, url_id } => match store.unfollow_url(owner, url_id).await? {
            Some(target) => println!(
                "unfollowed {} ({} followers left)",
                target.url, target.reference_count
            ),
            None => anyhow::bail!("no target with id {url_id}"),
        },
        Command::Deactivate { url_id } => set_inactive(store.as_ref(), url_id, true).await?,
        Command::Activate { url_id } => set_inactive(store.as_ref(), url_id, false).await?,
        Command::Targets => {
            for target in store.list_targets().await? {
                println!(
                    "{:>4}  {:<5}  followers={:<3} last_checked={}  {}",
                    target.id,
                    if target.is_eligible() { "on" } else { "off" },
                    target.reference_count,
                    target.last_checked.to_rfc3339(),
                    target.url
                );
            }
        }
        Command::Rule(rule) => execute_rule(rule, store.as_ref()).await?,
        Command::Role(role) => execute_role(role, store).await?,
    }
    Ok(())
}

async fn set_inactive(store: &dyn Store, url_id: i64, inactive: bool) -> anyhow::Result<()> {
    if !store.set_force_inactive(url_id, inactive).await? {
        anyhow::bail!("no target with id {url_id}");
    }
    println!(
        "target {url_id} {}",
        if inactive { "deactivated" } else { "activated" }
    );
    Ok(())
}

async fn execute_rule(command: RuleCommand, store: &dyn Store) -> anyhow::Result<()> {
    match command {
        RuleCommand::Add {
            owner,
            url_id,
            kind,
            metric,
            threshold,
            destination,
        } => {
            let rule = store
                .add_rule(NewAlertRule {
                    owner,
                    url_id,
                    metric,
                    kind,
                    threshold,
                    destination,
                })
                .await?;
            println!("created rule {}", rule.id);
        }
        RuleCommand::Enable { id } => toggle_rule(store, id, true).await?,
        RuleCommand::Disable { id } => toggle_rule(store, id, false).await?,
        RuleCommand::Remove { id } => {
            if !store.remove_rule(id).await? {
                anyhow::bail!("no rule with id {id}");
            }
            println!("removed rule {id}");
        }
        RuleCommand::List { owner } => {
            for rule in store.list_rules(owner).await? {
                println!("{}", serde_json::to_string(&rule)?);
            }
        }
    }
    Ok(())
}

async fn toggle_rule(store: &dyn Store, id: i64, active: bool) -> anyhow::Result<()> {
    if !store.set_rule_active(id, active).await? {
        anyhow::bail!("no rule with id {id}");
    }
    println!("rule {id} {}", if active { "enabled" } else { "disabled" });
    Ok(())
}

async fn execute_role(command: RoleCommand, store: Arc<dyn Store>) -> anyhow::Result<()> {
    let registry = NodeRoleRegistry::new(store, node_id());

    match command {
        RoleCommand::Set { role: Role::Server, .. } => {
            registry.claim_server().await?;
        }
        RoleCommand::Set { role, group } => {
            registry.assume(role, group).await?;
        }
        RoleCommand::Show => match registry.current().await? {
            Some(role) => println!("{}", serde_json::to_string(&role)?),
            None => println!("{} has no role", registry.node_id()),
        },
        RoleCommand::Release => registry.release().await?,
    }
    Ok(())
}
