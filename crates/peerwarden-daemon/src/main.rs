use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use peerwarden_daemon::config::{self, Config, DEFAULT_CONFIG_PATH};
use peerwarden_daemon::exec::DockerExec;
use peerwarden_daemon::lock::PathLocks;
use peerwarden_daemon::owners::OwnerStore;
use peerwarden_daemon::peers::WgPeers;
use peerwarden_daemon::reconcile::{Reconciler, outcome_of};
use peerwarden_daemon::tunnel::TunnelClients;
use peerwarden_daemon::wgconf::host_cidr;
use peerwarden_types::{ClientRecord, ItemResult, PeerProfile};
use serde::Serialize;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error>;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).with_writer(std::io::stderr).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Peer lifecycle and reconciliation for AWG and xray engines")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "PEERWARDEN_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// WireGuard-engine peers
    #[command(subcommand)]
    Peer(PeerCommand),
    /// Tunnel-engine clients
    #[command(subcommand)]
    Tunnel(TunnelCommand),
    /// Registry vs. tunnel-engine reconciliation
    #[command(subcommand)]
    Sync(SyncCommand),
    /// Owner access
    #[command(subcommand)]
    Owner(OwnerCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Periodically classify both engines and log drift, without repairing
    Watch {
        /// Polling interval in seconds
        #[arg(short, long, default_value_t = 300)]
        interval: u64,
    },
}

#[derive(Debug, Subcommand)]
enum PeerCommand {
    Create {
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        name: String,
        /// Contact tag stored with the record
        #[arg(long)]
        contact: Option<String>,
    },
    Delete { uuid: String },
    Suspend { uuid: String },
    Resume { uuid: String },
    /// Print the importable client configuration
    Render { uuid: String },
    List {
        #[arg(long)]
        owner: Option<i64>,
    },
    Drift,
    /// Rebuild the managed peer section from the registry
    Resync,
    /// Drop every peer from the live configuration
    Clean,
}

#[derive(Debug, Subcommand)]
enum TunnelCommand {
    Add(NameArgs),
    Remove(NameArgs),
    Suspend(NameArgs),
    Resume(NameArgs),
    List {
        #[arg(long)]
        owner: Option<i64>,
    },
    /// Print the VLESS share link
    Link {
        #[command(flatten)]
        target: NameArgs,
        /// Print the importable client config instead
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, clap::Args)]
struct NameArgs {
    #[arg(long)]
    owner: i64,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    Classify,
    /// Put registry-only clients back into the engine
    Absent(Target),
    /// Remove bot-tagged clients the registry does not know
    Extra(Target),
    /// Copy live identities into the registry
    Pull(Target),
    /// Push registry identities into the engine
    Push(Target),
}

#[derive(Debug, clap::Args)]
struct Target {
    #[arg(long, requires = "name", required_unless_present = "all")]
    owner: Option<i64>,
    #[arg(long, requires = "owner")]
    name: Option<String>,
    /// Every eligible item from a fresh classification
    #[arg(long, conflicts_with_all = ["owner", "name"])]
    all: bool,
}

#[derive(Debug, Subcommand)]
enum OwnerCommand {
    Allow { owner: i64 },
    Revoke { owner: i64 },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Write the effective configuration to the config path
    Init,
}

struct Services {
    peers: WgPeers<DockerExec>,
    tunnel: Arc<TunnelClients<DockerExec>>,
    owners: Arc<OwnerStore>,
    reconciler: Reconciler<DockerExec>,
}

impl Services {
    fn new(cfg: &Config) -> Self {
        let exec = Arc::new(DockerExec::new(&cfg.exec, cfg.engines()));
        let locks = PathLocks::new();
        let peers = WgPeers::new(Arc::clone(&exec), locks.clone(), &cfg.wireguard, &cfg.endpoint);
        let tunnel = Arc::new(TunnelClients::new(exec, locks, &cfg.tunnel, &cfg.endpoint));
        let owners = Arc::new(OwnerStore::new(&cfg.owners));
        let reconciler = Reconciler::new(Arc::clone(&tunnel), Arc::clone(&owners));
        Self {
            peers,
            tunnel,
            owners,
            reconciler,
        }
    }
}

/// Records returned after creation are reported without key material.
fn key_less(record: &ClientRecord) -> PeerProfile {
    let allowed = record
        .user_data
        .ip
        .as_deref()
        .and_then(|ip| host_cidr(ip).ok())
        .unwrap_or_default();
    record.profile(allowed)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_peer(svc: &Services, cmd: PeerCommand) -> Result<(), BoxError> {
    let peers = &svc.peers;
    match cmd {
        PeerCommand::Create {
            owner,
            name,
            contact,
        } => print_json(&peers.create_peer(owner, &name, contact.as_deref()).await?),
        PeerCommand::Delete { uuid } => print_json(&key_less(&peers.delete_peer(&uuid).await?)),
        PeerCommand::Suspend { uuid } => print_json(&key_less(&peers.suspend_peer(&uuid).await?)),
        PeerCommand::Resume { uuid } => print_json(&key_less(&peers.resume_peer(&uuid).await?)),
        PeerCommand::Render { uuid } => {
            print!("{}", peers.render_client_config(&uuid).await?);
            Ok(())
        }
        PeerCommand::List { owner } => print_json(&peers.list_profiles(owner).await?),
        PeerCommand::Drift => print_json(&peers.drift().await?),
        PeerCommand::Resync => {
            let managed = peers.resync().await?;
            print_json(&serde_json::json!({ "managed": managed }))
        }
        PeerCommand::Clean => {
            let removed = peers.clean_all_peers().await?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
    }
}

async fn run_tunnel(svc: &Services, cmd: TunnelCommand) -> Result<(), BoxError> {
    let tunnel = &svc.tunnel;
    match cmd {
        TunnelCommand::Add(t) => print_json(&tunnel.add_client(t.owner, &t.name).await?),
        TunnelCommand::Remove(t) => {
            let removed = tunnel.remove_client_by_name(t.owner, &t.name).await?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        TunnelCommand::Suspend(t) => {
            print_json(&tunnel.suspend_client_by_name(t.owner, &t.name).await?)
        }
        TunnelCommand::Resume(t) => {
            print_json(&tunnel.resume_client_by_name(t.owner, &t.name).await?)
        }
        TunnelCommand::List { owner } => print_json(&tunnel.list_records(owner).await?),
        TunnelCommand::Link { target, json } => {
            let link = tunnel.share_link(target.owner, &target.name).await?;
            if json {
                print_json(&link.client_config())
            } else {
                println!("{}", link.uri());
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Repair {
    Absent,
    Extra,
    Pull,
    Push,
}

async fn run_sync(svc: &Services, cmd: SyncCommand) -> Result<(), BoxError> {
    let r = &svc.reconciler;
    let (target, repair) = match cmd {
        SyncCommand::Classify => return print_json(&r.classify().await?),
        SyncCommand::Absent(t) => (t, Repair::Absent),
        SyncCommand::Extra(t) => (t, Repair::Extra),
        SyncCommand::Pull(t) => (t, Repair::Pull),
        SyncCommand::Push(t) => (t, Repair::Push),
    };

    if target.all {
        let summary = match repair {
            Repair::Absent => r.repair_all_absent().await?,
            Repair::Extra => r.repair_all_extra().await?,
            Repair::Pull => r.sync_all_from_engine().await?,
            Repair::Push => r.rebuild_all_from_registry().await?,
        };
        return print_json(&summary);
    }

    let (Some(owner), Some(name)) = (target.owner, target.name) else {
        return Err("either --owner and --name or --all is required".into());
    };
    let result = match repair {
        Repair::Absent => r.repair_absent(owner, &name).await,
        Repair::Extra => r.repair_extra(owner, &name).await,
        Repair::Pull => r.sync_registry_from_engine(owner, &name).await,
        Repair::Push => r.rebuild_engine_from_registry(owner, &name).await,
    };
    print_json(&ItemResult {
        owner,
        outcome: outcome_of(&result),
        name,
    })
}

async fn run_owner(svc: &Services, cmd: OwnerCommand) -> Result<(), BoxError> {
    let record = match cmd {
        OwnerCommand::Allow { owner } => svc.owners.set_allowed(owner, true).await?,
        OwnerCommand::Revoke { owner } => svc.owners.set_allowed(owner, false).await?,
    };
    print_json(&record)
}

async fn watch(svc: &Services, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "watching engines");
    loop {
        match svc.reconciler.classify().await {
            Ok(snapshot) if snapshot.counters.absent + snapshot.counters.extra + snapshot.counters.diverged > 0 => {
                warn!(
                    absent = snapshot.counters.absent,
                    extra = snapshot.counters.extra,
                    diverged = snapshot.counters.diverged,
                    "tunnel registry out of sync"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "tunnel classification failed"),
        }

        match svc.peers.drift().await {
            Ok(report) if !report.is_clean() => {
                warn!(
                    missing_live = report.missing_live.len(),
                    unknown_live = report.unknown_live.len(),
                    address_mismatch = report.address_mismatch.len(),
                    "wireguard registry out of sync"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "wireguard drift check failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping watch");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!(error = %e, "no .env loaded");
    }
    let args = Args::parse();

    let mut cfg = config::load(&args.config).await?;
    cfg.apply_env()?;
    cfg.validate()?;

    let svc = Services::new(&cfg);
    match args.command {
        Command::Peer(cmd) => run_peer(&svc, cmd).await,
        Command::Tunnel(cmd) => run_tunnel(&svc, cmd).await,
        Command::Sync(cmd) => run_sync(&svc, cmd).await,
        Command::Owner(cmd) => run_owner(&svc, cmd).await,
        Command::Config(ConfigCommand::Init) => {
            config::save(&args.config, &cfg).await?;
            Ok(())
        }
        Command::Watch { interval } => {
            watch(&svc, Duration::from_secs(interval.max(1))).await;
            Ok(())
        }
    }
}
