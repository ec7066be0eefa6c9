use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use maelum_core::{AddressHash, ApiKey, InviteToken};
use maelum_server::identity::RoutingIdentity;
use maelum_server::repos::ApiKeyRepo;
use maelum_server::storage::MessageStore;
use maelum_server::{Runtime, ServerConfig, ServerConfigOverrides};

#[derive(Parser)]
#[command(name = "maelum-server", version, about = "Run the maelum mail server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the mail server.
    Serve(ServeCommand),
    /// Mint an admin API key (local operation only).
    Apikey(ApikeyCommand),
    /// Generate an invite token for one address.
    Invite(InviteCommand),
}

#[derive(Args, Debug)]
struct ServeCommand {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:2424", value_parser = clap::value_parser!(SocketAddr))]
    listen: SocketAddr,
    /// Directory for persisted server state.
    #[arg(long)]
    data_dir: PathBuf,
    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Base URL of the public resolver.
    #[arg(long)]
    resolver: Option<String>,
    /// Proof-of-work difficulty demanded from unsubscribed senders.
    #[arg(long = "pow-bits")]
    pow_bits: Option<u8>,
    /// Number of processor workers.
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct ApikeyCommand {
    /// Directory for persisted server state.
    #[arg(long)]
    data_dir: PathBuf,
}

#[derive(Args, Debug)]
struct InviteCommand {
    /// Directory for persisted server state.
    #[arg(long)]
    data_dir: PathBuf,
    /// Address hash to invite (64 hex characters).
    #[arg(long)]
    address_hash: String,
    /// Days the invitation stays valid.
    #[arg(long, default_value_t = 30)]
    days: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(cmd) => serve(cmd).await,
        Commands::Apikey(cmd) => mint_admin_key(cmd).await,
        Commands::Invite(cmd) => generate_invite(cmd).await,
    }
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let _ = subscriber.try_init();
}

async fn serve(cmd: ServeCommand) -> Result<()> {
    let config = ServerConfig::from_sources(
        cmd.listen,
        cmd.data_dir,
        cmd.config,
        ServerConfigOverrides {
            resolver_url: cmd.resolver,
            pow_bits: cmd.pow_bits,
            workers: cmd.workers,
        },
    )
    .await?;

    let runtime = Runtime::start(config).await?;
    println!("maelum server listening on {}", runtime.listen_addr());
    println!("press Ctrl+C to stop");

    signal::ctrl_c().await?;

    tracing::info!("shutdown signal received; draining");
    runtime.shutdown().await?;
    println!("maelum server stopped cleanly");
    Ok(())
}

/// Admin keys never travel over the management API; they are minted here,
/// with filesystem access as the authorisation.
async fn mint_admin_key(cmd: ApikeyCommand) -> Result<()> {
    let store = MessageStore::bootstrap(&cmd.data_dir).await?;
    let repo = ApiKeyRepo::load(store.state_dir()).await?;

    let key = ApiKey::new_admin();
    let id = key.id.clone();
    repo.store(key).await.context("storing admin key")?;

    println!("admin API key created:");
    println!("  {id}");
    Ok(())
}

async fn generate_invite(cmd: InviteCommand) -> Result<()> {
    let store = MessageStore::bootstrap(&cmd.data_dir).await?;
    let identity = RoutingIdentity::load_or_generate(&store).await?;

    let address_hash =
        AddressHash::from_str(&cmd.address_hash).context("parsing address hash")?;
    let expires_at = unix_now() + cmd.days * 86_400;
    let token = InviteToken::new(
        address_hash,
        identity.routing_id.clone(),
        expires_at,
        &identity.keypair.private,
    )
    .context("signing invite token")?;

    println!("invitation for {address_hash}, valid {} days:", cmd.days);
    println!("  {token}");
    Ok(())
}

fn unix_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs(),
        Err(_) => 0,
    }
}
