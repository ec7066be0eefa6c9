use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use maelum_client::api::{account_token, IngestClient, MailboxClient};
use maelum_client::steps::{run_steps, AccountContext, AccountStep};
use maelum_core::{
    compose, decrypt_entry, unlock_catalog, Address, Addressing, AttachmentSpec, BlockSpec,
    KeyPair,
};
use maelum_resolver::{HttpResolver, Resolver, ResolverService};

/// Bearer tokens minted by the CLI live this long.
const TOKEN_TTL_SECS: u64 = 600;

#[derive(Parser)]
#[command(name = "maelum", version, about = "maelum client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account: keys, proof of work, resolver records, server
    /// registration.
    AccountCreate(AccountCreateCommand),
    /// Compose and send a message.
    Send(SendCommand),
    /// List and read messages in a box.
    Read(ReadCommand),
}

#[derive(Args, Debug)]
struct AccountCreateCommand {
    /// Address to claim, e.g. alice! or alice@acme!
    #[arg(long)]
    address: String,
    /// Resolver base URL.
    #[arg(long)]
    resolver: String,
    /// Mail server endpoint (host:port or URL).
    #[arg(long)]
    server: String,
    /// Invite token issued by the server operator.
    #[arg(long)]
    invite: String,
    /// Where to store the account profile.
    #[arg(long, default_value = "maelum-profile.json")]
    profile: PathBuf,
}

#[derive(Args, Debug)]
struct SendCommand {
    /// Recipient address.
    #[arg(long)]
    to: String,
    /// Message subject.
    #[arg(long)]
    subject: String,
    /// Message body text.
    #[arg(long)]
    body: String,
    /// Files to attach.
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
    /// Resolver base URL.
    #[arg(long)]
    resolver: String,
    /// Account profile path.
    #[arg(long, default_value = "maelum-profile.json")]
    profile: PathBuf,
}

#[derive(Args, Debug)]
struct ReadCommand {
    /// Box to list (1 = INBOX).
    #[arg(long, default_value_t = 1)]
    r#box: u32,
    /// Long-poll for the next delivery when the box is empty.
    #[arg(long)]
    watch: bool,
    /// Server endpoint (host:port or URL).
    #[arg(long)]
    server: String,
    /// Account profile path.
    #[arg(long, default_value = "maelum-profile.json")]
    profile: PathBuf,
}

/// Locally stored account material. Keep this file private: it holds the
/// signing key and the recovery mnemonic.
#[derive(Debug, Serialize, Deserialize)]
struct Profile {
    address: String,
    mnemonic: String,
    keypair: KeyPair,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let _ = subscriber.try_init();

    let cli = Cli::parse();
    match cli.command {
        Commands::AccountCreate(cmd) => account_create(cmd).await,
        Commands::Send(cmd) => send(cmd).await,
        Commands::Read(cmd) => read(cmd).await,
    }
}

async fn account_create(cmd: AccountCreateCommand) -> Result<()> {
    let address = Address::parse(&cmd.address).context("parsing address")?;
    let resolver: Arc<dyn Resolver> =
        Arc::new(HttpResolver::new(&cmd.resolver).context("constructing resolver client")?);

    let routing_id = fetch_routing_id(&cmd.server).await?;
    let mut ctx = AccountContext::new(
        address.clone(),
        resolver,
        &cmd.server,
        routing_id,
        Some(cmd.invite),
    );
    run_steps(AccountStep::account_creation(), &mut ctx).await?;

    let profile = Profile {
        address: address.to_string(),
        mnemonic: ctx.mnemonic.clone().context("stepper produced no mnemonic")?,
        keypair: ctx.keypair.clone().context("stepper produced no keypair")?,
    };
    std::fs::write(&cmd.profile, serde_json::to_vec_pretty(&profile)?)
        .with_context(|| format!("writing profile {}", cmd.profile.display()))?;

    println!("account {address} created");
    println!("profile written to {}", cmd.profile.display());
    println!("recovery mnemonic (store safely!):\n  {}", profile.mnemonic);
    Ok(())
}

async fn send(cmd: SendCommand) -> Result<()> {
    let profile = load_profile(&cmd.profile)?;
    let sender_address = Address::parse(&profile.address)?;
    let recipient_address = Address::parse(&cmd.to)?;

    let resolver = ResolverService::new(Arc::new(
        HttpResolver::new(&cmd.resolver).context("constructing resolver client")?,
    ));
    let recipient = resolver
        .address(&recipient_address.hash())
        .await
        .context("resolving recipient")?;
    let routing = resolver
        .routing(&recipient.routing_id)
        .await
        .context("resolving recipient server")?;

    let mut attachments = Vec::new();
    for path in &cmd.attachments {
        let data = std::fs::read(path)
            .with_context(|| format!("reading attachment {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("attachment")
            .to_string();
        attachments.push(AttachmentSpec { name, data });
    }

    let envelope = compose(
        &Addressing {
            sender: sender_address.hash(),
            sender_key: profile.keypair.clone(),
            recipient: recipient_address.hash(),
            recipient_key: recipient.public_key.clone(),
        },
        &cmd.subject,
        unix_now(),
        vec![BlockSpec {
            kind: "default".to_string(),
            data: cmd.body.into_bytes(),
        }],
        attachments,
        None,
    )
    .context("composing envelope")?;

    let ingest = IngestClient::new(&routing.routing)?;
    ingest
        .send_envelope(&envelope, None)
        .await
        .context("uploading message")?;

    println!("message accepted by {}", routing.routing);
    Ok(())
}

async fn read(cmd: ReadCommand) -> Result<()> {
    let profile = load_profile(&cmd.profile)?;
    let address = Address::parse(&profile.address)?;
    let hash = address.hash();

    let token = account_token(&hash, &profile.keypair.private, unix_now() + TOKEN_TTL_SECS);
    let mailbox = MailboxClient::new(&cmd.server, token)?;

    let mut messages = mailbox.list_messages(&hash, cmd.r#box, 0, 20).await?;
    if messages.is_empty() && cmd.watch {
        println!("box {} is empty; waiting for new mail", cmd.r#box);
        while mailbox.wait_for_updates(&hash).await?.is_none() {}
        messages = mailbox.list_messages(&hash, cmd.r#box, 0, 20).await?;
    }
    if messages.is_empty() {
        println!("box {} is empty", cmd.r#box);
        return Ok(());
    }

    for listing in messages {
        let fetched = mailbox.fetch_message(&hash, cmd.r#box, listing.id).await?;
        let sealed = fetched.sealed_catalog()?;
        let catalog = match unlock_catalog(&fetched.header, &sealed, &profile.keypair.private) {
            Ok(catalog) => catalog,
            Err(err) => {
                tracing::warn!(error = %err, id = %listing.id, "cannot open catalog; skipping");
                continue;
            }
        };

        println!("* {} ({})", catalog.subject, listing.id);
        for entry in &catalog.blocks {
            let payload = mailbox
                .fetch_block(&hash, cmd.r#box, listing.id, &entry.id)
                .await?;
            let plaintext = decrypt_entry(entry, &payload)?;
            println!("{}", String::from_utf8_lossy(&plaintext));
        }
        for entry in &catalog.attachments {
            println!("  [attachment {}, {} bytes]", entry.kind, entry.size);
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    routing_id: String,
}

async fn fetch_routing_id(server: &str) -> Result<String> {
    let base = if server.starts_with("http://") || server.starts_with("https://") {
        server.trim_end_matches('/').to_string()
    } else {
        format!("http://{server}")
    };
    let health: HealthBody = reqwest::get(format!("{base}/healthz"))
        .await
        .context("fetching server identity")?
        .json()
        .await
        .context("decoding server identity")?;
    Ok(health.routing_id)
}

fn load_profile(path: &PathBuf) -> Result<Profile> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading profile {}", path.display()))?;
    let profile = serde_json::from_slice(&bytes)
        .with_context(|| format!("decoding profile {}", path.display()))?;
    Ok(profile)
}

fn unix_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn send_command_parses() {
        let cli = Cli::try_parse_from([
            "maelum",
            "send",
            "--to",
            "bob!",
            "--subject",
            "hi",
            "--body",
            "hello",
            "--resolver",
            "http://resolver.local",
        ])
        .unwrap();
        let Commands::Send(cmd) = cli.command else {
            panic!("expected send command");
        };
        assert_eq!(cmd.to, "bob!");
        assert!(cmd.attachments.is_empty());
    }

    #[test]
    fn profile_round_trips() {
        let profile = Profile {
            address: "alice!".to_string(),
            mnemonic: "a b c".to_string(),
            keypair: KeyPair::generate(maelum_core::KeyType::Ed25519).unwrap(),
        };
        let json = serde_json::to_string(&profile).unwrap();
        let back: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.address, "alice!");
    }
}
