//! Shared fixtures: a runtime on an ephemeral port with a seeded admin
//! key, plus registered test users.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use maelum_client::api::{account_token, MailboxClient, RegisterRequest};
use maelum_core::{
    compose, Address, Addressing, ApiKey, BlockSpec, Envelope, KeyPair, KeyType, ProofOfWork,
    PublicKey,
};
use maelum_resolver::{AddressInfo, Resolver};
use maelum_server::repos::ApiKeyRepo;
use maelum_server::storage::MessageStore;
use maelum_server::{AdmissionConfig, ProcessorConfig, Runtime, ServerConfig};

/// Low difficulty keeps the tests fast while still exercising the
/// challenge machinery.
pub const TEST_POW_BITS: u8 = 8;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_secs()
}

pub struct TestServer {
    pub runtime: Runtime,
    pub base_url: String,
    pub admin_key: String,
}

/// Boots a server in `data_dir` against the shared resolver, with an admin
/// API key already persisted.
pub async fn start_server(
    resolver: Arc<dyn Resolver>,
    data_dir: &Path,
    retry_base_secs: u64,
    gc_interval_secs: u64,
) -> Result<TestServer> {
    let admin_key = seed_admin_key(data_dir).await?;

    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().expect("loopback listen address"),
        data_dir: data_dir.to_path_buf(),
        resolver_url: None,
        admission: AdmissionConfig {
            pow_bits: TEST_POW_BITS,
        },
        processor: ProcessorConfig {
            workers: 2,
            retry_base_secs,
            retry_cap_secs: 10,
            retry_budget_secs: 3_600,
            gc_interval_secs,
        },
        config_path: None,
    };

    let runtime = Runtime::start_with_resolver(config, resolver).await?;
    let base_url = format!("http://{}", runtime.listen_addr());
    Ok(TestServer {
        runtime,
        base_url,
        admin_key,
    })
}

/// Persists an admin key into the state directory before the runtime
/// loads it.
pub async fn seed_admin_key(data_dir: &Path) -> Result<String> {
    let store = MessageStore::bootstrap(data_dir).await?;
    let repo = ApiKeyRepo::load(store.state_dir()).await?;
    let key = ApiKey::new_admin();
    let id = key.id.clone();
    repo.store(key).await?;
    Ok(id)
}

pub struct TestUser {
    pub address: Address,
    pub keypair: KeyPair,
}

impl TestUser {
    pub fn hash(&self) -> maelum_core::AddressHash {
        self.address.hash()
    }

    pub fn bearer(&self) -> String {
        account_token(&self.hash(), &self.keypair.private, unix_now() + 600)
    }
}

/// Publishes a resolver record for `name` homed on `server` and registers
/// the account there through the invite + registration flow.
pub async fn create_user(
    server: &TestServer,
    resolver: &Arc<dyn Resolver>,
    name: &str,
) -> Result<TestUser> {
    let user = publish_user(resolver, name, &server.runtime.state().identity.routing_id).await?;
    register_user(server, &user).await?;
    Ok(user)
}

/// Publishes the resolver record only; the account lives on whichever
/// server `routing_id` names.
pub async fn publish_user(
    resolver: &Arc<dyn Resolver>,
    name: &str,
    routing_id: &str,
) -> Result<TestUser> {
    let address = Address::parse(name)?;
    let keypair = KeyPair::generate(KeyType::Ed25519)?;

    let mut pow = ProofOfWork::new(TEST_POW_BITS, address.hash().to_string());
    pow.work();

    let mut info = AddressInfo {
        address_hash: address.hash(),
        public_key: keypair.public.clone(),
        routing_id: routing_id.to_string(),
        pow: pow.to_string(),
        serial: 1,
        signature: String::new(),
    };
    info.sign(&keypair.private)?;
    resolver.publish_address(&info).await?;

    Ok(TestUser { address, keypair })
}

/// Invite + register an already-published user at `server`.
pub async fn register_user(server: &TestServer, user: &TestUser) -> Result<()> {
    let http = reqwest::Client::new();
    let invite: serde_json::Value = http
        .post(format!("{}/mgmt/invite", server.base_url))
        .bearer_auth(&server.admin_key)
        .json(&serde_json::json!({ "address_hash": user.hash(), "days": 1 }))
        .send()
        .await?
        .error_for_status()
        .context("invite endpoint returned error")?
        .json()
        .await?;
    let token = invite["token"]
        .as_str()
        .context("invite response carries no token")?
        .to_string();

    MailboxClient::register(
        &server.base_url,
        &RegisterRequest {
            address: user.address.to_string(),
            public_key: user.keypair.public.clone(),
            invite_token: token,
        },
    )
    .await
    .map_err(|err| anyhow::anyhow!("registering account failed: {err}"))?;
    Ok(())
}

/// Composes a one-block message between two test users.
pub fn compose_between(
    from: &TestUser,
    to_hash: maelum_core::AddressHash,
    to_key: &PublicKey,
    subject: &str,
    body: &str,
) -> Result<Envelope> {
    compose(
        &Addressing {
            sender: from.hash(),
            sender_key: from.keypair.clone(),
            recipient: to_hash,
            recipient_key: to_key.clone(),
        },
        subject,
        unix_now(),
        vec![BlockSpec {
            kind: "default".to_string(),
            data: body.as_bytes().to_vec(),
        }],
        Vec::new(),
        None,
    )
    .context("composing test envelope")
}
