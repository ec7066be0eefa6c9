//! Account creation as a linear sequence of named steps.
//!
//! Each step reads and extends a typed context record; the sequence is
//! data, so callers can display progress, skip the server registration
//! when only publishing records, or stop after key generation.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use maelum_core::{mnemonic, Address, KeyPair, ProofOfWork};
use maelum_resolver::{AddressInfo, OrganisationInfo, ReservedNameGuard, ResolveError, Resolver};

use crate::api::{MailboxClient, RegisterRequest};

/// Everything the account creation flow accumulates.
pub struct AccountContext {
    pub address: Address,
    pub resolver: Arc<dyn Resolver>,
    pub server_endpoint: String,
    pub routing_id: String,
    pub invite_token: Option<String>,
    /// Reserved-name enforcement applied before the address record is
    /// published. `None` skips the check (no allow-listed domains).
    pub reserved_guard: Option<ReservedNameGuard>,

    pub mnemonic: Option<String>,
    pub keypair: Option<KeyPair>,
    pub pow: Option<ProofOfWork>,
}

impl AccountContext {
    #[must_use]
    pub fn new(
        address: Address,
        resolver: Arc<dyn Resolver>,
        server_endpoint: impl Into<String>,
        routing_id: impl Into<String>,
        invite_token: Option<String>,
    ) -> Self {
        Self {
            address,
            resolver,
            server_endpoint: server_endpoint.into(),
            routing_id: routing_id.into(),
            invite_token,
            reserved_guard: None,
            mnemonic: None,
            keypair: None,
            pow: None,
        }
    }

    fn keypair(&self) -> Result<&KeyPair> {
        self.keypair
            .as_ref()
            .context("key generation step has not run")
    }
}

/// The named steps of account creation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStep {
    CheckAddressIsFree,
    GenerateKeys,
    ProveWork,
    PublishAddress,
    RegisterAtServer,
}

impl AccountStep {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            AccountStep::CheckAddressIsFree => "check address is free",
            AccountStep::GenerateKeys => "generate keys",
            AccountStep::ProveWork => "prove work",
            AccountStep::PublishAddress => "publish address record",
            AccountStep::RegisterAtServer => "register at server",
        }
    }

    /// The full account creation sequence.
    #[must_use]
    pub const fn account_creation() -> &'static [AccountStep] {
        &[
            AccountStep::CheckAddressIsFree,
            AccountStep::GenerateKeys,
            AccountStep::ProveWork,
            AccountStep::PublishAddress,
            AccountStep::RegisterAtServer,
        ]
    }

    async fn run(self, ctx: &mut AccountContext) -> Result<()> {
        match self {
            AccountStep::CheckAddressIsFree => {
                let hash = ctx.address.hash();
                match ctx.resolver.address(&hash).await {
                    Err(ResolveError::NotFound) => Ok(()),
                    Ok(_) => bail!("address {} is already registered", ctx.address),
                    Err(err) => Err(err).context("checking address availability"),
                }
            }
            AccountStep::GenerateKeys => {
                let (seed, phrase) = mnemonic::generate().context("generating mnemonic")?;
                let keypair =
                    KeyPair::derive_ed25519(&seed).context("deriving account keypair")?;
                ctx.mnemonic = Some(phrase);
                ctx.keypair = Some(keypair);
                Ok(())
            }
            AccountStep::ProveWork => {
                let bits = ctx
                    .resolver
                    .config()
                    .await
                    .context("fetching resolver proof-of-work policy")?
                    .pow_bits;
                let challenge = ctx.address.hash().to_string();
                let pow = tokio::task::spawn_blocking(move || {
                    let mut pow = ProofOfWork::new(bits, challenge);
                    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
                    pow.work_parallel(cores);
                    pow
                })
                .await
                .context("proof-of-work solver panicked")?;
                ctx.pow = Some(pow);
                Ok(())
            }
            AccountStep::PublishAddress => {
                let keypair = ctx.keypair()?.clone();
                if let Some(guard) = ctx.reserved_guard.as_ref() {
                    guard
                        .check(&ctx.address, &keypair.public)
                        .context("reserved name check failed")?;
                }
                let pow = ctx.pow.as_ref().context("proof-of-work step has not run")?;
                let mut info = AddressInfo {
                    address_hash: ctx.address.hash(),
                    public_key: keypair.public.clone(),
                    routing_id: ctx.routing_id.clone(),
                    pow: pow.to_string(),
                    serial: 1,
                    signature: String::new(),
                };
                info.sign(&keypair.private)
                    .context("signing address record")?;
                ctx.resolver
                    .publish_address(&info)
                    .await
                    .context("publishing address record")?;
                Ok(())
            }
            AccountStep::RegisterAtServer => {
                let keypair = ctx.keypair()?;
                let invite_token = ctx
                    .invite_token
                    .clone()
                    .context("an invite token is required to register at the server")?;
                MailboxClient::register(
                    &ctx.server_endpoint,
                    &RegisterRequest {
                        address: ctx.address.to_string(),
                        public_key: keypair.public.clone(),
                        invite_token,
                    },
                )
                .await
                .context("registering account at the mail server")?;
                Ok(())
            }
        }
    }
}

/// Runs a step sequence to completion, logging each step by name.
pub async fn run_steps(steps: &[AccountStep], ctx: &mut AccountContext) -> Result<()> {
    for step in steps {
        tracing::info!(step = step.name(), "running account step");
        step.run(ctx)
            .await
            .with_context(|| format!("account step failed: {}", step.name()))?;
    }
    Ok(())
}

/// Everything the organisation creation flow accumulates.
pub struct OrgContext {
    pub org_name: String,
    pub resolver: Arc<dyn Resolver>,

    pub keypair: Option<KeyPair>,
    pub pow: Option<ProofOfWork>,
}

impl OrgContext {
    #[must_use]
    pub fn new(org_name: impl Into<String>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            org_name: org_name.into().to_ascii_lowercase(),
            resolver,
            keypair: None,
            pow: None,
        }
    }

    fn org_hash(&self) -> maelum_core::AddressHash {
        maelum_core::AddressHash::from(maelum_core::sha256(self.org_name.as_bytes()))
    }
}

/// The named steps of organisation creation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrgStep {
    CheckOrgIsFree,
    GenerateKeys,
    ProveWork,
    PublishOrganisation,
}

impl OrgStep {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            OrgStep::CheckOrgIsFree => "check organisation is free",
            OrgStep::GenerateKeys => "generate keys",
            OrgStep::ProveWork => "prove work",
            OrgStep::PublishOrganisation => "publish organisation record",
        }
    }

    /// The full organisation creation sequence.
    #[must_use]
    pub const fn org_creation() -> &'static [OrgStep] {
        &[
            OrgStep::CheckOrgIsFree,
            OrgStep::GenerateKeys,
            OrgStep::ProveWork,
            OrgStep::PublishOrganisation,
        ]
    }

    async fn run(self, ctx: &mut OrgContext) -> Result<()> {
        match self {
            OrgStep::CheckOrgIsFree => {
                match ctx.resolver.organisation(&ctx.org_hash()).await {
                    Err(ResolveError::NotFound) => Ok(()),
                    Ok(_) => bail!("organisation {} is already registered", ctx.org_name),
                    Err(err) => Err(err).context("checking organisation availability"),
                }
            }
            OrgStep::GenerateKeys => {
                ctx.keypair = Some(
                    KeyPair::generate(maelum_core::KeyType::Ed25519)
                        .context("generating organisation keypair")?,
                );
                Ok(())
            }
            OrgStep::ProveWork => {
                let bits = ctx
                    .resolver
                    .config()
                    .await
                    .context("fetching resolver proof-of-work policy")?
                    .pow_bits;
                let challenge = ctx.org_hash().to_string();
                let pow = tokio::task::spawn_blocking(move || {
                    let mut pow = ProofOfWork::new(bits, challenge);
                    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
                    pow.work_parallel(cores);
                    pow
                })
                .await
                .context("proof-of-work solver panicked")?;
                ctx.pow = Some(pow);
                Ok(())
            }
            OrgStep::PublishOrganisation => {
                let keypair = ctx
                    .keypair
                    .clone()
                    .context("key generation step has not run")?;
                let pow = ctx.pow.as_ref().context("proof-of-work step has not run")?;
                let mut info = OrganisationInfo {
                    org_hash: ctx.org_hash(),
                    public_key: keypair.public.clone(),
                    pow: pow.to_string(),
                    serial: 1,
                    signature: String::new(),
                };
                info.sign(&keypair.private)
                    .context("signing organisation record")?;
                ctx.resolver
                    .publish_organisation(&info)
                    .await
                    .context("publishing organisation record")?;
                Ok(())
            }
        }
    }
}

/// Runs the organisation sequence to completion.
pub async fn run_org_steps(steps: &[OrgStep], ctx: &mut OrgContext) -> Result<()> {
    for step in steps {
        tracing::info!(step = step.name(), "running organisation step");
        step.run(ctx)
            .await
            .with_context(|| format!("organisation step failed: {}", step.name()))?;
    }
    Ok(())
}
