//! HTTP clients for the server's ingest and mailbox APIs.
//!
//! The ingest client drives the staged upload state machine: request a
//! ticket (solving a proof-of-work challenge when the server demands one),
//! upload header, catalog, blocks and attachments, then finalise. Every
//! step is idempotent enough to re-run after a partial failure: a repeated
//! header upload answers `409 Conflict` and is treated as already done.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use maelum_core::{
    sha256_hex, AddressHash, Envelope, Header, PrivateKey, ProofOfWork,
};

/// Header carrying `challenge:nonce` proof-of-work responses.
pub const POW_HEADER: &str = "x-bitmaelum-pow";

/// Header carrying the declared SHA-256 of a block or attachment body.
pub const CHECKSUM_HEADER: &str = "x-bitmaelum-checksum";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced by the ingest and mailbox clients.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server rejected request with {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed server response: {0}")]
    Malformed(String),
    #[error("proof of work demanded repeatedly; giving up")]
    PowLoop,
}

impl ClientError {
    /// Returns the HTTP status for rejection errors.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `true` when retrying later could succeed (network failure or 5xx).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Body of a ticket request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRequest {
    pub from_hash: AddressHash,
    pub to_hash: AddressHash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

/// Ticket grant returned by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TicketGrant {
    pub id: Uuid,
    pub valid: bool,
    pub expires: u64,
}

/// Challenge body of a `412 Precondition Failed` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeBody {
    pub challenge: String,
    pub bits: u8,
}

/// Manifest declared at finalisation: every id the catalog names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// Outcome of a single ticket request.
#[derive(Debug, Clone)]
pub enum TicketOutcome {
    Granted(TicketGrant),
    PowRequired(ChallengeBody),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct IngestClient {
    base_url: String,
    client: reqwest::Client,
}

impl IngestClient {
    /// Creates a client against a server endpoint. `endpoint` is either a
    /// full URL or the `host:port` form stored in routing records.
    pub fn new(endpoint: &str) -> Result<Self, ClientError> {
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{endpoint}")
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Ok(Self { base_url, client })
    }

    /// One ticket request, optionally carrying a solved proof of work.
    pub async fn request_ticket(
        &self,
        request: &TicketRequest,
        pow: Option<(&str, u64)>,
    ) -> Result<TicketOutcome, ClientError> {
        let mut builder = self
            .client
            .post(format!("{}/incoming", self.base_url))
            .json(request);
        if let Some((challenge, nonce)) = pow {
            builder = builder.header(POW_HEADER, format!("{challenge}:{nonce}"));
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        match response.status().as_u16() {
            200 => {
                let grant: TicketGrant = response
                    .json()
                    .await
                    .map_err(|err| ClientError::Malformed(err.to_string()))?;
                Ok(TicketOutcome::Granted(grant))
            }
            412 => {
                let challenge: ChallengeBody = response
                    .json()
                    .await
                    .map_err(|err| ClientError::Malformed(err.to_string()))?;
                Ok(TicketOutcome::PowRequired(challenge))
            }
            _ => Err(rejection(response).await),
        }
    }

    /// Requests a ticket, solving at most one proof-of-work challenge.
    pub async fn obtain_ticket(
        &self,
        request: &TicketRequest,
    ) -> Result<TicketGrant, ClientError> {
        match self.request_ticket(request, None).await? {
            TicketOutcome::Granted(grant) => Ok(grant),
            TicketOutcome::PowRequired(challenge) => {
                tracing::debug!(
                    bits = challenge.bits,
                    "server demands proof of work; solving"
                );
                let solved = solve_challenge(challenge.clone()).await;
                match self
                    .request_ticket(request, Some((&solved.challenge, solved.nonce)))
                    .await?
                {
                    TicketOutcome::Granted(grant) => Ok(grant),
                    TicketOutcome::PowRequired(_) => Err(ClientError::PowLoop),
                }
            }
        }
    }

    /// Uploads the header. A `409 Conflict` means a previous attempt
    /// already stored it and counts as success.
    pub async fn upload_header(&self, ticket: Uuid, header: &Header) -> Result<(), ClientError> {
        let response = self
            .client
            .post(format!("{}/incoming/{ticket}/header", self.base_url))
            .json(header)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if response.status().is_success() || response.status().as_u16() == 409 {
            Ok(())
        } else {
            Err(rejection(response).await)
        }
    }

    /// Uploads the sealed catalog verbatim.
    pub async fn upload_catalog(&self, ticket: Uuid, catalog: &[u8]) -> Result<(), ClientError> {
        self.post_ok(
            format!("{}/incoming/{ticket}/catalog", self.base_url),
            catalog.to_vec(),
            None,
        )
        .await
    }

    /// Uploads one encrypted block with its declared checksum.
    pub async fn upload_block(
        &self,
        ticket: Uuid,
        id: &str,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        self.post_ok(
            format!("{}/incoming/{ticket}/block/{id}", self.base_url),
            payload.to_vec(),
            Some(sha256_hex(payload)),
        )
        .await
    }

    /// Uploads one encrypted attachment with its declared checksum.
    pub async fn upload_attachment(
        &self,
        ticket: Uuid,
        id: &str,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        self.post_ok(
            format!("{}/incoming/{ticket}/attachment/{id}", self.base_url),
            payload.to_vec(),
            Some(sha256_hex(payload)),
        )
        .await
    }

    /// Finalises the upload. The manifest declares every id the catalog
    /// names so the server can enforce coverage.
    pub async fn complete(
        &self,
        ticket: Uuid,
        manifest: &CompleteRequest,
    ) -> Result<(), ClientError> {
        let response = self
            .client
            .post(format!("{}/incoming/{ticket}/complete", self.base_url))
            .json(manifest)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejection(response).await)
        }
    }

    /// Aborts the upload, removing staged data and the ticket.
    pub async fn abort(&self, ticket: Uuid) -> Result<(), ClientError> {
        let response = self
            .client
            .delete(format!("{}/incoming/{ticket}", self.base_url))
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejection(response).await)
        }
    }

    /// Runs the whole pipeline for a composed envelope: ticket (with PoW
    /// if demanded), staged uploads, finalise.
    pub async fn send_envelope(
        &self,
        envelope: &Envelope,
        subscription_id: Option<String>,
    ) -> Result<(), ClientError> {
        let grant = self
            .obtain_ticket(&TicketRequest {
                from_hash: envelope.header.from.addr,
                to_hash: envelope.header.to.addr,
                subscription_id,
            })
            .await?;

        self.upload_header(grant.id, &envelope.header).await?;
        self.upload_catalog(grant.id, &envelope.sealed_catalog).await?;
        for (id, payload) in &envelope.blocks {
            self.upload_block(grant.id, id, payload).await?;
        }
        for (id, payload) in &envelope.attachments {
            self.upload_attachment(grant.id, id, payload).await?;
        }

        let manifest = CompleteRequest {
            blocks: envelope.blocks.iter().map(|(id, _)| id.clone()).collect(),
            attachments: envelope
                .attachments
                .iter()
                .map(|(id, _)| id.clone())
                .collect(),
        };
        self.complete(grant.id, &manifest).await
    }

    async fn post_ok(
        &self,
        url: String,
        body: Vec<u8>,
        checksum: Option<String>,
    ) -> Result<(), ClientError> {
        let mut builder = self.client.post(url).body(body);
        if let Some(checksum) = checksum {
            builder = builder.header(CHECKSUM_HEADER, checksum);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejection(response).await)
        }
    }
}

/// Solves a server challenge off the async runtime, using every core.
async fn solve_challenge(challenge: ChallengeBody) -> ProofOfWork {
    tokio::task::spawn_blocking(move || {
        let mut pow = ProofOfWork::new(challenge.bits, challenge.challenge);
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        pow.work_parallel(cores);
        pow
    })
    .await
    .expect("proof-of-work solver panicked")
}

async fn rejection(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => "unknown error".to_string(),
    };
    ClientError::Rejected { status, message }
}

/// Builds a short-lived mailbox bearer token: the account hash and expiry,
/// signed by an authorised account key.
#[must_use]
pub fn account_token(hash: &AddressHash, key: &PrivateKey, expires_at: u64) -> String {
    let payload = format!("{hash}:{expires_at}");
    let signature = key.sign(payload.as_bytes()).unwrap_or_default();
    BASE64.encode(format!("{payload}:{}", BASE64.encode(signature)))
}

/// Box listing entry returned by the mailbox API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxListing {
    pub id: u32,
    pub name: String,
    pub total: usize,
}

/// Message listing entry returned by the mailbox API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageListing {
    pub id: Uuid,
    pub received_at: u64,
}

/// Body of a delivery notification from the update long-poll.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UpdateNotice {
    pub message_id: Uuid,
}

/// Header + sealed catalog of one fetched message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub header: Header,
    pub catalog: String,
}

impl FetchedMessage {
    /// Decodes the base64 sealed catalog bytes.
    pub fn sealed_catalog(&self) -> Result<Vec<u8>, ClientError> {
        BASE64
            .decode(&self.catalog)
            .map_err(|err| ClientError::Malformed(err.to_string()))
    }
}

/// Body for registering an account with an invite token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub address: String,
    pub public_key: maelum_core::PublicKey,
    pub invite_token: String,
}

pub struct MailboxClient {
    base_url: String,
    client: reqwest::Client,
    token: String,
}

impl MailboxClient {
    pub fn new(endpoint: &str, token: String) -> Result<Self, ClientError> {
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{endpoint}")
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Ok(Self {
            base_url,
            client,
            token,
        })
    }

    /// Registers an account; no bearer needed, the invite token is the
    /// authorisation.
    pub async fn register(
        endpoint: &str,
        request: &RegisterRequest,
    ) -> Result<(), ClientError> {
        let this = Self::new(endpoint, String::new())?;
        let response = this
            .client
            .post(format!("{}/account", this.base_url))
            .json(request)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejection(response).await)
        }
    }

    pub async fn list_boxes(&self, hash: &AddressHash) -> Result<Vec<BoxListing>, ClientError> {
        self.get_json(format!("{}/account/{hash}/boxes", self.base_url))
            .await
    }

    pub async fn list_messages(
        &self,
        hash: &AddressHash,
        box_id: u32,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageListing>, ClientError> {
        self.get_json(format!(
            "{}/account/{hash}/box/{box_id}?offset={offset}&limit={limit}",
            self.base_url
        ))
        .await
    }

    pub async fn fetch_message(
        &self,
        hash: &AddressHash,
        box_id: u32,
        id: Uuid,
    ) -> Result<FetchedMessage, ClientError> {
        self.get_json(format!(
            "{}/account/{hash}/box/{box_id}/message/{id}",
            self.base_url
        ))
        .await
    }

    pub async fn fetch_block(
        &self,
        hash: &AddressHash,
        box_id: u32,
        id: Uuid,
        block_id: &str,
    ) -> Result<Vec<u8>, ClientError> {
        self.get_bytes(format!(
            "{}/account/{hash}/box/{box_id}/message/{id}/block/{block_id}",
            self.base_url
        ))
        .await
    }

    pub async fn fetch_attachment(
        &self,
        hash: &AddressHash,
        box_id: u32,
        id: Uuid,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ClientError> {
        self.get_bytes(format!(
            "{}/account/{hash}/box/{box_id}/message/{id}/attachment/{attachment_id}",
            self.base_url
        ))
        .await
    }

    /// Long-polls for the next delivery into the account. The server
    /// holds the request open for up to its poll window and answers
    /// `204 No Content` when nothing arrives, surfaced here as `None`.
    pub async fn wait_for_updates(
        &self,
        hash: &AddressHash,
    ) -> Result<Option<Uuid>, ClientError> {
        let response = self
            .client
            .get(format!("{}/account/{hash}/updates", self.base_url))
            .bearer_auth(&self.token)
            // Wider than the per-request default: the long-poll is meant
            // to idle at the server for up to 25 seconds.
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        match response.status().as_u16() {
            204 => Ok(None),
            status if (200..300).contains(&status) => {
                let notice: UpdateNotice = response
                    .json()
                    .await
                    .map_err(|err| ClientError::Malformed(err.to_string()))?;
                Ok(Some(notice.message_id))
            }
            _ => Err(rejection(response).await),
        }
    }

    pub async fn move_message(
        &self,
        hash: &AddressHash,
        box_id: u32,
        id: Uuid,
        to_box: u32,
    ) -> Result<(), ClientError> {
        let response = self
            .client
            .post(format!(
                "{}/account/{hash}/box/{box_id}/message/{id}/move",
                self.base_url
            ))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "to_box": to_box }))
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejection(response).await)
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, ClientError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|err| ClientError::Malformed(err.to_string()))
        } else {
            Err(rejection(response).await)
        }
    }

    async fn get_bytes(&self, url: String) -> Result<Vec<u8>, ClientError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(response
                .bytes()
                .await
                .map_err(|err| ClientError::Transport(err.to_string()))?
                .to_vec())
        } else {
            Err(rejection(response).await)
        }
    }
}
