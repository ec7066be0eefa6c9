//! The server's routing identity: its routing id and signing keypair.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use maelum_core::{sha256_hex, KeyPair, KeyType};

use crate::storage::{write_atomic, MessageStore};

/// Routing identity persisted at `routing.json`. The routing id is the hex
/// SHA-256 of the routing public key, which is what gets registered with
/// the resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingIdentity {
    pub routing_id: String,
    pub keypair: KeyPair,
}

impl RoutingIdentity {
    /// Loads the identity from disk, generating and persisting a fresh one
    /// on first boot.
    pub async fn load_or_generate(store: &MessageStore) -> Result<Self> {
        let path = store.routing_path();
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding routing identity {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let keypair =
                    KeyPair::generate(KeyType::Ed25519).context("generating routing keypair")?;
                let identity = Self {
                    routing_id: sha256_hex(keypair.public.as_bytes()),
                    keypair,
                };
                let bytes = serde_json::to_vec_pretty(&identity)
                    .context("encoding routing identity")?;
                write_atomic(&path, &bytes).await?;
                tracing::info!(routing_id = %identity.routing_id, "generated new routing identity");
                Ok(identity)
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }
}
