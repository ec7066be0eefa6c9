use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;

/// Runtime configuration for the maelum server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub resolver_url: Option<String>,
    pub admission: AdmissionConfig,
    pub processor: ProcessorConfig,
    pub config_path: Option<PathBuf>,
}

/// Admission policy for untrusted senders.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    /// Proof-of-work difficulty floor demanded from unsubscribed senders.
    pub pow_bits: u8,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { pow_bits: 22 }
    }
}

/// Processor pool and retry policy.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    pub workers: usize,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    pub retry_budget_secs: u64,
    pub gc_interval_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            retry_base_secs: 30,
            retry_cap_secs: 3_600,
            retry_budget_secs: 72 * 3_600,
            gc_interval_secs: 300,
        }
    }
}

/// CLI-level overrides layered over the configuration file.
#[derive(Debug, Default)]
pub struct ServerConfigOverrides {
    pub resolver_url: Option<String>,
    pub pow_bits: Option<u8>,
    pub workers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    listen: Option<SocketAddr>,
    resolver_url: Option<String>,
    #[serde(default)]
    admission: AdmissionSection,
    #[serde(default)]
    processor: ProcessorSection,
}

#[derive(Debug, Deserialize, Default)]
struct AdmissionSection {
    pow_bits: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessorSection {
    workers: Option<usize>,
    retry_base_secs: Option<u64>,
    retry_cap_secs: Option<u64>,
    retry_budget_secs: Option<u64>,
    gc_interval_secs: Option<u64>,
}

impl ServerConfig {
    pub async fn from_sources(
        listen: SocketAddr,
        data_dir: PathBuf,
        config_path: Option<PathBuf>,
        overrides: ServerConfigOverrides,
    ) -> Result<Self> {
        let file_cfg = if let Some(path) = config_path.as_ref() {
            let contents = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading server configuration from {}", path.display()))?;
            parse_config(&contents, path)?
        } else {
            FileConfig::default()
        };

        let defaults = ProcessorConfig::default();
        let processor = ProcessorConfig {
            workers: overrides
                .workers
                .or(file_cfg.processor.workers)
                .unwrap_or(defaults.workers),
            retry_base_secs: file_cfg
                .processor
                .retry_base_secs
                .unwrap_or(defaults.retry_base_secs),
            retry_cap_secs: file_cfg
                .processor
                .retry_cap_secs
                .unwrap_or(defaults.retry_cap_secs),
            retry_budget_secs: file_cfg
                .processor
                .retry_budget_secs
                .unwrap_or(defaults.retry_budget_secs),
            gc_interval_secs: file_cfg
                .processor
                .gc_interval_secs
                .unwrap_or(defaults.gc_interval_secs),
        };
        let admission = AdmissionConfig {
            pow_bits: overrides
                .pow_bits
                .or(file_cfg.admission.pow_bits)
                .unwrap_or_else(|| AdmissionConfig::default().pow_bits),
        };

        Ok(Self {
            listen: file_cfg.listen.unwrap_or(listen),
            data_dir,
            resolver_url: overrides.resolver_url.or(file_cfg.resolver_url),
            admission,
            processor,
            config_path,
        })
    }
}

fn parse_config(contents: &str, path: &Path) -> Result<FileConfig> {
    let deserializer = toml::Deserializer::new(contents);
    let parsed = serde_path_to_error::deserialize(deserializer)
        .with_context(|| format!("parsing server configuration at {}", path.display()))?;
    Ok(parsed)
}
