//! The maelum mail server: proof-of-work-gated ingest of encrypted
//! envelopes, a staged upload protocol, an at-most-once delivery pipeline,
//! and authenticated mailbox APIs.

pub mod admission;
pub mod config;
pub mod identity;
pub mod observability;
pub mod processor;
pub mod repos;
pub mod runtime;
pub mod server;
pub mod state;
pub mod storage;

pub use crate::config::{AdmissionConfig, ProcessorConfig, ServerConfig, ServerConfigOverrides};
pub use crate::runtime::Runtime;
