//! Reversible payload transform: JSON, then optional zstd compression, then
//! optional encryption.
//!
//! Encoded layout:
//!
//! ```text
//! flags (1 byte) | [key id length (1 byte) | key id]  | body
//!                  present when ENCRYPTED is set
//! ```
//!
//! Decoding is driven entirely by the header, so changing the configuration
//! never strands payloads that are already queued.

pub mod compression;
pub mod crypto;

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::QueueConfig;
use crate::error::PipelineError;

pub use crypto::{ChaChaCryptoService, CryptoService};

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_ENCRYPTED: u8 = 0x02;

/// Pipeline settings taken from the queue configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub compression_level: i32,
    pub encryption_enabled: bool,
    pub encryption_key_id: String,
}

impl From<&QueueConfig> for PipelineSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            compression_enabled: config.compression_enabled,
            compression_threshold: config.compression_threshold,
            compression_level: config.compression_level,
            encryption_enabled: config.encryption_enabled,
            encryption_key_id: config.encryption_key_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    pub encrypted: bool,
}

#[derive(Clone, Default)]
pub struct PayloadPipeline {
    crypto: Option<Arc<dyn CryptoService>>,
}

impl PayloadPipeline {
    pub fn new(crypto: Option<Arc<dyn CryptoService>>) -> Self {
        Self { crypto }
    }

    pub fn has_crypto(&self) -> bool {
        self.crypto.is_some()
    }

    pub async fn encode(
        &self,
        data: &Value,
        settings: &PipelineSettings,
    ) -> Result<EncodedPayload, PipelineError> {
        let mut body = serde_json::to_vec(data)?;
        let mut flags = 0u8;
        let raw_len = body.len();

        if settings.compression_enabled && body.len() > settings.compression_threshold {
            body = compression::compress(&body, settings.compression_level)?;
            flags |= FLAG_COMPRESSED;
        }

        let mut header = Vec::with_capacity(2 + settings.encryption_key_id.len());
        if settings.encryption_enabled {
            let crypto = self.crypto.as_ref().ok_or(PipelineError::MissingCrypto)?;
            let key_id = settings.encryption_key_id.as_bytes();
            let key_len = u8::try_from(key_id.len()).map_err(|_| {
                PipelineError::Corrupt(format!("key id is {} bytes, limit is 255", key_id.len()))
            })?;

            body = crypto.encrypt(&settings.encryption_key_id, &body).await?;
            flags |= FLAG_ENCRYPTED;
            header.push(key_len);
            header.extend_from_slice(key_id);
        }

        let mut bytes = Vec::with_capacity(1 + header.len() + body.len());
        bytes.push(flags);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&body);

        debug!("Encoded payload: {} -> {} bytes (flags {:#04x})", raw_len, bytes.len(), flags);

        Ok(EncodedPayload {
            bytes,
            compressed: flags & FLAG_COMPRESSED != 0,
            encrypted: flags & FLAG_ENCRYPTED != 0,
        })
    }

    /// Exact inverse of `encode`: decrypt, then decompress, then parse.
    pub async fn decode(&self, bytes: &[u8]) -> Result<Value, PipelineError> {
        let (&flags, mut rest) = bytes
            .split_first()
            .ok_or_else(|| PipelineError::Corrupt("empty payload".to_string()))?;
        if flags & !(FLAG_COMPRESSED | FLAG_ENCRYPTED) != 0 {
            return Err(PipelineError::Corrupt(format!("unknown flags {:#04x}", flags)));
        }

        let mut body: Vec<u8>;
        if flags & FLAG_ENCRYPTED != 0 {
            let (&key_len, after) = rest
                .split_first()
                .ok_or_else(|| PipelineError::Corrupt("missing key id".to_string()))?;
            if after.len() < usize::from(key_len) {
                return Err(PipelineError::Corrupt("truncated key id".to_string()));
            }
            let (key_id, ciphertext) = after.split_at(usize::from(key_len));
            let key_id = std::str::from_utf8(key_id)
                .map_err(|_| PipelineError::Corrupt("key id is not UTF-8".to_string()))?;
            rest = ciphertext;

            let crypto = self.crypto.as_ref().ok_or(PipelineError::MissingCrypto)?;
            body = crypto.decrypt(key_id, rest).await?;
        } else {
            body = rest.to_vec();
        }

        if flags & FLAG_COMPRESSED != 0 {
            body = compression::decompress(&body)?;
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

impl std::fmt::Debug for PayloadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadPipeline")
            .field("crypto", &self.crypto.is_some())
            .finish()
    }
}
