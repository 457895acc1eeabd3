//! Unwrapping of at-rest encrypted target credentials.
//!
//! Ciphertexts are stored base64 encoded in the cluster configuration and
//! unwrapped right before each connection. Plaintexts are never logged or
//! persisted.

use crate::error::SecretError;
use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::debug;

/// Turns a stored ciphertext into the secret it protects.
#[async_trait]
pub trait SecretUnwrapper: Send + Sync {
    async fn unwrap_secret(&self, ciphertext_b64: &str) -> Result<String, SecretError>;
}

fn decode_base64(ciphertext_b64: &str) -> Result<Vec<u8>, SecretError> {
    STANDARD
        .decode(ciphertext_b64.trim())
        .map_err(|e| SecretError::Encoding(e.to_string()))
}

/// AWS KMS `Decrypt`.
pub struct KmsUnwrapper {
    client: aws_sdk_kms::Client,
}

impl KmsUnwrapper {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_kms::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl SecretUnwrapper for KmsUnwrapper {
    async fn unwrap_secret(&self, ciphertext_b64: &str) -> Result<String, SecretError> {
        let ciphertext = decode_base64(ciphertext_b64)?;
        let response = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(ciphertext))
            .send()
            .await
            .map_err(|e| {
                SecretError::Decrypt(aws_sdk_kms::error::DisplayErrorContext(&e).to_string())
            })?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| SecretError::Decrypt("response carried no plaintext".into()))?;
        debug!(key_id = ?response.key_id(), "Unwrapped credential");
        String::from_utf8(plaintext.as_ref().to_vec()).map_err(|_| SecretError::InvalidUtf8)
    }
}

/// Treats the stored value as base64 of the plaintext. Local development
/// only.
#[derive(Debug, Default)]
pub struct PlaintextUnwrapper;

#[async_trait]
impl SecretUnwrapper for PlaintextUnwrapper {
    async fn unwrap_secret(&self, ciphertext_b64: &str) -> Result<String, SecretError> {
        let bytes = decode_base64(ciphertext_b64)?;
        String::from_utf8(bytes).map_err(|_| SecretError::InvalidUtf8)
    }
}
