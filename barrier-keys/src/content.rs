//! Content encryption with per-call data keys
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Envelope layout:
//
// ```text
// [ format (1) ][ intermediate version (4, BE) ][ wrapped DEK length (4, BE) ]
// [ wrapped DEK ][ payload ]
// ```
//
// The wrapped DEK is an intermediate-key ciphertext. The payload is sealed by
// the DEK with the wrapped DEK as associated data, so neither half can be
// swapped for another envelope's.


use crate::crypto::{open, seal, Algorithm, EnvelopeHeader, KeyMaterial};
use crate::error::{KeyError, KeyResult};
use crate::intermediate::IntermediateKeyService;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroize;

const CONTENT_FORMAT: u8 = 1;
const CONTENT_HEADER_LEN: usize = 9;
/// DEKs are single use and carry no version of their own
const DEK_VERSION: u32 = 0;

struct ContentEnvelope<'a> {
    intermediate_version: u32,
    wrapped_dek: &'a [u8],
    payload: &'a [u8],
}

impl<'a> ContentEnvelope<'a> {
    fn parse(bytes: &'a [u8]) -> KeyResult<Self> {
        if bytes.len() < CONTENT_HEADER_LEN || bytes[0] != CONTENT_FORMAT {
            return Err(KeyError::IntegrityFailure("malformed content envelope".to_string()));
        }
        let intermediate_version = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let dek_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let rest = &bytes[CONTENT_HEADER_LEN..];
        if rest.len() < dek_len {
            return Err(KeyError::IntegrityFailure("truncated content envelope".to_string()));
        }
        let (wrapped_dek, payload) = rest.split_at(dek_len);
        Ok(Self {
            intermediate_version,
            wrapped_dek,
            payload,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(CONTENT_HEADER_LEN + self.wrapped_dek.len() + self.payload.len());
        out.push(CONTENT_FORMAT);
        out.extend_from_slice(&self.intermediate_version.to_be_bytes());
        out.extend_from_slice(&(self.wrapped_dek.len() as u32).to_be_bytes());
        out.extend_from_slice(self.wrapped_dek);
        out.extend_from_slice(self.payload);
        out
    }
}

fn payload_context(wrapped_dek: &[u8]) -> Vec<u8> {
    let mut context = b"content:".to_vec();
    context.extend_from_slice(wrapped_dek);
    context
}

/// Encrypts arbitrary-size payloads under fresh data keys
pub struct ContentCipher {
    intermediate: Arc<IntermediateKeyService>,
    algorithm: Algorithm,
}

impl ContentCipher {
    pub fn new(intermediate: Arc<IntermediateKeyService>, algorithm: Algorithm) -> Self {
        Self {
            intermediate,
            algorithm,
        }
    }

    /// Encrypt `plaintext`; returns a self-describing envelope
    pub async fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        let dek = KeyMaterial::generate(self.algorithm);
        let (wrapped_dek, intermediate_version) =
            self.intermediate.encrypt_key(dek.as_bytes()).await?;
        let payload = seal(&dek, DEK_VERSION, &payload_context(&wrapped_dek), plaintext)?;

        debug!(
            intermediate_version = intermediate_version,
            algorithm = %self.algorithm,
            size = plaintext.len(),
            "Encrypted content"
        );
        Ok(ContentEnvelope {
            intermediate_version,
            wrapped_dek: &wrapped_dek,
            payload: &payload,
        }
        .encode())
    }

    /// Decrypt an envelope produced by `encrypt`
    pub async fn decrypt(&self, envelope: &[u8]) -> KeyResult<Vec<u8>> {
        let envelope = ContentEnvelope::parse(envelope)?;
        let algorithm = EnvelopeHeader::parse(envelope.payload)?.algorithm;

        let mut dek_bytes = self
            .intermediate
            .decrypt_key(envelope.wrapped_dek, envelope.intermediate_version)
            .await?;
        let dek = KeyMaterial::from_slice(algorithm, &dek_bytes);
        dek_bytes.zeroize();
        let dek = dek
            .map_err(|_| KeyError::IntegrityFailure("data key has wrong length".to_string()))?;

        open(&dek, DEK_VERSION, &payload_context(envelope.wrapped_dek), envelope.payload)
    }

    /// Intermediate version an envelope was sealed under, without decrypting
    pub fn envelope_version(envelope: &[u8]) -> KeyResult<u32> {
        Ok(ContentEnvelope::parse(envelope)?.intermediate_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_layout() {
        let encoded = ContentEnvelope {
            intermediate_version: 3,
            wrapped_dek: &[1, 2, 3],
            payload: &[9, 9],
        }
        .encode();
        assert_eq!(encoded, vec![1, 0, 0, 0, 3, 0, 0, 0, 3, 1, 2, 3, 9, 9]);

        let parsed = ContentEnvelope::parse(&encoded).unwrap();
        assert_eq!(parsed.intermediate_version, 3);
        assert_eq!(parsed.wrapped_dek, &[1, 2, 3]);
        assert_eq!(parsed.payload, &[9, 9]);
        assert_eq!(ContentCipher::envelope_version(&encoded).unwrap(), 3);
    }

    #[test]
    fn test_truncated_envelope_is_integrity_failure() {
        let mut encoded = ContentEnvelope {
            intermediate_version: 1,
            wrapped_dek: &[1, 2, 3, 4],
            payload: &[],
        }
        .encode();
        encoded.truncate(11);
        assert!(matches!(
            ContentEnvelope::parse(&encoded),
            Err(KeyError::IntegrityFailure(_))
        ));
        assert!(ContentEnvelope::parse(&[2, 0, 0, 0, 1, 0, 0, 0, 0]).is_err());
    }
}
