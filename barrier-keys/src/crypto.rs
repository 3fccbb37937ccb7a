//! Algorithms, key material and the authenticated envelope format
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
// Envelope layout produced by `seal`:
//
// ```text
// [ format (1) ][ algorithm (1) ][ key version (4, BE) ][ nonce (12) ][ ciphertext + tag ]
// ```
//
// The six header bytes are authenticated together with a caller-supplied
// context (tier, purpose, child version), so editing the version tag or
// replaying an envelope in another context fails tag verification.


use crate::error::{KeyError, KeyResult};
use crate::key_types::KeyTier;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of every key in the hierarchy (256 bits)
pub const KEY_LEN: usize = 32;

/// Size of the nonce in bytes (96 bits)
pub const NONCE_LEN: usize = 12;

/// Size of the authentication tag of both supported algorithms
pub const TAG_LEN: usize = 16;

/// Envelope format byte
pub const ENVELOPE_FORMAT: u8 = 1;

/// Size of the authenticated envelope header
pub const HEADER_LEN: usize = 6;

/// Supported authenticated-encryption algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "aes-256-gcm",
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Identifier written into envelope headers
    pub fn id(&self) -> u8 {
        match self {
            Algorithm::Aes256Gcm => 1,
            Algorithm::ChaCha20Poly1305 => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Algorithm::Aes256Gcm),
            2 => Some(Algorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    fn encrypt(
        &self,
        key: &KeyMaterial,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> KeyResult<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        let result = match self {
            Algorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|e| KeyError::Encryption(e.to_string()))?
                .encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|e| KeyError::Encryption(e.to_string()))?
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
        };
        result.map_err(|e| KeyError::Encryption(format!("{} encryption failed: {}", self, e)))
    }

    fn decrypt(
        &self,
        key: &KeyMaterial,
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> KeyResult<Vec<u8>> {
        let payload = Payload { msg: ciphertext, aad };
        let result = match self {
            Algorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|e| KeyError::Encryption(e.to_string()))?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|e| KeyError::Encryption(e.to_string()))?
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
        };
        result.map_err(|_| KeyError::IntegrityFailure(format!("{} tag verification failed", self)))
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = KeyError;

    fn from_str(s: &str) -> KeyResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(Algorithm::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            other => Err(KeyError::Configuration(format!("Unsupported algorithm: {}", other))),
        }
    }
}

/// Plaintext key material, tagged with the algorithm it is used with
///
/// Not `Clone`; shared through `Arc` by the cache. Zeroised on drop and never
/// printed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    #[zeroize(skip)]
    algorithm: Algorithm,
    bytes: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Fresh key material from the operating system CSPRNG
    pub fn generate(algorithm: Algorithm) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { algorithm, bytes }
    }

    pub fn from_bytes(algorithm: Algorithm, bytes: [u8; KEY_LEN]) -> Self {
        Self { algorithm, bytes }
    }

    pub fn from_slice(algorithm: Algorithm, bytes: &[u8]) -> KeyResult<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            KeyError::InvalidFormat(format!("Key material must be {} bytes", KEY_LEN))
        })?;
        Ok(Self { algorithm, bytes })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({}, <redacted>)", self.algorithm)
    }
}

/// The authenticated prefix of every envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub algorithm: Algorithm,
    /// Version of the key that sealed the envelope
    pub key_version: u32,
}

impl EnvelopeHeader {
    /// Parse the header of an envelope
    ///
    /// Malformed headers are reported as `IntegrityFailure`: they are
    /// indistinguishable from tampering.
    pub fn parse(envelope: &[u8]) -> KeyResult<Self> {
        if envelope.len() < HEADER_LEN + NONCE_LEN + TAG_LEN {
            return Err(KeyError::IntegrityFailure("envelope too short".to_string()));
        }
        if envelope[0] != ENVELOPE_FORMAT {
            return Err(KeyError::IntegrityFailure(format!(
                "unknown envelope format {}",
                envelope[0]
            )));
        }
        let algorithm = Algorithm::from_id(envelope[1]).ok_or_else(|| {
            KeyError::IntegrityFailure(format!("unknown algorithm id {}", envelope[1]))
        })?;
        let key_version = u32::from_be_bytes([envelope[2], envelope[3], envelope[4], envelope[5]]);
        Ok(Self {
            algorithm,
            key_version,
        })
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let v = self.key_version.to_be_bytes();
        [ENVELOPE_FORMAT, self.algorithm.id(), v[0], v[1], v[2], v[3]]
    }
}

fn aad(header: &[u8], context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + context.len());
    aad.extend_from_slice(header);
    aad.extend_from_slice(context);
    aad
}

/// Encrypt `plaintext` under `key`, binding `key_version` and `context`
pub fn seal(
    key: &KeyMaterial,
    key_version: u32,
    context: &[u8],
    plaintext: &[u8],
) -> KeyResult<Vec<u8>> {
    let algorithm = key.algorithm();
    let header = EnvelopeHeader {
        algorithm,
        key_version,
    }
    .encode();

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = algorithm.encrypt(key, &nonce, &aad(&header, context), plaintext)?;

    let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an envelope produced by `seal`
///
/// The header must name exactly the key's algorithm and `key_version`; any
/// mismatch, truncation or tag failure yields `IntegrityFailure` and no
/// plaintext.
pub fn open(
    key: &KeyMaterial,
    key_version: u32,
    context: &[u8],
    envelope: &[u8],
) -> KeyResult<Vec<u8>> {
    let algorithm = key.algorithm();
    let header = EnvelopeHeader::parse(envelope)?;
    if header.algorithm != algorithm || header.key_version != key_version {
        return Err(KeyError::IntegrityFailure(format!(
            "envelope sealed by {} v{} does not match {} v{}",
            header.algorithm, header.key_version, algorithm, key_version
        )));
    }

    let (head, rest) = envelope.split_at(HEADER_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    algorithm.decrypt(key, nonce, &aad(head, context), ciphertext)
}

fn wrap_context(child_tier: KeyTier, child_version: u32, child_algorithm: Algorithm) -> Vec<u8> {
    format!("wrap:{}:{}:{}", child_tier, child_version, child_algorithm).into_bytes()
}

/// Wrap a child key under its parent
///
/// The child's tier, version and algorithm are authenticated, so the result
/// only unwraps for the record it was produced for.
pub fn wrap_key(
    parent: &KeyMaterial,
    parent_version: u32,
    child_tier: KeyTier,
    child_version: u32,
    child: &KeyMaterial,
) -> KeyResult<Vec<u8>> {
    seal(
        parent,
        parent_version,
        &wrap_context(child_tier, child_version, child.algorithm()),
        child.as_bytes(),
    )
}

/// Unwrap a child key wrapped by `wrap_key`
pub fn unwrap_key(
    parent: &KeyMaterial,
    parent_version: u32,
    child_tier: KeyTier,
    child_version: u32,
    child_algorithm: Algorithm,
    wrapped: &[u8],
) -> KeyResult<KeyMaterial> {
    let mut plain = open(
        parent,
        parent_version,
        &wrap_context(child_tier, child_version, child_algorithm),
        wrapped,
    )?;
    let material = KeyMaterial::from_slice(child_algorithm, &plain);
    plain.zeroize();
    material.map_err(|_| KeyError::IntegrityFailure("unwrapped key has wrong length".to_string()))
}
