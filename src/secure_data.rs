//! The Secure Data Transfer codec: a symmetric-encryption tunnel carried as
//! an ordinary action payload.
//!
//! Binary layout (fixed order, fixed widths, little-endian):
//!
//!   0-1     parameter         u16
//!   2-3     keyId             u16
//!   4-11    nonce             u64
//!   12-19   counter           u64
//!   20-27   ciphertextLength  u64
//!   28..    ciphertext        bytes[ciphertextLength]
//!
//! The 16-byte AES IV is the 8-byte big-endian `nonce` followed by the 8-byte
//! big-endian `counter`, both directions. The pair `(keyId, nonce, counter)`
//! must never repeat for the same key: the legacy counter mode is a stream
//! cipher and keystream reuse breaks confidentiality. The codec cannot
//! enforce that invariant; nonce discipline belongs to the caller.
//!
//! The legacy mode provides confidentiality without integrity. The hardened
//! AES-GCM mode appends a 16-byte authentication tag to the ciphertext and
//! rejects tampering; it uses the first 12 bytes of the same IV construction
//! (nonce ‖ high 32 bits of the counter).

use crate::error::DecryptError;
use crate::keystore::KeyStore;
use aes::Aes128;
use aes_gcm::aead::{Aead, NewAead};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use ctr::cipher::{NewCipher, StreamCipher};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Action name under which the tunnel payload travels.
pub const SECURE_DATA_ACTION: &str = "SecureDataTransfer";

const HEADER_LEN: usize = 28;
const GCM_TAG_LEN: usize = 16;

/// Which cipher construction a tunnel endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// AES-128-CTR, wire compatible with legacy peers. No integrity.
    LegacyCtr,
    /// AES-128-GCM. Ciphertext carries a trailing authentication tag.
    AuthenticatedGcm,
}

/// The decoded tunnel payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SecureDataPayload {
    /// Application-defined discriminator for the inner plaintext.
    pub parameter: u16,
    pub key_id: u16,
    pub nonce: u64,
    pub counter: u64,
    pub ciphertext: Vec<u8>,
}

impl SecureDataPayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut vbytes: Vec<u8> = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        vbytes.extend(&self.parameter.to_le_bytes());
        vbytes.extend(&self.key_id.to_le_bytes());
        vbytes.extend(&self.nonce.to_le_bytes());
        vbytes.extend(&self.counter.to_le_bytes());
        vbytes.extend(&(self.ciphertext.len() as u64).to_le_bytes());
        vbytes.extend(&self.ciphertext);
        vbytes
    }

    pub fn deserialize(bytes: &[u8]) -> Result<SecureDataPayload, DecryptError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecryptError::Truncated {
                expected: HEADER_LEN,
                found: bytes.len(),
            });
        }
        let parameter = u16::from_le_bytes([bytes[0], bytes[1]]);
        let key_id = u16::from_le_bytes([bytes[2], bytes[3]]);
        let mut u64_buf = [0u8; 8];
        u64_buf.copy_from_slice(&bytes[4..12]);
        let nonce = u64::from_le_bytes(u64_buf);
        u64_buf.copy_from_slice(&bytes[12..20]);
        let counter = u64::from_le_bytes(u64_buf);
        u64_buf.copy_from_slice(&bytes[20..28]);
        let declared = u64::from_le_bytes(u64_buf);
        let remaining = (bytes.len() - HEADER_LEN) as u64;
        if declared != remaining {
            return Err(DecryptError::LengthMismatch {
                declared,
                remaining,
            });
        }
        Ok(SecureDataPayload {
            parameter,
            key_id,
            nonce,
            counter,
            ciphertext: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

fn build_iv(nonce: u64, counter: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&nonce.to_be_bytes());
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

/// Encrypt `plaintext` under the cipher key registered as `key_id`.
pub fn encrypt(
    keys: &KeyStore,
    mode: CipherMode,
    parameter: u16,
    key_id: u16,
    nonce: u64,
    counter: u64,
    plaintext: &[u8],
) -> Result<SecureDataPayload, DecryptError> {
    let key = keys
        .cipher_key(key_id)
        .ok_or(DecryptError::UnknownKeyId(key_id))?;
    let iv = build_iv(nonce, counter);
    let ciphertext = match mode {
        CipherMode::LegacyCtr => {
            let mut buffer = plaintext.to_vec();
            let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
            cipher.apply_keystream(&mut buffer);
            buffer
        }
        CipherMode::AuthenticatedGcm => {
            let cipher = Aes128Gcm::new(Key::from_slice(key));
            cipher
                .encrypt(Nonce::from_slice(&iv[..12]), plaintext)
                .map_err(|_| DecryptError::TagMismatch)?
        }
    };
    Ok(SecureDataPayload {
        parameter,
        key_id,
        nonce,
        counter,
        ciphertext,
    })
}

/// Decrypt a tunnel payload. In legacy mode a wrong key yields garbage
/// plaintext, not an error; only the authenticated mode can tell the
/// difference and reports it as a tag mismatch.
pub fn decrypt(
    keys: &KeyStore,
    mode: CipherMode,
    payload: &SecureDataPayload,
) -> Result<Vec<u8>, DecryptError> {
    let key = keys
        .cipher_key(payload.key_id)
        .ok_or(DecryptError::UnknownKeyId(payload.key_id))?;
    let iv = build_iv(payload.nonce, payload.counter);
    match mode {
        CipherMode::LegacyCtr => {
            let mut buffer = payload.ciphertext.clone();
            let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
            cipher.apply_keystream(&mut buffer);
            Ok(buffer)
        }
        CipherMode::AuthenticatedGcm => {
            if payload.ciphertext.len() < GCM_TAG_LEN {
                return Err(DecryptError::Truncated {
                    expected: GCM_TAG_LEN,
                    found: payload.ciphertext.len(),
                });
            }
            let cipher = Aes128Gcm::new(Key::from_slice(key));
            cipher
                .decrypt(Nonce::from_slice(&iv[..12]), payload.ciphertext.as_ref())
                .map_err(|_| DecryptError::TagMismatch)
        }
    }
}
