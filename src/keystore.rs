//! Key material for the signature policy engine and the Secure Data Transfer
//! codec.
//!
//! Signing keys are secp256k1 keypairs addressed by a string key id; cipher
//! keys are 128-bit AES keys addressed by the numeric key id carried in the
//! Secure Data Transfer payload. Every lookup goes through this store — there
//! is deliberately no fallback key of any kind.

use base58::ToBase58;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use std::collections::HashMap;

/// An secp256k1 keypair for signing and verifying envelopes.
#[derive(Debug, Clone, PartialEq)]
pub struct SigningKeypair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl SigningKeypair {
    /// Create a keypair with a randomly generated private key.
    pub fn generate() -> SigningKeypair {
        let (secret_key, public_key) =
            SECP256K1.generate_keypair(&mut secp256k1::rand::thread_rng());
        SigningKeypair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_slice(slice: &[u8]) -> crate::Result<SigningKeypair> {
        let secret_key = SecretKey::from_slice(slice)
            .map_err(|e| crate::Error::UnknownKey(format!("bad secret key: {}", e)))?;
        let public_key = PublicKey::from_secret_key(&SECP256K1, &secret_key);
        Ok(SigningKeypair {
            secret_key,
            public_key,
        })
    }

    pub fn from_secret_hex(secret_hex: &str) -> crate::Result<SigningKeypair> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(secret_hex, &mut bytes as &mut [u8])
            .map_err(|e| crate::Error::UnknownKey(format!("bad secret hex: {}", e)))?;
        SigningKeypair::from_secret_slice(&bytes)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Base58 fingerprint of the public key, for logs and provisioning.
    pub fn address(&self) -> String {
        self.public_key.serialize().to_base58()
    }
}

/// Resolves key ids to key material.
#[derive(Debug, Default)]
pub struct KeyStore {
    signing: HashMap<String, SigningKeypair>,
    verify_only: HashMap<String, PublicKey>,
    cipher: HashMap<u16, [u8; 16]>,
}

impl KeyStore {
    pub fn new() -> KeyStore {
        KeyStore::default()
    }

    pub fn add_signing(&mut self, key_id: &str, keypair: SigningKeypair) {
        self.signing.insert(key_id.to_string(), keypair);
    }

    /// Register a peer's public key for verification. Accepts the 33-byte
    /// compressed SEC1 encoding in hex.
    pub fn add_verify_hex(&mut self, key_id: &str, public_hex: &str) -> crate::Result<()> {
        let bytes = hex::decode(public_hex)
            .map_err(|e| crate::Error::UnknownKey(format!("bad public hex: {}", e)))?;
        let public_key = PublicKey::from_slice(&bytes)
            .map_err(|e| crate::Error::UnknownKey(format!("bad public key: {}", e)))?;
        self.verify_only.insert(key_id.to_string(), public_key);
        Ok(())
    }

    pub fn add_cipher(&mut self, key_id: u16, key: [u8; 16]) {
        self.cipher.insert(key_id, key);
    }

    pub fn add_cipher_hex(&mut self, key_id: u16, key_hex: &str) -> crate::Result<()> {
        let mut key = [0u8; 16];
        hex::decode_to_slice(key_hex, &mut key as &mut [u8])
            .map_err(|e| crate::Error::UnknownKey(format!("bad cipher hex: {}", e)))?;
        self.add_cipher(key_id, key);
        Ok(())
    }

    pub fn signing_keypair(&self, key_id: &str) -> Option<&SigningKeypair> {
        self.signing.get(key_id)
    }

    /// Public key for a key id, whether we hold the full keypair or only the
    /// verification half.
    pub fn public_key(&self, key_id: &str) -> Option<&PublicKey> {
        self.signing
            .get(key_id)
            .map(|kp| kp.public_key())
            .or_else(|| self.verify_only.get(key_id))
    }

    pub fn cipher_key(&self, key_id: u16) -> Option<&[u8; 16]> {
        self.cipher.get(&key_id)
    }
}
