//! The signature policy engine.
//!
//! An ordered list of [`SigningRule`]s decides which envelopes get signed or
//! must verify, and with which keys. The first rule whose applicability
//! predicate matches wins. The digest is computed over exactly the selected
//! envelope fields, serialized deterministically (sorted field names, length
//! prefixes), so adding or removing any field breaks verification.

use crate::envelope::Envelope;
use crate::error::SignatureError;
use crate::keystore::KeyStore;
use crate::routing::NodeRole;
use secp256k1::{Message, Signature as SecpSignature, SECP256K1};
use sha2::{Digest, Sha256};

/// Supported asymmetric signature schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// secp256k1 ECDSA over a SHA-256 field digest.
    EcdsaSecp256k1Sha256,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::EcdsaSecp256k1Sha256 => "ES256K",
        }
    }

    pub fn from_name(name: &str) -> Option<SignatureAlgorithm> {
        match name {
            "ES256K" => Some(SignatureAlgorithm::EcdsaSecp256k1Sha256),
            _ => None,
        }
    }

    pub fn wire_id(&self) -> u8 {
        match self {
            SignatureAlgorithm::EcdsaSecp256k1Sha256 => 1,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<SignatureAlgorithm> {
        match id {
            1 => Some(SignatureAlgorithm::EcdsaSecp256k1Sha256),
            _ => None,
        }
    }
}

/// A signature record attached to an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub key_id: String,
    pub algorithm: SignatureAlgorithm,
    /// The envelope fields the digest covers, exactly.
    pub signed_fields: Vec<String>,
    /// Compact 64-byte ECDSA signature.
    pub bytes: Vec<u8>,
}

/// Which way a message is travelling relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Which envelope fields a rule covers.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSelector {
    /// Every field present on the envelope at signing time.
    AllPresent,
    /// A fixed set; fields absent from the envelope are skipped at signing
    /// time but recorded exactly as signed for verification.
    Fields(Vec<String>),
}

impl FieldSelector {
    fn select(&self, envelope: &Envelope) -> Vec<String> {
        match self {
            FieldSelector::AllPresent => envelope.present_fields(),
            FieldSelector::Fields(fields) => fields
                .iter()
                .filter(|f| envelope.field_bytes(f).is_some())
                .cloned()
                .collect(),
        }
    }
}

/// One entry of the ordered policy.
#[derive(Debug, Clone)]
pub struct SigningRule {
    /// `None` matches both directions.
    pub direction: Option<Direction>,
    /// `None` matches every action; responses and errors carry no action and
    /// match only action-less rules.
    pub action: Option<String>,
    /// `None` matches whatever role the local node has.
    pub role: Option<NodeRole>,
    pub key_id: String,
    pub selector: FieldSelector,
}

impl SigningRule {
    fn matches(&self, direction: Direction, action: Option<&str>, role: NodeRole) -> bool {
        if let Some(rule_direction) = self.direction {
            if rule_direction != direction {
                return false;
            }
        }
        if let Some(rule_action) = &self.action {
            match action {
                Some(action) if action == rule_action => {}
                _ => return false,
            }
        }
        if let Some(rule_role) = self.role {
            if rule_role != role {
                return false;
            }
        }
        true
    }
}

/// What to do with a message no rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsignedPolicy {
    Allow,
    Reject,
}

/// How multiple attached signatures combine on verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Every attached signature must verify (default).
    All,
    /// At least one attached signature must verify.
    Any,
}

/// The configured rule set. First matching rule wins.
#[derive(Debug, Clone)]
pub struct SignaturePolicy {
    rules: Vec<SigningRule>,
    pub unsigned: UnsignedPolicy,
    pub verify_mode: VerifyMode,
}

impl Default for SignaturePolicy {
    fn default() -> SignaturePolicy {
        SignaturePolicy {
            rules: vec![],
            unsigned: UnsignedPolicy::Allow,
            verify_mode: VerifyMode::All,
        }
    }
}

impl SignaturePolicy {
    pub fn new() -> SignaturePolicy {
        SignaturePolicy::default()
    }

    pub fn push_rule(&mut self, rule: SigningRule) {
        self.rules.push(rule);
    }

    fn first_match(
        &self,
        direction: Direction,
        action: Option<&str>,
        role: NodeRole,
    ) -> Option<&SigningRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(direction, action, role))
    }

    /// Sign `envelope` according to the first matching rule. With no matching
    /// rule the envelope goes out unsigned, unless the policy rejects
    /// unsigned traffic. Re-signing with the same key id replaces the
    /// existing record instead of appending a second one.
    pub fn sign(
        &self,
        envelope: &mut Envelope,
        direction: Direction,
        role: NodeRole,
        keys: &KeyStore,
    ) -> Result<(), SignatureError> {
        let rule = match self.first_match(direction, envelope.action.as_deref(), role) {
            Some(rule) => rule,
            None => {
                return match self.unsigned {
                    UnsignedPolicy::Allow => Ok(()),
                    UnsignedPolicy::Reject => Err(SignatureError::UnsignedRejected(
                        envelope.action.clone().unwrap_or_default(),
                    )),
                };
            }
        };

        let keypair = keys
            .signing_keypair(&rule.key_id)
            .ok_or_else(|| SignatureError::UnknownKeyId(rule.key_id.clone()))?;

        let signed_fields = rule.selector.select(envelope);
        let digest = field_digest(envelope, &signed_fields)?;
        let message = Message::from_slice(&digest)
            .map_err(|_| SignatureError::InvalidSignature(rule.key_id.clone()))?;
        let sig = SECP256K1.sign(&message, keypair.secret_key());

        envelope.signatures.retain(|s| s.key_id != rule.key_id);
        envelope.signatures.push(Signature {
            key_id: rule.key_id.clone(),
            algorithm: SignatureAlgorithm::EcdsaSecp256k1Sha256,
            signed_fields,
            bytes: sig.serialize_compact().to_vec(),
        });
        Ok(())
    }

    /// Verify every signature attached to `envelope` and enforce the
    /// signing mandate for its direction/action. Returns the typed reason on
    /// rejection, never panics.
    pub fn verify(
        &self,
        envelope: &Envelope,
        direction: Direction,
        role: NodeRole,
        keys: &KeyStore,
    ) -> Result<(), SignatureError> {
        let mandated = self
            .first_match(direction, envelope.action.as_deref(), role)
            .is_some();

        if envelope.signatures.is_empty() {
            if mandated {
                return Err(SignatureError::MissingSignature);
            }
            return match self.unsigned {
                UnsignedPolicy::Allow => Ok(()),
                UnsignedPolicy::Reject => Err(SignatureError::UnsignedRejected(
                    envelope.action.clone().unwrap_or_default(),
                )),
            };
        }

        let mut first_failure: Option<SignatureError> = None;
        let mut any_passed = false;
        for sig in &envelope.signatures {
            match verify_one(envelope, sig, keys) {
                Ok(()) => any_passed = true,
                Err(err) => {
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }
        match self.verify_mode {
            VerifyMode::All => match first_failure {
                Some(err) => Err(err),
                None => Ok(()),
            },
            VerifyMode::Any => {
                if any_passed {
                    Ok(())
                } else {
                    Err(first_failure.unwrap_or(SignatureError::MissingSignature))
                }
            }
        }
    }
}

fn verify_one(
    envelope: &Envelope,
    sig: &Signature,
    keys: &KeyStore,
) -> Result<(), SignatureError> {
    let public_key = keys
        .public_key(&sig.key_id)
        .ok_or_else(|| SignatureError::UnknownKeyId(sig.key_id.clone()))?;
    let digest = field_digest(envelope, &sig.signed_fields)?;
    let message = Message::from_slice(&digest)
        .map_err(|_| SignatureError::InvalidSignature(sig.key_id.clone()))?;
    let secp_sig = SecpSignature::from_compact(&sig.bytes)
        .map_err(|_| SignatureError::InvalidSignature(sig.key_id.clone()))?;
    SECP256K1
        .verify(&message, &secp_sig, public_key)
        .map_err(|_| SignatureError::InvalidSignature(sig.key_id.clone()))
}

/// SHA-256 over the named fields in sorted order, each as
/// `u16 nameLength ‖ name ‖ u64 valueLength ‖ value`. A field named but
/// absent from the envelope is a verification failure, not a skip.
fn field_digest(envelope: &Envelope, fields: &[String]) -> Result<[u8; 32], SignatureError> {
    let mut sorted: Vec<&String> = fields.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for name in sorted {
        let value = envelope
            .field_bytes(name)
            .ok_or_else(|| SignatureError::MissingField(name.clone()))?;
        hasher.update(&(name.len() as u16).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&(value.len() as u64).to_be_bytes());
        hasher.update(&value);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(hasher.finalize().as_slice());
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::SigningKeypair;

    fn keyed_store(key_id: &str) -> KeyStore {
        let mut store = KeyStore::new();
        store.add_signing(key_id, SigningKeypair::generate());
        store
    }

    fn sign_everything_policy(key_id: &str) -> SignaturePolicy {
        let mut policy = SignaturePolicy::new();
        policy.push_rule(SigningRule {
            direction: None,
            action: None,
            role: None,
            key_id: key_id.to_string(),
            selector: FieldSelector::AllPresent,
        });
        policy
    }

    fn sample_request() -> Envelope {
        Envelope::new_request("r-1", "Authorize", br#"{"idToken":"ABC123"}"#.to_vec())
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let store = keyed_store("k1");
        let policy = sign_everything_policy("k1");
        let mut envelope = sample_request();
        policy
            .sign(&mut envelope, Direction::Outbound, NodeRole::ChargingStation, &store)
            .unwrap();
        assert_eq!(envelope.signatures.len(), 1);
        assert_eq!(envelope.signatures[0].key_id, "k1");
        policy
            .verify(&envelope, Direction::Inbound, NodeRole::Csms, &store)
            .unwrap();
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let store = keyed_store("k1");
        let policy = sign_everything_policy("k1");
        let mut envelope = sample_request();
        policy
            .sign(&mut envelope, Direction::Outbound, NodeRole::ChargingStation, &store)
            .unwrap();

        // Flip one bit of the signed payload.
        envelope.payload[3] ^= 0x01;
        match policy.verify(&envelope, Direction::Inbound, NodeRole::Csms, &store) {
            Err(SignatureError::InvalidSignature(key)) => assert_eq!(key, "k1"),
            other => panic!("expected InvalidSignature, got {:?}", other),
        }
    }

    #[test]
    fn test_extra_field_breaks_digest() {
        // Signing covered the envelope without a destination; adding one
        // afterwards must not go unnoticed when it is a signed field.
        let store = keyed_store("k1");
        let mut policy = SignaturePolicy::new();
        policy.push_rule(SigningRule {
            direction: None,
            action: None,
            role: None,
            key_id: "k1".to_string(),
            selector: FieldSelector::Fields(vec![
                "requestId".to_string(),
                "payload".to_string(),
            ]),
        });
        let mut envelope = sample_request();
        policy
            .sign(&mut envelope, Direction::Outbound, NodeRole::ChargingStation, &store)
            .unwrap();

        // Claim an additional signed field that was never hashed.
        envelope.signatures[0].signed_fields.push("action".to_string());
        assert!(policy
            .verify(&envelope, Direction::Inbound, NodeRole::Csms, &store)
            .is_err());
    }

    #[test]
    fn test_signature_survives_text_codec_hop() {
        // The digest covers raw payload bytes, so a decode/encode hop on the
        // JSON codec must leave a non-canonically-ordered payload untouched.
        let store = keyed_store("k1");
        let policy = sign_everything_policy("k1");
        let mut envelope =
            Envelope::new_request("r-hop", "DataTransfer", br#"{"b":1,"a":2}"#.to_vec());
        policy
            .sign(&mut envelope, Direction::Outbound, NodeRole::ChargingStation, &store)
            .unwrap();

        let bytes = crate::envelope::encode(&envelope, false).unwrap();
        let decoded = crate::envelope::decode(&bytes, false).unwrap();
        policy
            .verify(&decoded, Direction::Inbound, NodeRole::Csms, &store)
            .unwrap();
    }

    #[test]
    fn test_re_sign_replaces_not_appends() {
        let store = keyed_store("k1");
        let policy = sign_everything_policy("k1");
        let mut envelope = sample_request();
        policy
            .sign(&mut envelope, Direction::Outbound, NodeRole::ChargingStation, &store)
            .unwrap();
        policy
            .sign(&mut envelope, Direction::Outbound, NodeRole::ChargingStation, &store)
            .unwrap();
        assert_eq!(envelope.signatures.len(), 1);
    }

    #[test]
    fn test_mandated_signature_missing() {
        let store = keyed_store("k1");
        let mut policy = SignaturePolicy::new();
        policy.push_rule(SigningRule {
            direction: Some(Direction::Inbound),
            action: Some("Authorize".to_string()),
            role: None,
            key_id: "k1".to_string(),
            selector: FieldSelector::AllPresent,
        });
        let envelope = sample_request();
        match policy.verify(&envelope, Direction::Inbound, NodeRole::Csms, &store) {
            Err(SignatureError::MissingSignature) => {}
            other => panic!("expected MissingSignature, got {:?}", other),
        }
        // A different action is not mandated and passes unsigned.
        let other = Envelope::new_request("r-2", "Heartbeat", b"{}".to_vec());
        policy
            .verify(&other, Direction::Inbound, NodeRole::Csms, &store)
            .unwrap();
    }

    #[test]
    fn test_unsigned_rejected_policy() {
        let store = KeyStore::new();
        let mut policy = SignaturePolicy::new();
        policy.unsigned = UnsignedPolicy::Reject;
        let envelope = sample_request();
        assert!(matches!(
            policy.verify(&envelope, Direction::Inbound, NodeRole::Csms, &store),
            Err(SignatureError::UnsignedRejected(_))
        ));
    }

    #[test]
    fn test_verify_any_mode() {
        let mut store = keyed_store("good");
        store.add_signing("other", SigningKeypair::generate());
        let policy = sign_everything_policy("good");
        let mut envelope = sample_request();
        policy
            .sign(&mut envelope, Direction::Outbound, NodeRole::ChargingStation, &store)
            .unwrap();

        // Attach a second, corrupt signature under a known key.
        let mut bogus = envelope.signatures[0].clone();
        bogus.key_id = "other".to_string();
        envelope.signatures.push(bogus);

        let mut any_policy = sign_everything_policy("good");
        any_policy.verify_mode = VerifyMode::Any;
        any_policy
            .verify(&envelope, Direction::Inbound, NodeRole::Csms, &store)
            .unwrap();

        // Default mode requires them all.
        assert!(policy
            .verify(&envelope, Direction::Inbound, NodeRole::Csms, &store)
            .is_err());
    }

    #[test]
    fn test_unknown_signer_key() {
        let store = KeyStore::new();
        let signer_store = keyed_store("k1");
        let policy = sign_everything_policy("k1");
        let mut envelope = sample_request();
        policy
            .sign(&mut envelope, Direction::Outbound, NodeRole::ChargingStation, &signer_store)
            .unwrap();
        assert!(matches!(
            policy.verify(&envelope, Direction::Inbound, NodeRole::Csms, &store),
            Err(SignatureError::UnknownKeyId(_))
        ));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut store = keyed_store("specific");
        store.add_signing("fallback", SigningKeypair::generate());
        let mut policy = SignaturePolicy::new();
        policy.push_rule(SigningRule {
            direction: Some(Direction::Outbound),
            action: Some("Authorize".to_string()),
            role: None,
            key_id: "specific".to_string(),
            selector: FieldSelector::AllPresent,
        });
        policy.push_rule(SigningRule {
            direction: None,
            action: None,
            role: None,
            key_id: "fallback".to_string(),
            selector: FieldSelector::AllPresent,
        });

        let mut envelope = sample_request();
        policy
            .sign(&mut envelope, Direction::Outbound, NodeRole::ChargingStation, &store)
            .unwrap();
        assert_eq!(envelope.signatures[0].key_id, "specific");

        let mut heartbeat = Envelope::new_request("r-3", "Heartbeat", b"{}".to_vec());
        policy
            .sign(&mut heartbeat, Direction::Outbound, NodeRole::ChargingStation, &store)
            .unwrap();
        assert_eq!(heartbeat.signatures[0].key_id, "fallback");
    }
}
