//! Agent identity: ed25519 keys and the identity registry contract.
//!
//! An agent proves who it is by signing the decimal string form of a unix
//! timestamp. The receiving side looks the claimed agent id up in an
//! [`IdentityRegistry`], verifies the signature against the bound public key
//! and then asks the registry whether the caller is authorized against the
//! endpoint owner.

use crate::error::{AipError, AipResult};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// An agent's signing key.
pub struct AgentKeypair {
    signing_key: SigningKey,
}

impl AgentKeypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load a keypair from a hex-encoded 32-byte seed.
    pub fn from_seed_hex(seed_hex: &str) -> AipResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(seed_hex.trim())
                .map_err(|e| AipError::Identity(format!("invalid seed hex: {e}")))?,
        );
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AipError::Identity("invalid seed length (expected 32 bytes)".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Hex-encoded seed, for writing to a key file.
    pub fn seed_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    /// Hex-encoded public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `message`, returning the hex-encoded signature.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for AgentKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentKeypair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Decode a hex-encoded 32-byte public key.
pub fn parse_public_key(public_key_hex: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(public_key_hex.trim()).map_err(|e| format!("invalid hex: {e}"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| "invalid public key length (expected 32 bytes)".to_string())
}

/// Verify a hex-encoded ed25519 signature over `message`.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature_hex: &str) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &signature).is_ok()
}

/// The identity/authorization service the auth gateway and worker
/// registration consult.
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    /// Bind `agent_id` to `public_key`.
    async fn register(&self, agent_id: &str, public_key: [u8; 32]) -> AipResult<()>;

    /// Look up the public key bound to `agent_id`.
    async fn get_public_key(&self, agent_id: &str) -> AipResult<Option<[u8; 32]>>;

    /// Whether `caller_id` may use endpoints owned by `owner_id`.
    async fn is_authorized(&self, owner_id: &str, caller_id: &str) -> AipResult<bool>;

    /// Verify `signature_hex` over `message` against `agent_id`'s key.
    /// Unknown agents never verify.
    async fn verify(&self, agent_id: &str, message: &[u8], signature_hex: &str) -> AipResult<bool> {
        Ok(match self.get_public_key(agent_id).await? {
            Some(pk) => verify_signature(&pk, message, signature_hex),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let kp = AgentKeypair::generate();
        let pk = parse_public_key(&kp.public_key_hex()).unwrap();
        let sig = kp.sign(b"1700000000");
        assert!(verify_signature(&pk, b"1700000000", &sig));
        assert!(!verify_signature(&pk, b"1700000001", &sig));
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = AgentKeypair::generate();
        let bob = AgentKeypair::generate();
        let alice_pk = parse_public_key(&alice.public_key_hex()).unwrap();
        let sig = bob.sign(b"1000");
        assert!(!verify_signature(&alice_pk, b"1000", &sig));
    }

    #[test]
    fn test_seed_roundtrip_preserves_identity() {
        let kp = AgentKeypair::generate();
        let restored = AgentKeypair::from_seed_hex(&kp.seed_hex()).unwrap();
        assert_eq!(kp.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(AgentKeypair::from_seed_hex("zz").is_err());
        assert!(AgentKeypair::from_seed_hex("abcd").is_err());
        assert!(parse_public_key("00ff").is_err());

        let kp = AgentKeypair::generate();
        let pk = parse_public_key(&kp.public_key_hex()).unwrap();
        assert!(!verify_signature(&pk, b"x", "not-hex"));
        assert!(!verify_signature(&pk, b"x", "abcd"));
    }
}
