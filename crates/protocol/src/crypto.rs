//! Key material and the sealing capability used by the envelope codec.
//!
//! Every frame body is sealed with a static X25519 key agreement between the
//! sender and the recipient, encrypted with XChaCha20-Poly1305, and signed
//! with the sender's Ed25519 key.
//!
//! # Sealed Packet Format
//!
//! ```text
//! offset 0..8        : unix timestamp in seconds, u64 little-endian
//! offset 8..N-64     : XChaCha20-Poly1305 ciphertext (includes 16-byte tag)
//! offset N-64..N     : Ed25519 signature over bytes 0..N-64
//! ```
//!
//! The AEAD nonce is the timestamp repeated three times, so the timestamp is
//! bound both by the signature and by the ciphertext.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{ProtocolError, Result};

/// Length of every key and seed in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of the timestamp prefix of a sealed packet.
pub const TIMESTAMP_LENGTH: usize = 8;

/// Length of the Poly1305 authentication tag.
pub const TAG_LENGTH: usize = 16;

/// Bytes a sealed packet adds on top of the plaintext.
pub const SEAL_OVERHEAD: usize = TIMESTAMP_LENGTH + TAG_LENGTH + SIGNATURE_LENGTH;

/// A 32-byte random seed from which exchange and signing secrets are derived.
pub type Seed = [u8; KEY_LENGTH];

/// Returns the current wall-clock time in whole seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generates a fresh seed from the operating system RNG.
pub fn random_seed() -> Seed {
    let mut seed = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// Derives the X25519 public key for an exchange secret.
pub fn derive_exchange_public(secret: &StaticSecret) -> PublicKey {
    PublicKey::from(secret)
}

/// Derives the Ed25519 verifying key for a signing secret.
pub fn derive_signing_public(secret: &SigningKey) -> VerifyingKey {
    secret.verifying_key()
}

/// Produces a detached Ed25519 signature.
pub fn sign(data: &[u8], secret: &SigningKey) -> [u8; SIGNATURE_LENGTH] {
    secret.sign(data).to_bytes()
}

/// Verifies a detached Ed25519 signature.
pub fn verify(data: &[u8], signature: &[u8; SIGNATURE_LENGTH], public: &VerifyingKey) -> Result<()> {
    public
        .verify(data, &Signature::from_bytes(signature))
        .map_err(ProtocolError::from)
}

/// Parses a 32-byte key written as 64 hex digits or 43 URL-safe base64 characters.
pub fn parse_key(text: &str) -> Result<[u8; KEY_LENGTH]> {
    let text = text.trim();
    let bytes = if text.len() == KEY_LENGTH * 2 {
        hex::decode(text).map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?
    } else {
        URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?
    };

    bytes.as_slice().try_into().map_err(|_| {
        ProtocolError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            KEY_LENGTH,
            bytes.len()
        ))
    })
}

/// Formats a key as lowercase hex, the form used in endpoint URLs and config files.
pub fn encode_key(key: &[u8; KEY_LENGTH]) -> String {
    hex::encode(key)
}

/// The capability that seals and opens frame bodies.
///
/// The envelope codec only talks to this trait, so tests and alternative
/// cipher suites can be swapped in without touching the wire layer.
pub trait SealingSuite: Send + Sync {
    /// Encrypts `plaintext` for `peer_exchange_public` and signs the result.
    fn encrypt_and_sign(
        &self,
        plaintext: &[u8],
        my_exchange_secret: &StaticSecret,
        my_signing_secret: &SigningKey,
        peer_exchange_public: &PublicKey,
        now: u64,
    ) -> Result<Vec<u8>>;

    /// Verifies the sender signature and freshness, then decrypts.
    ///
    /// A `max_skew_secs` of zero disables the freshness check.
    fn verify_and_decrypt(
        &self,
        packet: &[u8],
        my_exchange_secret: &StaticSecret,
        peer_exchange_public: &PublicKey,
        peer_signing_public: &VerifyingKey,
        max_skew_secs: u64,
        now: u64,
    ) -> Result<Vec<u8>>;
}

/// X25519 + XChaCha20-Poly1305 + Ed25519 sealing suite.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crypto25519;

impl Crypto25519 {
    fn cipher(my_secret: &StaticSecret, peer_public: &PublicKey) -> XChaCha20Poly1305 {
        let shared = my_secret.diffie_hellman(peer_public);
        XChaCha20Poly1305::new(Key::from_slice(shared.as_bytes()))
    }

    fn nonce(timestamp: u64) -> XNonce {
        let ts = timestamp.to_le_bytes();
        let mut nonce = [0u8; 24];
        for chunk in nonce.chunks_mut(TIMESTAMP_LENGTH) {
            chunk.copy_from_slice(&ts);
        }
        XNonce::clone_from_slice(&nonce)
    }
}

impl SealingSuite for Crypto25519 {
    fn encrypt_and_sign(
        &self,
        plaintext: &[u8],
        my_exchange_secret: &StaticSecret,
        my_signing_secret: &SigningKey,
        peer_exchange_public: &PublicKey,
        now: u64,
    ) -> Result<Vec<u8>> {
        let ciphertext = Self::cipher(my_exchange_secret, peer_exchange_public)
            .encrypt(&Self::nonce(now), plaintext)
            .map_err(|_| ProtocolError::Encryption("aead seal failed".to_string()))?;

        let mut packet = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        packet.extend_from_slice(&now.to_le_bytes());
        packet.extend_from_slice(&ciphertext);
        let signature = sign(&packet, my_signing_secret);
        packet.extend_from_slice(&signature);

        Ok(packet)
    }

    fn verify_and_decrypt(
        &self,
        packet: &[u8],
        my_exchange_secret: &StaticSecret,
        peer_exchange_public: &PublicKey,
        peer_signing_public: &VerifyingKey,
        max_skew_secs: u64,
        now: u64,
    ) -> Result<Vec<u8>> {
        if packet.len() < TIMESTAMP_LENGTH + SIGNATURE_LENGTH {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} bytes cannot hold timestamp and signature",
                packet.len()
            )));
        }

        let (signed, signature) = packet.split_at(packet.len() - SIGNATURE_LENGTH);
        let signature: [u8; SIGNATURE_LENGTH] = signature
            .try_into()
            .map_err(|_| ProtocolError::MalformedPacket("bad signature length".to_string()))?;
        verify(signed, &signature, peer_signing_public)?;

        let (ts, ciphertext) = signed.split_at(TIMESTAMP_LENGTH);
        let mut ts_bytes = [0u8; TIMESTAMP_LENGTH];
        ts_bytes.copy_from_slice(ts);
        let timestamp = u64::from_le_bytes(ts_bytes);

        if max_skew_secs > 0 && now.abs_diff(timestamp) > max_skew_secs {
            return Err(ProtocolError::StaleMessage {
                timestamp,
                now,
                max_skew: max_skew_secs,
            });
        }

        let plaintext = Self::cipher(my_exchange_secret, peer_exchange_public)
            .decrypt(&Self::nonce(timestamp), ciphertext)?;
        Ok(plaintext)
    }
}

/// The local identity: both secret keys. Never leaves the process.
#[derive(Clone)]
pub struct LocalIdentity {
    exchange_secret: StaticSecret,
    signing_key: SigningKey,
}

impl LocalIdentity {
    /// Generates a new identity from two fresh random seeds.
    pub fn generate() -> Self {
        Self::from_seeds(&random_seed(), &random_seed())
    }

    /// Rebuilds an identity from its exchange and signing seeds.
    pub fn from_seeds(exchange_seed: &Seed, signing_seed: &Seed) -> Self {
        Self {
            exchange_secret: StaticSecret::from(*exchange_seed),
            signing_key: SigningKey::from_bytes(signing_seed),
        }
    }

    /// Returns the exchange secret.
    pub fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange_secret
    }

    /// Returns the signing secret.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Returns the exchange seed bytes.
    ///
    /// **Security Warning**: only use this for persisting the identity.
    pub fn exchange_seed(&self) -> Seed {
        self.exchange_secret.to_bytes()
    }

    /// Returns the signing seed bytes.
    ///
    /// **Security Warning**: only use this for persisting the identity.
    pub fn signing_seed(&self) -> Seed {
        self.signing_key.to_bytes()
    }

    /// Returns the public half of this identity, as peers would store it.
    pub fn public_keys(&self) -> PeerKeys {
        PeerKeys {
            exchange: derive_exchange_public(&self.exchange_secret),
            signing: derive_signing_public(&self.signing_key),
        }
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("fingerprint", &self.public_keys().fingerprint())
            .field("exchange_secret", &"[REDACTED]")
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// The public keys of a peer: X25519 for key agreement, Ed25519 for signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerKeys {
    /// X25519 public key.
    pub exchange: PublicKey,
    /// Ed25519 verifying key.
    pub signing: VerifyingKey,
}

impl PeerKeys {
    /// Builds peer keys from raw bytes, validating the signing key.
    pub fn from_bytes(exchange: &[u8; KEY_LENGTH], signing: &[u8; KEY_LENGTH]) -> Result<Self> {
        let signing = VerifyingKey::from_bytes(signing)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        Ok(Self {
            exchange: PublicKey::from(*exchange),
            signing,
        })
    }

    /// Parses peer keys from their text form (hex or base64url).
    pub fn parse(exchange: &str, signing: &str) -> Result<Self> {
        Self::from_bytes(&parse_key(exchange)?, &parse_key(signing)?)
    }

    /// Returns the exchange public key bytes.
    pub fn exchange_bytes(&self) -> [u8; KEY_LENGTH] {
        self.exchange.to_bytes()
    }

    /// Returns the signing public key bytes.
    pub fn signing_bytes(&self) -> [u8; KEY_LENGTH] {
        self.signing.to_bytes()
    }

    /// Short human-readable fingerprint of both keys, e.g. `a1b2:c3d4:e5f6:7890`.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.exchange.as_bytes());
        hasher.update(self.signing.as_bytes());
        let hash = hasher.finalize();

        hash[..8]
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Text form of [`PeerKeys`] used in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKeysText {
    /// Exchange public key, hex or base64url.
    pub x: String,
    /// Signing public key, hex or base64url.
    pub ed: String,
}

impl From<&PeerKeys> for PeerKeysText {
    fn from(keys: &PeerKeys) -> Self {
        Self {
            x: encode_key(&keys.exchange_bytes()),
            ed: encode_key(&keys.signing_bytes()),
        }
    }
}

impl TryFrom<&PeerKeysText> for PeerKeys {
    type Error = ProtocolError;

    fn try_from(text: &PeerKeysText) -> Result<Self> {
        PeerKeys::parse(&text.x, &text.ed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAINTEXT: &str = r#"{"key":"Какой-то текст"}"#;
    const TIMESTAMP: u64 = 1_764_020_895;

    fn key(hex_str: &str) -> [u8; KEY_LENGTH] {
        <[u8; KEY_LENGTH]>::try_from(hex::decode(hex_str).unwrap().as_slice()).unwrap()
    }

    fn fixture_packet() -> Vec<u8> {
        let mut packet = hex::decode(
            "9fd22469000000001b3518ec11aab49db6a1199de6db109314419b83988897fb66dd724612def8f8ebc6ebef9a42c07eb7daef2904c0252fcd734099",
        )
        .unwrap();
        packet.extend(
            hex::decode(
                "2ebf005211c796dc7a5f02b84e115f0fa7e1803f801f6d41c611ed419d40999b21125c7ecdc91cd83e1b398b0929ced3129db1486e3c6475a18382dc4749ed0c",
            )
            .unwrap(),
        );
        packet
    }

    #[test]
    fn test_exchange_public_known_answer() {
        let secret = StaticSecret::from(key(
            "588b7ecfe76faa5022ae7884f7f148d0b801e58ce8783d99bee69fb9e8029f71",
        ));
        assert_eq!(
            derive_exchange_public(&secret).to_bytes(),
            key("00525d3ade51dbfb083b3c1fdf63b4a83fe5bef9f95deaf5f3278ccf816a7e0a")
        );
    }

    #[test]
    fn test_unclamped_seed_derives_same_public() {
        // Clamping happens inside the scalar multiplication.
        let seed = key("5e8b7ecfe76faa5022ae7884f7f148d0b801e58ce8783d99bee69fb9e8029f71");
        let clamped = key("588b7ecfe76faa5022ae7884f7f148d0b801e58ce8783d99bee69fb9e8029f71");
        assert_eq!(
            derive_exchange_public(&StaticSecret::from(seed)),
            derive_exchange_public(&StaticSecret::from(clamped))
        );
    }

    #[test]
    fn test_seal_known_answer() {
        let my_x = StaticSecret::from(key(
            "481179010ae65f2bc7508430ac270386953aa75930042e22c184b78b41e95747",
        ));
        let my_ed = SigningKey::from_bytes(&key(
            "454b10b610f9a3a99cd577e6d50a9fbabaa8e50e134b250f2695d17ca446f40e",
        ));
        let he_x = PublicKey::from(key(
            "2dfb6cf139728610e7766833862dc708cf9ff38a0f7c4b55c68b3bc0cc73d536",
        ));

        let packet = Crypto25519
            .encrypt_and_sign(PLAINTEXT.as_bytes(), &my_x, &my_ed, &he_x, TIMESTAMP)
            .unwrap();

        assert_eq!(packet, fixture_packet());
    }

    #[test]
    fn test_open_known_answer() {
        let he_x = StaticSecret::from(key(
            "a0d70cf83f6db80d093646d66fee62c422a1e160c3d4cd52ef44fd0f2698127d",
        ));
        let my_x_public = PublicKey::from(key(
            "af2af6e676e7801fc0b150733f79a20d6897b1c9cb4df3f651df81b180ca086e",
        ));
        let my_ed_public = VerifyingKey::from_bytes(&key(
            "e498d275fe727bd9150b504d18b65b567516fd4ac3d0ed5e58a50475e8138d8f",
        ))
        .unwrap();

        let plaintext = Crypto25519
            .verify_and_decrypt(&fixture_packet(), &he_x, &my_x_public, &my_ed_public, 5, TIMESTAMP + 3)
            .unwrap();

        assert_eq!(plaintext, PLAINTEXT.as_bytes());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let now = unix_now();

        let packet = Crypto25519
            .encrypt_and_sign(
                b"hello bob",
                alice.exchange_secret(),
                alice.signing_key(),
                &bob.public_keys().exchange,
                now,
            )
            .unwrap();
        assert_eq!(packet.len(), b"hello bob".len() + SEAL_OVERHEAD);

        let alice_keys = alice.public_keys();
        let plaintext = Crypto25519
            .verify_and_decrypt(
                &packet,
                bob.exchange_secret(),
                &alice_keys.exchange,
                &alice_keys.signing,
                5,
                now,
            )
            .unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn test_open_rejects_stale_packet() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let alice_keys = alice.public_keys();

        let packet = Crypto25519
            .encrypt_and_sign(b"late", alice.exchange_secret(), alice.signing_key(), &bob.public_keys().exchange, 1_000)
            .unwrap();

        let result = Crypto25519.verify_and_decrypt(
            &packet,
            bob.exchange_secret(),
            &alice_keys.exchange,
            &alice_keys.signing,
            5,
            1_006,
        );
        assert!(matches!(result, Err(ProtocolError::StaleMessage { timestamp: 1_000, .. })));

        // Exactly at the edge of the window is still accepted.
        let result = Crypto25519.verify_and_decrypt(
            &packet,
            bob.exchange_secret(),
            &alice_keys.exchange,
            &alice_keys.signing,
            5,
            995,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_zero_skew_disables_freshness_check() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let alice_keys = alice.public_keys();

        let packet = Crypto25519
            .encrypt_and_sign(b"old", alice.exchange_secret(), alice.signing_key(), &bob.public_keys().exchange, 10)
            .unwrap();

        let plaintext = Crypto25519
            .verify_and_decrypt(&packet, bob.exchange_secret(), &alice_keys.exchange, &alice_keys.signing, 0, 10_000)
            .unwrap();
        assert_eq!(plaintext, b"old");
    }

    #[test]
    fn test_open_rejects_wrong_signer() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let mallory = LocalIdentity::generate();
        let now = unix_now();

        let packet = Crypto25519
            .encrypt_and_sign(b"hi", mallory.exchange_secret(), mallory.signing_key(), &bob.public_keys().exchange, now)
            .unwrap();

        let alice_keys = alice.public_keys();
        let result = Crypto25519.verify_and_decrypt(
            &packet,
            bob.exchange_secret(),
            &alice_keys.exchange,
            &alice_keys.signing,
            5,
            now,
        );
        assert!(matches!(result, Err(ProtocolError::InvalidSignature(_))));
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let alice_keys = alice.public_keys();
        let now = unix_now();

        let mut packet = Crypto25519
            .encrypt_and_sign(b"payload", alice.exchange_secret(), alice.signing_key(), &bob.public_keys().exchange, now)
            .unwrap();
        packet[TIMESTAMP_LENGTH] ^= 0x01;

        let result = Crypto25519.verify_and_decrypt(
            &packet,
            bob.exchange_secret(),
            &alice_keys.exchange,
            &alice_keys.signing,
            5,
            now,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_open_rejects_short_packet() {
        let bob = LocalIdentity::generate();
        let keys = LocalIdentity::generate().public_keys();

        let result = Crypto25519.verify_and_decrypt(
            &[0u8; 71],
            bob.exchange_secret(),
            &keys.exchange,
            &keys.signing,
            5,
            0,
        );
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_parse_key_hex_and_base64() {
        let bytes = key("481179010ae65f2bc7508430ac270386953aa75930042e22c184b78b41e95747");
        assert_eq!(
            parse_key("481179010ae65f2bc7508430ac270386953aa75930042e22c184b78b41e95747").unwrap(),
            bytes
        );
        assert_eq!(
            parse_key("481179010AE65F2BC7508430AC270386953AA75930042E22C184B78B41E95747").unwrap(),
            bytes
        );
        assert_eq!(parse_key("SBF5AQrmXyvHUIQwrCcDhpU6p1kwBC4iwYS3i0HpV0c").unwrap(), bytes);
    }

    #[test]
    fn test_parse_key_rejects_wrong_length() {
        assert!(parse_key("abcd").is_err());
        assert!(parse_key("zz").is_err());
    }

    #[test]
    fn test_identity_seed_roundtrip() {
        let original = LocalIdentity::generate();
        let restored = LocalIdentity::from_seeds(&original.exchange_seed(), &original.signing_seed());
        assert_eq!(original.public_keys(), restored.public_keys());
    }

    #[test]
    fn test_peer_keys_text_roundtrip() {
        let keys = LocalIdentity::generate().public_keys();
        let text = PeerKeysText::from(&keys);
        assert_eq!(text.x.len(), 64);
        assert_eq!(PeerKeys::try_from(&text).unwrap(), keys);
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = LocalIdentity::generate().public_keys().fingerprint();
        assert_eq!(fingerprint.len(), 19);
        assert_eq!(fingerprint.matches(':').count(), 3);
    }

    #[test]
    fn test_identity_debug_redacts_secrets() {
        let debug = format!("{:?}", LocalIdentity::generate());
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("fingerprint"));
    }

    #[test]
    fn test_sign_verify() {
        let identity = LocalIdentity::generate();
        let signature = sign(b"message", identity.signing_key());
        assert!(verify(b"message", &signature, &identity.public_keys().signing).is_ok());
        assert!(verify(b"massage", &signature, &identity.public_keys().signing).is_err());
    }
}
