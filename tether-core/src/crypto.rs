//! Per-session application-layer crypto.
//!
//! ```text
//! A: (sk_A, pk_A)                 B: (sk_B, pk_B)        ephemeral P-256
//!
//! shared      = ECDH(sk_A, pk_B) == ECDH(sk_B, pk_A)
//! session_key = HKDF-SHA-256(ikm = shared, salt = none,
//!                            info = "tether-session-key-v1", L = 32)
//!
//! sealed      = nonce(12) ‖ AES-256-GCM(session_key, nonce, m) ‖ tag(16)
//! ```
//!
//! The key pair is handed to the connection over the already authenticated
//! signaling channel, so the derived key is independent of whatever secures
//! the transport underneath.

use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use sha2::Sha256;
use thiserror::Error;

use crate::error::{ErrorCode, RelayError};
use crate::protocol::KeyPairPayload;

/// Length of a derived session key.
pub const SESSION_KEY_LEN: usize = 32;
/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

const HKDF_INFO: &[u8] = b"tether-session-key-v1";

/// A derived symmetric session key.
pub type SessionKey = [u8; SESSION_KEY_LEN];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid base64 encoding")]
    Encoding,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Encryption,
    #[error("sealed message shorter than nonce and tag")]
    Truncated,
    #[error("authentication tag mismatch")]
    VerificationFailed,
}

impl From<CryptoError> for RelayError {
    fn from(err: CryptoError) -> Self {
        let code = match err {
            CryptoError::InvalidPrivateKey
            | CryptoError::InvalidPublicKey
            | CryptoError::Encoding => ErrorCode::InvalidKey,
            CryptoError::Truncated | CryptoError::VerificationFailed => {
                ErrorCode::CryptoVerificationFailed
            }
            CryptoError::KeyDerivation | CryptoError::Encryption => ErrorCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}

/// An ephemeral P-256 key pair generated for one connection.
pub struct EphemeralKeyPair {
    secret: SecretKey,
}

impl EphemeralKeyPair {
    /// Generates a fresh random key pair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// SEC1 uncompressed encoding of the public point (65 bytes).
    #[must_use]
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Raw big-endian scalar (32 bytes).
    #[must_use]
    pub fn private_key_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    /// Base64 form sent to the connection in its hello acknowledgement.
    #[must_use]
    pub fn to_payload(&self) -> KeyPairPayload {
        KeyPairPayload {
            public_key: encode_b64(&self.public_key_bytes()),
            private_key: encode_b64(&self.private_key_bytes()),
        }
    }
}

/// Derives the 32-byte session key from our private scalar and the peer's
/// SEC1-encoded public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPrivateKey`] / [`CryptoError::InvalidPublicKey`]
/// when either key fails to parse.
pub fn derive_session_key(
    private_key: &[u8],
    peer_public_key: &[u8],
) -> Result<SessionKey, CryptoError> {
    let secret = SecretKey::from_slice(private_key).map_err(|_| CryptoError::InvalidPrivateKey)?;
    let public =
        PublicKey::from_sec1_bytes(peer_public_key).map_err(|_| CryptoError::InvalidPublicKey)?;

    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    let hkdf = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());

    let mut key = [0u8; SESSION_KEY_LEN];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

/// Seals `plaintext` under `key` with a fresh random nonce.
///
/// Output layout: `nonce(12) ‖ ciphertext ‖ tag(16)`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD rejects the input.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Opens a message produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::Truncated`] for inputs shorter than nonce + tag and
/// [`CryptoError::VerificationFailed`] when the tag does not verify.
pub fn decrypt(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::VerificationFailed)?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::VerificationFailed)
}

#[must_use]
pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// # Errors
///
/// Returns [`CryptoError::Encoding`] if `text` is not standard base64.
pub fn decode_b64(text: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD.decode(text).map_err(|_| CryptoError::Encoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derive_pair() -> (SessionKey, SessionKey) {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let k_a = derive_session_key(&alice.private_key_bytes(), &bob.public_key_bytes()).unwrap();
        let k_b = derive_session_key(&bob.private_key_bytes(), &alice.public_key_bytes()).unwrap();
        (k_a, k_b)
    }

    #[test]
    fn given_two_key_pairs_when_deriving_both_ways_then_keys_match() {
        let (k_a, k_b) = derive_pair();
        assert_eq!(k_a, k_b, "ECDH + HKDF must be symmetric");
        assert_ne!(k_a, [0u8; SESSION_KEY_LEN]);
    }

    #[test]
    fn given_unrelated_pairs_when_deriving_then_keys_differ() {
        let (k1, _) = derive_pair();
        let (k2, _) = derive_pair();
        assert_ne!(k1, k2);
    }

    #[test]
    fn given_generated_pair_when_encoded_then_lengths_match_sec1_and_scalar() {
        let pair = EphemeralKeyPair::generate();
        assert_eq!(pair.public_key_bytes().len(), 65);
        assert_eq!(pair.public_key_bytes()[0], 0x04);
        assert_eq!(pair.private_key_bytes().len(), 32);
    }

    #[test]
    fn given_payload_when_decoded_then_derives_same_key_as_raw_bytes() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let payload = alice.to_payload();

        let private = decode_b64(&payload.private_key).unwrap();
        let from_payload = derive_session_key(&private, &bob.public_key_bytes()).unwrap();
        let from_raw = derive_session_key(&alice.private_key_bytes(), &bob.public_key_bytes()).unwrap();
        assert_eq!(from_payload, from_raw);
    }

    #[test]
    fn given_garbage_public_key_when_deriving_then_invalid_public_key() {
        let alice = EphemeralKeyPair::generate();
        let err = derive_session_key(&alice.private_key_bytes(), &[0x04; 10]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidPublicKey);
    }

    #[test]
    fn given_zero_private_key_when_deriving_then_invalid_private_key() {
        let bob = EphemeralKeyPair::generate();
        let err = derive_session_key(&[0u8; 32], &bob.public_key_bytes()).unwrap_err();
        assert_eq!(err, CryptoError::InvalidPrivateKey);
    }

    #[test]
    fn given_message_when_sealed_and_opened_then_plaintext_is_recovered() {
        let (key, _) = derive_pair();
        for message in [&b""[..], &b"x"[..], &b"remote control frame"[..], &[0xAB; 9000][..]] {
            let sealed = encrypt(&key, message).unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + message.len() + TAG_LEN);
            assert_eq!(decrypt(&key, &sealed).unwrap(), message);
        }
    }

    #[test]
    fn given_same_message_when_sealed_twice_then_nonces_differ() {
        let (key, _) = derive_pair();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn given_flipped_ciphertext_bit_when_opened_then_verification_fails() {
        let (key, _) = derive_pair();
        let mut sealed = encrypt(&key, b"do not touch").unwrap();
        sealed[NONCE_LEN] ^= 0x01;
        assert_eq!(decrypt(&key, &sealed), Err(CryptoError::VerificationFailed));
    }

    #[test]
    fn given_flipped_tag_bit_when_opened_then_verification_fails() {
        let (key, _) = derive_pair();
        let mut sealed = encrypt(&key, b"do not touch").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert_eq!(decrypt(&key, &sealed), Err(CryptoError::VerificationFailed));
    }

    #[test]
    fn given_wrong_key_when_opened_then_verification_fails() {
        let (key, _) = derive_pair();
        let (other, _) = derive_pair();
        let sealed = encrypt(&key, b"secret").unwrap();
        assert_eq!(decrypt(&other, &sealed), Err(CryptoError::VerificationFailed));
    }

    #[test]
    fn given_short_input_when_opened_then_truncated_maps_to_verification_code() {
        let (key, _) = derive_pair();
        let err = decrypt(&key, &[0u8; NONCE_LEN + TAG_LEN - 1]).unwrap_err();
        assert_eq!(err, CryptoError::Truncated);
        assert_eq!(
            RelayError::from(err).code,
            ErrorCode::CryptoVerificationFailed
        );
    }
}
