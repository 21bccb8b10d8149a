use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_box::SecretKey;

/// Failure classes the check-in endpoint must tell apart: a server without
/// key material answers differently than a bad ciphertext.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("server private key is missing or malformed")]
    Configuration,
    #[error("ciphertext is malformed or failed authentication")]
    Decryption,
}

/// Sealed-box decryptor bound to the server keypair.
///
/// Holds the X25519 secret key loaded once at startup. A server started
/// without usable key material still runs; every decrypt attempt then
/// reports `CodecError::Configuration` so the endpoint can answer with the
/// key-missing sentinel instead of crashing.
pub struct SealedCodec {
    secret: Option<SecretKey>,
}

impl SealedCodec {
    pub fn new(secret: SecretKey) -> Self {
        Self {
            secret: Some(secret),
        }
    }

    /// Codec without key material; decrypts always fail with `Configuration`.
    pub fn unconfigured() -> Self {
        Self { secret: None }
    }

    /// Loads the secret key from its base64 encoding (32 raw bytes).
    pub fn from_base64(encoded: &str) -> Result<Self, CodecError> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|_| CodecError::Configuration)?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::Configuration)?;
        Ok(Self::new(SecretKey::from(bytes)))
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Base64 public key matching the loaded secret, for provisioning devices.
    pub fn public_key_b64(&self) -> Option<String> {
        self.secret
            .as_ref()
            .map(|sk| BASE64.encode(sk.public_key().as_bytes()))
    }

    /// Opens a base64-encoded sealed box addressed to the server's public key.
    ///
    /// Returns the exact original plaintext or fails whole: a tampered or
    /// wrong-key ciphertext never yields corrupted bytes.
    pub fn decrypt_b64(&self, ciphertext_b64: &str) -> Result<Vec<u8>, CodecError> {
        let secret = self.secret.as_ref().ok_or(CodecError::Configuration)?;
        let ciphertext = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|_| CodecError::Decryption)?;
        secret.unseal(&ciphertext).map_err(|_| CodecError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_box::aead::OsRng;

    fn keypair_codec() -> (SealedCodec, crypto_box::PublicKey) {
        let sk = SecretKey::generate(&mut OsRng);
        let pk = sk.public_key();
        (SealedCodec::new(sk), pk)
    }

    fn seal_b64(pk: &crypto_box::PublicKey, msg: &[u8]) -> String {
        let sealed = pk.seal(&mut OsRng, msg).unwrap();
        BASE64.encode(sealed)
    }

    #[test]
    fn round_trip() {
        let (codec, pk) = keypair_codec();
        let msg = b"{\"SN\":\"A1\"}";
        let plaintext = codec.decrypt_b64(&seal_b64(&pk, msg)).unwrap();
        assert_eq!(plaintext, msg);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (codec, pk) = keypair_codec();
        let sealed = pk.seal(&mut OsRng, b"payload").unwrap();
        for i in 0..sealed.len() {
            let mut corrupt = sealed.clone();
            corrupt[i] ^= 0x01;
            assert_eq!(
                codec.decrypt_b64(&BASE64.encode(&corrupt)),
                Err(CodecError::Decryption),
                "bit flip at byte {i} was accepted"
            );
        }
    }

    #[test]
    fn garbage_base64_fails() {
        let (codec, _) = keypair_codec();
        assert_eq!(
            codec.decrypt_b64("not even base64!!"),
            Err(CodecError::Decryption)
        );
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let (codec, pk) = keypair_codec();
        let sealed = pk.seal(&mut OsRng, b"payload").unwrap();
        let truncated = BASE64.encode(&sealed[..16]);
        assert_eq!(codec.decrypt_b64(&truncated), Err(CodecError::Decryption));
    }

    #[test]
    fn wrong_key_fails() {
        let (_, pk) = keypair_codec();
        let (other, _) = keypair_codec();
        assert_eq!(
            other.decrypt_b64(&seal_b64(&pk, b"payload")),
            Err(CodecError::Decryption)
        );
    }

    #[test]
    fn unconfigured_reports_configuration_failure() {
        let codec = SealedCodec::unconfigured();
        assert_eq!(codec.decrypt_b64("AAAA"), Err(CodecError::Configuration));
        assert!(codec.public_key_b64().is_none());
    }

    #[test]
    fn secret_key_base64_round_trip() {
        let sk = SecretKey::generate(&mut OsRng);
        let encoded = BASE64.encode(sk.to_bytes());
        let codec = SealedCodec::from_base64(&encoded).unwrap();
        let msg = b"hello";
        let plaintext = codec.decrypt_b64(&seal_b64(&sk.public_key(), msg)).unwrap();
        assert_eq!(plaintext, msg);
    }

    #[test]
    fn malformed_secret_key_rejected() {
        assert!(SealedCodec::from_base64("!!!").is_err());
        assert!(SealedCodec::from_base64(&BASE64.encode([0u8; 16])).is_err());
    }
}
