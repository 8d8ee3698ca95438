//! Per-message cipher envelope carried over the peer data channel.
//!
//! Layout: `[32B chacha key][32B aes key][8B nonce][16B iv][ciphertext]`.
//! The plaintext is encrypted with ChaCha20 (64-bit nonce variant) and the
//! result is encrypted again with AES-256 in 128-bit big-endian counter mode.
//!
//! # Security
//!
//! Both keys travel in clear inside the envelope they protect, so anyone who
//! captures a whole envelope can open it. This layer is obfuscation only and
//! is kept for wire compatibility. Confidentiality on the wire comes from the
//! peer connection's own DTLS; a deployment that needs end-to-end secrecy
//! independent of the transport must replace the embedded keys with a key
//! exchange.

use aes::Aes256;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

pub const CHACHA_KEY_LEN: usize = 32;
pub const AES_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 8;
pub const IV_LEN: usize = 16;
/// Smallest valid envelope: all key material and an empty ciphertext.
pub const HEADER_LEN: usize = CHACHA_KEY_LEN + AES_KEY_LEN + NONCE_LEN + IV_LEN;

const SALT_HALF: usize = NONCE_LEN / 2;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {len} bytes, need at least {HEADER_LEN}")]
    MalformedEnvelope { len: usize },
    #[error("decrypted payload is not valid utf-8: {0}")]
    DecodingError(#[from] std::string::FromUtf8Error),
    #[error("cipher setup failed: {0}")]
    Cipher(String),
}

/// Two salt components the nonce is derived from. The nonce is the first four
/// bytes of `first` followed by the last four bytes of `second`; shorter
/// components are zero-padded (after `first`, before `second`).
///
/// This derivation is deterministic and not a cryptographic construction.
#[derive(Debug, Clone, Copy)]
pub struct ContextSalt<'a> {
    pub first: &'a [u8],
    pub second: &'a [u8],
}

impl<'a> ContextSalt<'a> {
    pub fn new(first: &'a [u8], second: &'a [u8]) -> Self {
        Self { first, second }
    }

    /// Salt for a message travelling from `sender` to `recipient`.
    pub fn for_route(sender: &'a str, recipient: &'a str) -> Self {
        Self::new(sender.as_bytes(), recipient.as_bytes())
    }

    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        let head = self.first.len().min(SALT_HALF);
        nonce[..head].copy_from_slice(&self.first[..head]);
        let tail = self.second.len().min(SALT_HALF);
        nonce[NONCE_LEN - tail..].copy_from_slice(&self.second[self.second.len() - tail..]);
        nonce
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    chacha_key: [u8; CHACHA_KEY_LEN],
    aes_key: [u8; AES_KEY_LEN],
    nonce: [u8; NONCE_LEN],
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
}

impl CipherEnvelope {
    /// Encrypts `plaintext` under freshly generated keys and IV.
    pub fn seal(plaintext: &str, salt: &ContextSalt<'_>) -> Result<Self, EnvelopeError> {
        let mut chacha_key = [0u8; CHACHA_KEY_LEN];
        let mut aes_key = [0u8; AES_KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut chacha_key);
        OsRng.fill_bytes(&mut aes_key);
        OsRng.fill_bytes(&mut iv);
        let nonce = salt.nonce();

        let mut ciphertext = plaintext.as_bytes().to_vec();
        chacha_stream(&chacha_key, &nonce)?.apply_keystream(&mut ciphertext);
        aes_stream(&aes_key, &iv)?.apply_keystream(&mut ciphertext);

        Ok(Self {
            chacha_key,
            aes_key,
            nonce,
            iv,
            ciphertext,
        })
    }

    /// Splits raw bytes into the fixed-order fields.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < HEADER_LEN {
            return Err(EnvelopeError::MalformedEnvelope { len: bytes.len() });
        }
        let (chacha_key, rest) = bytes.split_at(CHACHA_KEY_LEN);
        let (aes_key, rest) = rest.split_at(AES_KEY_LEN);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (iv, ciphertext) = rest.split_at(IV_LEN);
        Ok(Self {
            chacha_key: fixed(chacha_key)?,
            aes_key: fixed(aes_key)?,
            nonce: fixed(nonce)?,
            iv: fixed(iv)?,
            ciphertext: ciphertext.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.chacha_key);
        out.extend_from_slice(&self.aes_key);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Reverses the AES-CTR layer, then the ChaCha20 layer.
    pub fn open(&self) -> Result<String, EnvelopeError> {
        let mut plaintext = self.ciphertext.clone();
        aes_stream(&self.aes_key, &self.iv)?.apply_keystream(&mut plaintext);
        chacha_stream(&self.chacha_key, &self.nonce)?.apply_keystream(&mut plaintext);
        Ok(String::from_utf8(plaintext)?)
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }
}

impl std::fmt::Debug for CipherEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherEnvelope")
            .field("nonce", &self.nonce)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Seals `plaintext` and serializes the envelope.
pub fn seal(plaintext: &str, salt: &ContextSalt<'_>) -> Result<Vec<u8>, EnvelopeError> {
    Ok(CipherEnvelope::seal(plaintext, salt)?.to_bytes())
}

/// Parses and decrypts a serialized envelope.
pub fn open(envelope: &[u8]) -> Result<String, EnvelopeError> {
    CipherEnvelope::from_bytes(envelope)?.open()
}

fn chacha_stream(key: &[u8], nonce: &[u8]) -> Result<ChaCha20Legacy, EnvelopeError> {
    ChaCha20Legacy::new_from_slices(key, nonce)
        .map_err(|err| EnvelopeError::Cipher(format!("chacha20: {err}")))
}

fn aes_stream(key: &[u8], iv: &[u8]) -> Result<Aes256Ctr, EnvelopeError> {
    Aes256Ctr::new_from_slices(key, iv).map_err(|err| EnvelopeError::Cipher(format!("aes-ctr: {err}")))
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], EnvelopeError> {
    bytes
        .try_into()
        .map_err(|_| EnvelopeError::MalformedEnvelope { len: bytes.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn salt() -> ContextSalt<'static> {
        ContextSalt::for_route("alice@example", "bob@example")
    }

    #[test]
    fn seal_then_open_returns_plaintext() {
        for text in ["hi", "", "multi\nline message", "snowman \u{2603} and emoji \u{1F600}"] {
            let sealed = seal(text, &salt()).unwrap();
            assert_eq!(sealed.len(), HEADER_LEN + text.len());
            assert_eq!(open(&sealed).unwrap(), text);
        }
    }

    #[test]
    fn random_printable_messages_survive_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let len = rng.gen_range(0..512);
            let text: String = (0..len)
                .map(|_| rng.gen_range(0x20u8..0x7f) as char)
                .collect();
            let first: Vec<u8> = (0..rng.gen_range(4..16)).map(|_| rng.gen()).collect();
            let second: Vec<u8> = (0..rng.gen_range(4..16)).map(|_| rng.gen()).collect();
            let sealed = seal(&text, &ContextSalt::new(&first, &second)).unwrap();
            assert_eq!(open(&sealed).unwrap(), text);
        }
    }

    #[test]
    fn layout_places_fields_in_fixed_order() {
        let envelope = CipherEnvelope::seal("payload", &salt()).unwrap();
        let bytes = envelope.to_bytes();
        let nonce_at = CHACHA_KEY_LEN + AES_KEY_LEN;
        assert_eq!(&bytes[nonce_at..nonce_at + NONCE_LEN], salt().nonce().as_slice());
        assert_eq!(&bytes[HEADER_LEN..], envelope.ciphertext());
        assert_eq!(CipherEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn nonce_takes_head_of_first_and_tail_of_second() {
        let nonce = ContextSalt::new(b"abcdefg", b"uvwxyz").nonce();
        assert_eq!(&nonce, b"abcdwxyz");
    }

    #[test]
    fn short_salt_components_are_zero_padded() {
        let nonce = ContextSalt::for_route("al", "bob").nonce();
        assert_eq!(nonce, [b'a', b'l', 0, 0, 0, b'b', b'o', b'b']);
    }

    #[test]
    fn fresh_keys_per_message() {
        let a = seal("same text", &salt()).unwrap();
        let b = seal("same text", &salt()).unwrap();
        assert_ne!(a[..CHACHA_KEY_LEN + AES_KEY_LEN], b[..CHACHA_KEY_LEN + AES_KEY_LEN]);
        assert_ne!(a[HEADER_LEN..], b[HEADER_LEN..]);
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        let err = open(&[0u8; HEADER_LEN - 1]).unwrap_err();
        assert!(matches!(err, EnvelopeError::MalformedEnvelope { len } if len == HEADER_LEN - 1));
    }

    #[test]
    fn header_only_envelope_opens_to_empty_text() {
        assert_eq!(open(&[7u8; HEADER_LEN]).unwrap(), "");
    }

    #[test]
    fn flipped_ciphertext_byte_never_yields_original() {
        let text = "meet at the usual place";
        let sealed = seal(text, &salt()).unwrap();
        for index in HEADER_LEN..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[index] ^= 0x01;
            match open(&tampered) {
                Ok(opened) => assert_ne!(opened, text, "flip at {index}"),
                Err(EnvelopeError::DecodingError(_)) => {}
                Err(other) => panic!("unexpected error {other}"),
            }
        }
    }

    #[test]
    fn invalid_utf8_surfaces_decoding_error() {
        let mut sealed = seal("a", &salt()).unwrap();
        // Force the single plaintext byte to 0xff.
        let last = sealed.len() - 1;
        sealed[last] ^= b'a' ^ 0xff;
        assert!(matches!(open(&sealed), Err(EnvelopeError::DecodingError(_))));
    }
}
