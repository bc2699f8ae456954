//! Request-bundle codec (§6 / §18): `base64(IV‖AES-256-CTR(plaintext))`,
//! key = SHA-256 of an operator secret, optionally framed between
//! `-----BEGIN OPENPARCEL BUNDLE-----` / `------END OPENPARCEL BUNDLE------`.
//!
//! Decode-only in production (`opm reqbundle decode`); the encode helper
//! below exists purely so tests can exercise the round trip.

use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const BEGIN_MARKER: &str = "-----BEGIN OPENPARCEL BUNDLE-----";
const END_MARKER: &str = "------END OPENPARCEL BUNDLE------";

#[derive(Debug, thiserror::Error)]
pub enum ReqBundleError {
    #[error("bundle payload is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("bundle payload is shorter than the 16-byte IV")]
    Truncated,
    #[error("decrypted bundle is not valid UTF-8")]
    NotUtf8(#[from] std::string::FromUtf8Error),
}

fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

fn strip_framing(input: &str) -> &str {
    let trimmed = input.trim();
    let without_begin = trimmed.strip_prefix(BEGIN_MARKER).unwrap_or(trimmed);
    let without_end = without_begin.strip_suffix(END_MARKER).unwrap_or(without_begin);
    without_end.trim()
}

pub fn decrypt(secret: &str, bundle: &str) -> Result<String, ReqBundleError> {
    let payload = BASE64.decode(strip_framing(bundle))?;
    if payload.len() < 16 {
        return Err(ReqBundleError::Truncated);
    }
    let (iv, ciphertext) = payload.split_at(16);
    let key = derive_key(secret);
    let mut buf = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), iv.into());
    cipher.apply_keystream(&mut buf);
    Ok(String::from_utf8(buf)?)
}

/// Test-only helper producing a bundle `decrypt` can round-trip.
#[cfg(test)]
pub fn encrypt(secret: &str, iv: [u8; 16], plaintext: &str) -> String {
    let key = derive_key(secret);
    let mut buf = plaintext.as_bytes().to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut buf);
    let mut payload = iv.to_vec();
    payload.extend_from_slice(&buf);
    BASE64.encode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_utf8() {
        let secret = "operator-secret";
        for plaintext in ["hello", "héllo wörld", "{\"json\":true}", "x"] {
            let bundle = encrypt(secret, [7u8; 16], plaintext);
            assert_eq!(decrypt(secret, &bundle).unwrap(), plaintext);
        }
    }

    #[test]
    fn strips_begin_end_framing() {
        let secret = "operator-secret";
        let bundle = encrypt(secret, [3u8; 16], "framed payload");
        let framed = format!("{BEGIN_MARKER}\n{bundle}\n{END_MARKER}");
        assert_eq!(decrypt(secret, &framed).unwrap(), "framed payload");
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = decrypt("secret", &BASE64.encode(b"short")).unwrap_err();
        assert!(matches!(err, ReqBundleError::Truncated));
    }
}
