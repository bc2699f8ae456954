//! Authentication (external interface, §6 / §16): PBKDF2-HMAC-SHA-256
//! password hashing and the `username:secret` credential resolution the
//! core only needs as "given a credential, return a user identity or
//! fail".

use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{OpenParcelError, Result};
use crate::model::User;
use crate::store::ParcelStore;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

pub fn hash_password(password: &str) -> (String, String) {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = pbkdf2_hash(password, &salt);
    (hex::encode(salt), hex::encode(hash))
}

pub fn verify_password(password: &str, salt_hex: &str, hash_hex: &str) -> bool {
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(hash_hex) else {
        return false;
    };
    let actual = pbkdf2_hash(password, &salt);
    actual == expected
}

fn pbkdf2_hash(password: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out)
        .expect("HASH_LEN is a valid PBKDF2 output length");
    out
}

/// Username length [3,30], `^[a-z][a-z0-9_]+$` (spec.md §8).
pub fn is_username_valid(username: &str) -> bool {
    if username.len() < 3 || username.len() > 30 {
        return false;
    }
    let mut chars = username.chars();
    let Some(first) = chars.next() else { return false };
    first.is_ascii_lowercase() && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Password length [6,250] (spec.md §8).
pub fn is_password_valid(password: &str) -> bool {
    (6..=250).contains(&password.len())
}

pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    /// Parses `username:secret`, as carried in `auth=` or `X-Auth-Token:`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (username, secret) = raw.split_once(':')?;
        if username.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            secret: secret.to_string(),
        })
    }
}

/// Resolves `credentials` to a `User`, either via an active auth token
/// matching the username, or via password verification.
pub async fn authenticate(store: &ParcelStore, credentials: &Credentials) -> Result<User> {
    let user = store
        .find_user_by_username(&credentials.username)
        .await?
        .ok_or(OpenParcelError::AuthenticationFailed { status_code: 422 })?;

    if let Some(token_row) = store.find_auth_token(&credentials.secret).await? {
        if token_row.user_id == user.id {
            return Ok(user);
        }
    }

    if verify_password(&credentials.secret, &user.salt, &user.password_hash) {
        return Ok(user);
    }

    Err(OpenParcelError::AuthenticationFailed { status_code: 422 })
}

pub fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trips() {
        let (salt, hash) = hash_password("correct horse battery staple");
        assert!(verify_password("correct horse battery staple", &salt, &hash));
        assert!(!verify_password("wrong password", &salt, &hash));
    }

    #[test]
    fn username_validation_boundaries() {
        assert!(is_username_valid("ab_c"));
        assert!(!is_username_valid("ab")); // too short
        assert!(!is_username_valid("Abc")); // uppercase first char
        assert!(!is_username_valid("1abc")); // must start with a letter
    }

    #[test]
    fn password_validation_boundaries() {
        assert!(is_password_valid("abcdef"));
        assert!(!is_password_valid("short"));
        assert!(is_password_valid(&"a".repeat(250)));
        assert!(!is_password_valid(&"a".repeat(251)));
    }

    #[test]
    fn credentials_parse_username_colon_secret() {
        let creds = Credentials::parse("alice:s3cret").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.secret, "s3cret");
        assert!(Credentials::parse("no-colon-here").is_none());
    }
}
