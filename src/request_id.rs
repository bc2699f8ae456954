//! Request UUID generation (spec.md §7 / §16):
//! `millis || md5(path)[-8:] || md5(headers)[-12:] || 2 random bytes`, hex.

use md5::{Digest, Md5};
use rand::RngCore;

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn last_n(s: &str, n: usize) -> &str {
    if s.len() <= n { s } else { &s[s.len() - n..] }
}

/// `headers` should be a stable, deterministic rendering of the request's
/// headers (e.g. sorted `name:value` pairs joined by `\n`).
pub fn generate(path: &str, headers: &str, now_millis: u64) -> String {
    let path_digest = last_n(&md5_hex(path), 8);
    let headers_digest = last_n(&md5_hex(headers), 12);
    let mut random_bytes = [0u8; 2];
    rand::thread_rng().fill_bytes(&mut random_bytes);

    format!(
        "{:x}{}{}{}",
        now_millis,
        path_digest,
        headers_digest,
        hex::encode(random_bytes)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_given_fixed_inputs_except_the_random_suffix() {
        let id_a = generate("/track/ctt/RR123", "host:example.com", 1_700_000_000_000);
        let id_b = generate("/track/ctt/RR123", "host:example.com", 1_700_000_000_000);
        // Millis + path-hash + header-hash prefix is identical...
        assert_eq!(&id_a[..id_a.len() - 4], &id_b[..id_b.len() - 4]);
        // ...only the trailing 2 random bytes (4 hex chars) may differ.
    }

    #[test]
    fn produces_fixed_length_hex() {
        let id = generate("/ping", "", 1_700_000_000_000);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // millis hex length varies; path(8) + headers(12) + random(4) = 24
        // trailing hex chars are fixed-width.
        assert_eq!(&id[id.len() - 24..].len(), &24);
    }
}
