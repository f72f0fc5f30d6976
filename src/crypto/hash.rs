//! HMAC-SHA256 passage hashes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex-encoded HMAC-SHA256 of `data` under `secret`.
pub fn create_hash(secret: &str, data: &str) -> String {
    // HMAC accepts keys of any length, so this constructor cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key size"),
    };
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compare a supplied hash to a computed one in constant time.
///
/// Hex case is not normalized: the vendor emits lowercase and so do we.
pub fn hashes_match(given: &str, expected: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_hash_rfc4231_case_2() {
        // RFC 4231 test case 2
        let hash = create_hash("Jefe", "what do ya want for nothing?");
        assert_eq!(
            hash,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_create_hash_is_lowercase_hex() {
        let hash = create_hash("secret", "payload");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_different_secrets_differ() {
        assert_ne!(create_hash("a", "payload"), create_hash("b", "payload"));
    }

    #[test]
    fn test_hashes_match() {
        let hash = create_hash("secret", "payload");
        assert!(hashes_match(&hash, &hash.clone()));
        assert!(!hashes_match(&hash, &create_hash("secret", "payload2")));
        assert!(!hashes_match("", &hash));
        assert!(!hashes_match(&hash[..63], &hash));
    }
}
