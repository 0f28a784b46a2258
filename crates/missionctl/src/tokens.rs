use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

const TOKEN_LEN: usize = 48;
const SALT_LEN: usize = 16;

/// Generate a fresh agent bearer token. Returned once to the caller,
/// only the hash is persisted.
pub fn generate_token() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("mct_{}", suffix)
}

/// Salted SHA-256 digest, stored as `hex(salt)$hex(sha256(salt || token))`.
/// Every call draws a fresh salt, so equal tokens hash differently.
pub fn hash_token(token: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::thread_rng().gen();
    hash_with_salt(&salt, token)
}

fn hash_with_salt(salt: &[u8], token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(token.as_bytes());
    format!("{}${}", hex::encode(salt), hex::encode(hasher.finalize()))
}

pub fn token_matches(token: &str, stored_hash: &str) -> bool {
    let Some((salt_hex, _)) = stored_hash.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    hash_with_salt(&salt, token) == stored_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_and_prefixed() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert!(a.starts_with("mct_"));
        assert_eq!(a.len(), 4 + TOKEN_LEN);
    }

    #[test]
    fn hashes_are_salted_per_call() {
        let first = hash_token("secret");
        let second = hash_token("secret");
        assert_ne!(first, second);
        assert!(token_matches("secret", &first));
        assert!(token_matches("secret", &second));
    }

    #[test]
    fn stored_format_is_salt_dollar_digest() {
        let stored = hash_token("secret");
        let (salt_hex, digest_hex) = stored.split_once('$').unwrap();
        assert_eq!(salt_hex.len(), SALT_LEN * 2);
        assert_eq!(digest_hex.len(), 64);
        assert!(!token_matches("other", &stored));
    }

    #[test]
    fn malformed_stored_hashes_never_match() {
        assert!(!token_matches("secret", "no-separator"));
        assert!(!token_matches("secret", "zz$deadbeef"));
    }
}
