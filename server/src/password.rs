use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use color_eyre::eyre::eyre;

/// Hash a plaintext password into a salted Argon2id PHC string.
///
/// A hashing failure is fatal to whatever write triggered it, so this
/// returns an error instead of a sentinel value.
pub fn hash(plaintext: &str) -> color_eyre::Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let digest = Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|e| eyre!("failed to hash password: {e}"))?
        .to_string();

    Ok(digest)
}

/// Check a plaintext password against a stored digest. An unparsable digest
/// counts as a mismatch.
pub fn verify(plaintext: &str, digest: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(digest) else {
        return false;
    };

    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_accepts_the_password() {
        let digest = hash("pw123").unwrap();
        assert!(verify("pw123", &digest));
    }

    #[test]
    fn wrong_password_is_rejected() {
        let digest = hash("pw123").unwrap();
        assert!(!verify("pw124", &digest));
    }

    #[test]
    fn digest_is_not_the_plaintext() {
        let digest = hash("pw123").unwrap();
        assert_ne!(digest, "pw123");
        assert!(digest.starts_with("$argon2"));
    }

    #[test]
    fn hashes_are_salted() {
        let first = hash("pw123").unwrap();
        let second = hash("pw123").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn garbage_digest_never_verifies() {
        assert!(!verify("pw123", "not-a-phc-string"));
        assert!(!verify("pw123", ""));
    }
}
