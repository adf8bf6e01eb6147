use anyhow::{Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::{rngs::OsRng, Rng, RngCore};
use zeroize::Zeroizing;

use super::model::ValidationError;

const PIN_LEN: usize = 4;
const SALT_LEN: usize = 32;

/// Validate the user-chosen PIN: exactly four ASCII letters or digits.
pub fn validate_pin(pin: &str) -> Result<(), ValidationError> {
    if pin.len() == PIN_LEN && pin.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(ValidationError::new(
            "PIN must be exactly 4 letters or digits",
        ))
    }
}

/// Generate a fresh 32-byte random salt, hex encoded.
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    hex::encode(salt)
}

/// Derive the stored digest of `pin` using Argon2id and the hex `salt`.
pub fn hash_pin(pin: &str, salt_hex: &str) -> Result<String> {
    let salt = hex::decode(salt_hex).context("PIN salt is not hex")?;

    let params = Params::new(
        19_456, // m_cost: 19 MiB
        2,      // t_cost: 2 iterations
        1,      // p_cost: 1 lane
        Some(32),
    )
    .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(pin.as_bytes(), &salt, &mut *out)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;

    Ok(hex::encode(&*out))
}

/// Recompute the digest and compare in constant time.
pub fn verify_pin(pin: &str, salt_hex: &str, expected_hash: &str) -> Result<bool> {
    let computed = hash_pin(pin, salt_hex)?;
    Ok(constant_time_eq::constant_time_eq(
        computed.as_bytes(),
        expected_hash.as_bytes(),
    ))
}

/// Random zero-padded six-digit id for PIN shares.
pub fn new_pin_id() -> String {
    format!("{:06}", OsRng.gen_range(0..1_000_000u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::is_pin_id;

    #[test]
    fn pin_shape() {
        assert!(validate_pin("a1B2").is_ok());
        assert!(validate_pin("0000").is_ok());
        assert!(validate_pin("123").is_err());
        assert!(validate_pin("12345").is_err());
        assert!(validate_pin("12-4").is_err());
        assert!(validate_pin("12é").is_err());
    }

    #[test]
    fn salt_is_64_hex_chars() {
        let salt = generate_salt();
        assert_eq!(salt.len(), 64);
        assert!(hex::decode(&salt).is_ok());
        assert_ne!(salt, generate_salt());
    }

    #[test]
    fn hash_is_deterministic_per_salt() {
        let salt = generate_salt();
        let a = hash_pin("ab12", &salt).unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, hash_pin("ab12", &salt).unwrap());
        assert_ne!(a, hash_pin("ab12", &generate_salt()).unwrap());
    }

    #[test]
    fn verify_accepts_only_the_right_pin() {
        let salt = generate_salt();
        let hash = hash_pin("7Kq2", &salt).unwrap();
        assert!(verify_pin("7Kq2", &salt, &hash).unwrap());
        assert!(!verify_pin("7kq2", &salt, &hash).unwrap());
    }

    #[test]
    fn bad_salt_is_an_error() {
        assert!(hash_pin("1234", "zz").is_err());
    }

    #[test]
    fn pin_ids_are_six_digits() {
        for _ in 0..50 {
            assert!(is_pin_id(&new_pin_id()));
        }
    }
}
