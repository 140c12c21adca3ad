use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::error;

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"!@#$%^&*-_";

/// One-time credential for Moodle accounts created during a manual sync
/// without an explicit password. One character from every class keeps it
/// acceptable under Moodle's default password policy; it is never stored
/// or returned, so the account effectively requires a reset to log in.
pub fn generate_one_time_password() -> String {
    let mut rng = OsRng;
    let mut chars: Vec<u8> = vec![
        *LOWER.choose(&mut rng).unwrap_or(&b'a'),
        *UPPER.choose(&mut rng).unwrap_or(&b'A'),
        *DIGITS.choose(&mut rng).unwrap_or(&b'2'),
        *SYMBOLS.choose(&mut rng).unwrap_or(&b'!'),
    ];
    let all: Vec<u8> = [LOWER, UPPER, DIGITS, SYMBOLS].concat();
    for _ in 0..20 {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);
    chars.into_iter().map(char::from).collect()
}
