use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::{engine::general_purpose, Engine as _};
use cbc::{Decryptor, Encryptor};
use chrono::Utc;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::{AppError, Result};

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

/// Prefix marking a value as encrypted with the current codec.
const ENC_PREFIX: &str = "enc$";

const KDF_ITERATIONS: u32 = 100_000;

/// Symmetric codec for at-rest secrets (TOTP seeds)
pub struct SecretCodec;

impl SecretCodec {
    /// Key derived once per call from the signing secret and the deployment salt.
    fn derive_key(config: &Config) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            config.jwt.secret.as_bytes(),
            config.jwt.encryption_salt.as_bytes(),
            KDF_ITERATIONS,
            &mut key,
        );
        key
    }

    pub fn encrypt(config: &Config, plaintext: &str) -> Result<String> {
        let key = Self::derive_key(config);
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut iv);

        let pt = plaintext.as_bytes();
        let mut buf = vec![0u8; pt.len() + 16];
        buf[..pt.len()].copy_from_slice(pt);

        let ct = Aes256CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, pt.len())
            .map_err(|_| AppError::Internal("Encrypt failed".to_string()))?;

        let mut packed = Vec::with_capacity(16 + ct.len());
        packed.extend_from_slice(&iv);
        packed.extend_from_slice(ct);
        Ok(format!("{}{}", ENC_PREFIX, general_purpose::STANDARD.encode(packed)))
    }

    pub fn decrypt(config: &Config, stored: &str) -> Result<String> {
        let payload_b64 = stored
            .strip_prefix(ENC_PREFIX)
            .ok_or_else(|| AppError::Internal("Value is not encrypted".to_string()))?;
        let payload = general_purpose::STANDARD
            .decode(payload_b64)
            .map_err(|_| AppError::Internal("Invalid encrypted payload".to_string()))?;
        if payload.len() < 17 {
            return Err(AppError::Internal("Invalid encrypted payload".to_string()));
        }
        let (iv, ct) = payload.split_at(16);
        let key = Self::derive_key(config);

        let mut buf = ct.to_vec();
        let pt = Aes256CbcDec::new(&key.into(), iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| AppError::Internal("Decrypt failed".to_string()))?;
        String::from_utf8(pt.to_vec())
            .map_err(|_| AppError::Internal("Decrypted payload is not UTF-8".to_string()))
    }
}

/// At-rest secret, resolved once at read time by prefix sniffing. Legacy rows
/// predate the encryption migration and are rewritten on next successful use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretValue {
    Encrypted(String),
    LegacyPlaintext(String),
}

impl SecretValue {
    pub fn parse(stored: &str) -> Self {
        if stored.starts_with(ENC_PREFIX) {
            SecretValue::Encrypted(stored.to_string())
        } else {
            SecretValue::LegacyPlaintext(stored.to_string())
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, SecretValue::LegacyPlaintext(_))
    }

    /// Decrypt if encrypted, pass through if legacy plaintext.
    pub fn reveal(&self, config: &Config) -> Result<String> {
        match self {
            SecretValue::Encrypted(stored) => SecretCodec::decrypt(config, stored),
            SecretValue::LegacyPlaintext(plain) => Ok(plain.clone()),
        }
    }
}

/// Hash an OTP code for storage; the session token salts the digest so
/// identical codes never collide across sessions.
pub fn hash_otp_code(otp_code: &str, session_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", session_token, otp_code).as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify an OTP code against its stored hash, comparing digests in
/// constant time.
pub fn verify_otp_hash(otp_code: &str, session_token: &str, stored_hash: &str) -> bool {
    let computed = hash_otp_code(otp_code, session_token);
    constant_time_eq(computed.as_bytes(), stored_hash.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Privacy-preserving IP hash with a daily rotating salt.
pub fn hash_ip_address(ip_address: &str) -> String {
    let daily_salt = Utc::now().format("%Y-%m-%d").to_string();
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", daily_salt, ip_address).as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Opaque session token, 32 bytes of OS randomness
pub fn generate_session_token() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

/// 6-digit numeric OTP from a cryptographically secure generator
pub fn generate_numeric_otp() -> String {
    (0..6)
        .map(|_| char::from(b'0' + OsRng.gen_range(0u8..10)))
        .collect()
}

/// Password strength policy: length, character classes, and a deny-list of
/// common weak substrings (case-insensitive containment).
pub fn validate_password_strength(password: &str) -> std::result::Result<(), String> {
    if password.len() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err("Password must contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err("Password must contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain at least one digit".to_string());
    }
    const SPECIAL: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?/~`";
    if !password.chars().any(|c| SPECIAL.contains(c)) {
        return Err(
            "Password must contain at least one special character (!@#$%^&*...)".to_string(),
        );
    }
    const COMMON_PATTERNS: [&str; 5] = ["password", "123456", "qwerty", "admin", "letmein"];
    let lower = password.to_lowercase();
    for pattern in COMMON_PATTERNS {
        if lower.contains(pattern) {
            return Err(format!("Password contains common weak pattern: {}", pattern));
        }
    }
    Ok(())
}
